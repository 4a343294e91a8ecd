//! Capability traits implemented by endpoints, one per stage.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::feed::{FeedHandle, KeyCase, SearchSummary};
use crate::models::record::{Record, RecordMap};
use crate::operation::Operation;
use crate::settings::{SearchSourceSettings, Settings};
use crate::storage::project_root::ProjectRoot;

/// How far the heuristic of a source can be trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeuristicStatus {
    #[default]
    Supported,
    Experimental,
    Unsupported,
}

/// Guidance shown by `status` for data endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Advice {
    pub msg: String,
    pub detailed_msg: String,
}

/// A search source bound to its settings entry.
#[derive(Clone)]
pub struct BoundSource {
    pub settings: SearchSourceSettings,
    pub endpoint: Arc<dyn SearchSourceEndpoint>,
}

impl std::fmt::Debug for BoundSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSource")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Everything a search call needs.
pub struct SearchContext<'a> {
    pub op: &'a Operation<'a>,
    pub source: &'a SearchSourceSettings,
    /// Present for sources that materialize an upstream query.
    pub feed: Option<FeedHandle>,
    pub rerun: bool,
}

/// Everything a prep call needs besides the record.
pub struct PrepContext<'a> {
    pub op: &'a Operation<'a>,
    pub sources: &'a [BoundSource],
}

impl PrepContext<'_> {
    /// The source whose feed produced `origin`.
    pub fn source_for_origin(&self, origin: &str) -> Option<&BoundSource> {
        let feed = origin.split_once('/').map(|(feed, _)| feed)?;
        self.sources.iter().find(|s| s.settings.feed_name() == feed)
    }
}

// ─── Capabilities ──────────────────────────────────────────

pub trait ReviewTypeEndpoint: Send + Sync {
    /// Fills in the stage endpoint lists of a fresh project.
    fn initialize(&self, settings: &mut Settings) -> Result<()>;
}

pub trait SearchSourceEndpoint: Send + Sync {
    /// Field used as feed primary key.
    fn source_identifier(&self) -> &str;

    fn key_case(&self) -> KeyCase {
        KeyCase::AsIs
    }

    fn heuristic_status(&self) -> HeuristicStatus {
        HeuristicStatus::Supported
    }

    /// Confidence in `[0, 1]` that `filename` with `content` belongs to this source.
    fn heuristic(&self, filename: &Path, content: &str) -> f64;

    /// Validates parameters and returns the settings entry for a new source.
    fn add_endpoint(&self, params: &toml::Table, project: &ProjectRoot) -> Result<SearchSourceSettings>;

    fn search(&self, ctx: &SearchContext<'_>) -> Result<SearchSummary>;

    /// Links a record to this source's metadata. Sources without a lookup
    /// leave the record unchanged.
    fn prep_link_md(
        &self,
        _op: &Operation<'_>,
        _record: &mut Record,
        _save_feed: bool,
        _timeout: Duration,
    ) -> Result<()> {
        Ok(())
    }

    /// Records of the source keyed by feed-local id.
    fn load(&self, op: &Operation<'_>, source: &SearchSourceSettings) -> Result<RecordMap>;

    /// Source-specific cleanup of a loaded record.
    fn prepare(&self, record: &mut Record, source: &SearchSourceSettings) -> Result<()>;

    /// Whether pages come back in deposit order, allowing non-rerun searches
    /// to stop at the first page without new records.
    fn preserves_deposit_order(&self) -> bool {
        false
    }
}

pub trait PrepEndpoint: Send + Sync {
    /// Keep changes even when they add fatal defects.
    fn always_apply_changes(&self) -> bool {
        false
    }

    /// Must be idempotent.
    fn prepare(&self, ctx: &PrepContext<'_>, record: &mut Record) -> Result<()>;
}

pub trait PrepManEndpoint: Send + Sync {
    fn prepare_manual(&self, op: &Operation<'_>, records: &mut RecordMap) -> Result<()>;
}

pub trait DedupeEndpoint: Send + Sync {
    /// Groups of ids that describe the same work. Records are not mutated;
    /// the driver merges.
    fn run_dedupe(&self, op: &Operation<'_>, records: &RecordMap) -> Result<Vec<Vec<String>>>;
}

pub trait PrescreenEndpoint: Send + Sync {
    /// Decides records in `md_processed` (restricted to `split` when non-empty).
    fn run_prescreen(&self, op: &Operation<'_>, records: &mut RecordMap, split: &[String]) -> Result<()>;
}

pub trait PdfGetEndpoint: Send + Sync {
    /// Sets the `file` field when a PDF was found.
    fn get_pdf(&self, op: &Operation<'_>, record: &mut Record) -> Result<()>;
}

pub trait PdfGetManEndpoint: Send + Sync {
    fn pdf_get_man(&self, op: &Operation<'_>, records: &mut RecordMap) -> Result<()>;
}

pub trait PdfPrepEndpoint: Send + Sync {
    /// Moves the record to `pdf_needs_manual_preparation` on defects.
    fn prep_pdf(&self, op: &Operation<'_>, record: &mut Record, pad: usize) -> Result<()>;
}

pub trait PdfPrepManEndpoint: Send + Sync {
    fn pdf_prep_man(&self, op: &Operation<'_>, records: &mut RecordMap) -> Result<()>;
}

pub trait ScreenEndpoint: Send + Sync {
    /// Decides records in `pdf_prepared` (restricted to `split` when non-empty).
    fn run_screen(&self, op: &Operation<'_>, records: &mut RecordMap, split: &[String]) -> Result<()>;
}

/// Per-record synthesis flags of one data endpoint.
pub type SynthesisColumn = BTreeMap<String, bool>;

pub trait DataEndpoint: Send + Sync {
    /// Marks the records this endpoint covers.
    fn update_record_status_matrix(&self, op: &Operation<'_>, records: &RecordMap, column: &mut SynthesisColumn);

    fn update_data(&self, op: &Operation<'_>, records: &RecordMap, column: &SynthesisColumn, silent: bool) -> Result<()>;

    fn get_advice(&self, op: &Operation<'_>) -> Advice;
}
