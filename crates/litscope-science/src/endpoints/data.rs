//! Data endpoints: a BibTeX bibliography of the included records and a
//! PRISMA flow table.

use std::path::PathBuf;

use litscope_core::endpoints::{Advice, DataEndpoint, SynthesisColumn};
use litscope_core::registry::bind_settings;
use litscope_core::{Operation, Record, RecordMap, RecordState, Result, StatusReport};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::formats::bibtex::{self, WriteOptions};
use crate::formats::table::write_rows;

pub const BIBLIOGRAPHY_EXPORT: &str = "colrev.bibliography_export";
pub const PRISMA: &str = "colrev.prisma";

/// Origins from search feeds (metadata links excluded).
fn search_origins(record: &Record) -> usize {
    record.origins().iter().filter(|o| !o.starts_with("md_")).count()
}

fn is_included(record: &Record) -> bool {
    matches!(record.status(), RecordState::RevIncluded | RecordState::RevSynthesized)
}

// ─── Bibliography ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BibliographySettings {
    pub filename: String,
}

impl Default for BibliographySettings {
    fn default() -> Self {
        Self {
            filename: "references.bib".to_string(),
        }
    }
}

pub struct BibliographyExport {
    settings: BibliographySettings,
}

pub fn bibliography_factory(params: &toml::Table) -> Result<Box<dyn DataEndpoint>> {
    Ok(Box::new(BibliographyExport {
        settings: bind_settings(BIBLIOGRAPHY_EXPORT, params)?,
    }))
}

impl BibliographyExport {
    fn path(&self, op: &Operation<'_>) -> PathBuf {
        op.dataset().project().output_dir().join(&self.settings.filename)
    }
}

impl DataEndpoint for BibliographyExport {
    /// Exporting is all there is to synthesize.
    fn update_record_status_matrix(&self, _op: &Operation<'_>, _records: &RecordMap, column: &mut SynthesisColumn) {
        for synthesized in column.values_mut() {
            *synthesized = true;
        }
    }

    fn update_data(&self, op: &Operation<'_>, records: &RecordMap, _column: &SynthesisColumn, silent: bool) -> Result<()> {
        let included: Vec<&Record> = records.values().filter(|r| is_included(r)).collect();
        let path = self.path(op);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, bibtex::write_records(included.iter().copied(), WriteOptions::default()))?;
        if !silent {
            info!(records = included.len(), file = %op.dataset().project().relative(&path).display(), "bibliography written");
        }
        Ok(())
    }

    fn get_advice(&self, op: &Operation<'_>) -> Advice {
        let path = op.dataset().project().relative(&self.path(op));
        Advice {
            msg: format!("cite from {}", path.display()),
            detailed_msg: format!("The bibliography of included records is kept in {}.", path.display()),
        }
    }
}

// ─── PRISMA ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrismaRow {
    pub stage: &'static str,
    pub count: usize,
}

/// Flow counts derived from the current states.
pub fn prisma_rows(records: &RecordMap, duplicates_removed: usize) -> Vec<PrismaRow> {
    let report = StatusReport::from_records(records);
    let overall = |state: RecordState| report.overall.get(state.as_str()).copied().unwrap_or(0);
    let count = |state: RecordState| report.count(state);

    let identified = records.values().map(|r| search_origins(r).max(1)).sum::<usize>();
    vec![
        PrismaRow { stage: "records_identified", count: identified },
        PrismaRow { stage: "duplicates_removed", count: duplicates_removed },
        PrismaRow { stage: "records_screened", count: overall(RecordState::MdProcessed) },
        PrismaRow { stage: "records_excluded", count: count(RecordState::RevPrescreenExcluded) },
        PrismaRow { stage: "full_text_not_available", count: count(RecordState::PdfNotAvailable) },
        PrismaRow { stage: "full_text_assessed", count: overall(RecordState::PdfPrepared) },
        PrismaRow { stage: "full_text_excluded", count: count(RecordState::RevExcluded) },
        PrismaRow { stage: "studies_included", count: overall(RecordState::RevIncluded) },
    ]
}

pub struct Prisma;

pub fn prisma_factory(_params: &toml::Table) -> Result<Box<dyn DataEndpoint>> {
    Ok(Box::new(Prisma))
}

const PRISMA_FILE: &str = "PRISMA.csv";

impl DataEndpoint for Prisma {
    fn update_record_status_matrix(&self, _op: &Operation<'_>, _records: &RecordMap, column: &mut SynthesisColumn) {
        for synthesized in column.values_mut() {
            *synthesized = true;
        }
    }

    fn update_data(&self, op: &Operation<'_>, records: &RecordMap, _column: &SynthesisColumn, silent: bool) -> Result<()> {
        // Every merged record absorbed all but one of its origins.
        let duplicates_removed = records
            .values()
            .map(|r| search_origins(r).saturating_sub(1))
            .sum();
        let rows = prisma_rows(records, duplicates_removed);
        let path = op.dataset().project().output_dir().join(PRISMA_FILE);
        write_rows(&path, &rows)?;
        if !silent {
            info!(file = %op.dataset().project().relative(&path).display(), "PRISMA counts written");
        }
        Ok(())
    }

    fn get_advice(&self, _op: &Operation<'_>) -> Advice {
        Advice {
            msg: "report the flow from PRISMA.csv".to_string(),
            detailed_msg: "PRISMA.csv counts records per stage; regenerate it with `litscope data`.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, status: RecordState, origins: &[&str]) -> Record {
        let mut record = Record::new(id, "article");
        record.force_status(status);
        record.set_origins(origins.iter().copied());
        record
    }

    #[test]
    fn prisma_counts_follow_the_states() {
        let records: RecordMap = [
            record("A", RecordState::RevIncluded, &["feed-1/1", "feed-2/7"]),
            record("B", RecordState::RevPrescreenExcluded, &["feed-1/2"]),
            record("C", RecordState::RevExcluded, &["feed-1/3"]),
            record("D", RecordState::PdfNotAvailable, &["feed-2/4"]),
        ]
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

        let rows = prisma_rows(&records, 1);
        let get = |stage: &str| rows.iter().find(|r| r.stage == stage).unwrap().count;
        assert_eq!(get("records_identified"), 5);
        assert_eq!(get("records_screened"), 4);
        assert_eq!(get("records_excluded"), 1);
        assert_eq!(get("full_text_not_available"), 1);
        assert_eq!(get("full_text_assessed"), 2);
        assert_eq!(get("studies_included"), 1);
    }
}
