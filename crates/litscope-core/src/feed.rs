//! Search feeds: the local, append-mostly materialization of one upstream
//! query, keyed by the upstream primary key.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LitscopeError, Result};
use crate::models::fields;
use crate::models::merge::SourceAuthority;
use crate::models::provenance::FieldProvenance;
use crate::models::record::{FieldEdit, Record, RecordMap};
use crate::operation::CancellationFlag;

/// Offset pagination stops here.
pub const MAX_OFFSET: u64 = 1000;

/// Width of feed-local ids (`000001`).
const ID_WIDTH: usize = 6;

/// Case normalization of primary keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyCase {
    #[default]
    AsIs,
    Upper,
    Lower,
}

impl KeyCase {
    pub fn apply(&self, key: &str) -> String {
        let key = key.trim();
        match self {
            Self::AsIs => key.to_string(),
            Self::Upper => key.to_uppercase(),
            Self::Lower => key.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedUpdate {
    Added,
    Updated,
    Unchanged,
}

/// Counts reported after a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchSummary {
    pub added: usize,
    pub changed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct FeedFile {
    source_identifier: String,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    records: RecordMap,
}

/// One feed file in memory.
#[derive(Debug)]
pub struct SearchFeed {
    path: PathBuf,
    name: String,
    key_case: KeyCase,
    file: FeedFile,
    /// Normalized primary key → feed-local id.
    index: BTreeMap<String, String>,
    nr_added: usize,
    nr_changed: usize,
}

/// A feed shared between workers.
pub type FeedHandle = Arc<Mutex<SearchFeed>>;

impl SearchFeed {
    /// Opens the feed at `path`, or starts an empty one.
    pub fn open(path: &Path, source_identifier: &str, key_case: KeyCase) -> Result<Self> {
        let file = if path.exists() {
            let mut file: FeedFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            if file.source_identifier.is_empty() {
                file.source_identifier = source_identifier.to_string();
            }
            file
        } else {
            FeedFile {
                source_identifier: source_identifier.to_string(),
                ..FeedFile::default()
            }
        };
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut feed = Self {
            path: path.to_path_buf(),
            name,
            key_case,
            file,
            index: BTreeMap::new(),
            nr_added: 0,
            nr_changed: 0,
        };
        feed.rebuild_index();
        Ok(feed)
    }

    fn rebuild_index(&mut self) {
        let key_field = self.file.source_identifier.clone();
        self.index = self
            .file
            .records
            .iter()
            .filter_map(|(local_id, record)| {
                record
                    .value(&key_field)
                    .map(|key| (self.key_case.apply(key), local_id.clone()))
            })
            .collect();
    }

    pub fn into_handle(self) -> FeedHandle {
        Arc::new(Mutex::new(self))
    }

    /// Locks a shared feed; a poisoned lock still yields the feed.
    pub fn lock(handle: &FeedHandle) -> MutexGuard<'_, SearchFeed> {
        handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Origin prefix of the feed's records.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_identifier(&self) -> &str {
        &self.file.source_identifier
    }

    pub fn len(&self) -> usize {
        self.file.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.records.is_empty()
    }

    pub fn records(&self) -> &RecordMap {
        &self.file.records
    }

    pub fn nr_added(&self) -> usize {
        self.nr_added
    }

    pub fn nr_changed(&self) -> usize {
        self.nr_changed
    }

    /// Only deposits after this instant are fetched in incremental mode.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.file.last_updated
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.file.next_cursor.as_deref()
    }

    pub fn offset(&self) -> u64 {
        self.file.offset
    }

    pub fn set_pagination(&mut self, next_cursor: Option<String>, offset: u64) {
        self.file.next_cursor = next_cursor;
        self.file.offset = offset;
    }

    fn next_local_id(&self) -> String {
        let next = self
            .file
            .records
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        format!("{next:0width$}", width = ID_WIDTH)
    }

    /// Idempotent upsert keyed on the primary key.
    ///
    /// New records get the next feed-local id, the origin
    /// `<feed>/<local id>` and that origin as provenance source. Known
    /// records take over a retrieved field only when its source is strictly
    /// more authoritative than the stored one; absent fields are added and
    /// provenance notes accumulate.
    pub fn add_update_record(&mut self, retrieved: &Record) -> Result<FeedUpdate> {
        let key_field = self.file.source_identifier.clone();
        let Some(raw_key) = retrieved.value(&key_field) else {
            return Err(LitscopeError::NotFeedIdentifiable(key_field));
        };
        let key = self.key_case.apply(raw_key);

        let Some(local_id) = self.index.get(&key).cloned() else {
            let local_id = self.next_local_id();
            let origin = format!("{}/{local_id}", self.name);
            let mut record = retrieved.clone();
            record.id = local_id.clone();
            record.set_origins([origin.clone()]);
            record.update_field_with(&key_field, key.clone(), &origin, FieldEdit::replace());
            record.add_provenance_all(&origin);
            self.file.records.insert(local_id.clone(), record);
            self.index.insert(key, local_id);
            self.nr_added += 1;
            return Ok(FeedUpdate::Added);
        };

        let primary = [self.name.as_str(), fields::sources::ORIGINAL, "http"];
        let Some(existing) = self.file.records.get_mut(&local_id) else {
            return Err(LitscopeError::RecordNotFound(local_id));
        };
        let origin = format!("{}/{local_id}", self.name);
        let mut changed = false;

        for (field, value) in retrieved.fields() {
            if field == &key_field || value.trim().is_empty() {
                continue;
            }
            let incoming = retrieved
                .get_field_provenance(field)
                .cloned()
                .unwrap_or_else(|| FieldProvenance::new(origin.as_str(), ""));
            let incoming_source = if incoming.source.is_empty() {
                origin.clone()
            } else {
                incoming.source.clone()
            };

            match existing.get(field).map(str::to_string) {
                None => {
                    existing.update_field_with(
                        field,
                        value.clone(),
                        &incoming_source,
                        FieldEdit::replace().with_note(&incoming.note),
                    );
                    changed = true;
                }
                Some(current) if current != *value => {
                    let stored = existing.field_source(field, &origin);
                    let new_rank = SourceAuthority::classify(&incoming_source, &primary);
                    let old_rank = SourceAuthority::classify(&stored, &primary);
                    // Time-variant counts refresh from the same upstream.
                    let refresh = fields::is_time_variant(field) && new_rank == old_rank;
                    if new_rank > old_rank || refresh {
                        existing.update_field_with(
                            field,
                            value.clone(),
                            &incoming_source,
                            FieldEdit::replace(),
                        );
                        changed = true;
                    }
                }
                Some(_) => {}
            }

            if !incoming.note.is_empty() {
                if let Some(mut merged) = existing.get_field_provenance(field).cloned() {
                    if merged.absorb_notes(&incoming) {
                        existing.add_field_provenance(field, &merged.source, "");
                        for note in merged.notes() {
                            existing.add_field_provenance_note(field, note);
                        }
                        changed = true;
                    }
                }
            }
        }

        if changed {
            self.nr_changed += 1;
            Ok(FeedUpdate::Updated)
        } else {
            Ok(FeedUpdate::Unchanged)
        }
    }

    /// The stored record with the same primary key as `record`.
    pub fn get_prev_feed_record(&self, record: &Record) -> Option<&Record> {
        let key = self.key_case.apply(record.value(&self.file.source_identifier)?);
        self.index
            .get(&key)
            .and_then(|local_id| self.file.records.get(local_id))
    }

    /// Rewrites the feed file atomically and stamps it with the current time.
    pub fn save(&mut self) -> Result<()> {
        self.save_at(Utc::now())
    }

    /// Like [`SearchFeed::save`] with an explicit timestamp.
    pub fn save_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.file.last_updated = Some(now);
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        let mut serialized = serde_json::to_string_pretty(&self.file)?;
        serialized.push('\n');
        tmp.write_all(serialized.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| LitscopeError::Io(e.error))?;
        Ok(())
    }

    /// Logs the counters of this run.
    pub fn print_post_run_search_infos(&self) {
        if self.nr_added > 0 || self.nr_changed > 0 {
            info!(
                feed = %self.name,
                added = self.nr_added,
                changed = self.nr_changed,
                "feed updated"
            );
        } else {
            info!(feed = %self.name, "no new or changed records");
        }
    }
}

// ─── Pagination ────────────────────────────────────────────

/// Position requested from the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub offset: u64,
}

/// One upstream page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    Cursor,
    Offset { page_size: u64 },
}

/// Walks upstream pages into a feed.
#[derive(Debug, Clone)]
pub struct FeedPager {
    pub source_name: String,
    pub pagination: Pagination,
    pub rerun: bool,
    /// Stop at the first page without new records (non-rerun only).
    pub short_circuit: bool,
    pub max_offset: u64,
}

impl FeedPager {
    pub fn new(source_name: impl Into<String>, pagination: Pagination, rerun: bool) -> Self {
        Self {
            source_name: source_name.into(),
            pagination,
            rerun,
            short_circuit: false,
            max_offset: MAX_OFFSET,
        }
    }

    pub fn with_short_circuit(mut self, enabled: bool) -> Self {
        self.short_circuit = enabled;
        self
    }

    /// Fetches pages with `fetch` until the upstream is exhausted.
    pub fn run<F>(&self, feed: &FeedHandle, cancel: &CancellationFlag, mut fetch: F) -> Result<SearchSummary>
    where
        F: FnMut(&PageRequest) -> Result<Page>,
    {
        let mut summary = SearchSummary::default();
        let mut request = PageRequest {
            cursor: None,
            offset: 0,
        };

        loop {
            cancel.check()?;
            let page = fetch(&request)?;
            if page.records.is_empty() {
                break;
            }
            // Only results past the cap are an error, not reaching it.
            if let Pagination::Offset { .. } = self.pagination {
                if request.offset >= self.max_offset {
                    return Err(LitscopeError::MaxOffset {
                        source_name: self.source_name.clone(),
                        max: self.max_offset,
                    });
                }
            }
            let page_len = page.records.len() as u64;

            let mut added_on_page = 0;
            {
                let mut guard = SearchFeed::lock(feed);
                for record in &page.records {
                    match guard.add_update_record(record) {
                        Ok(FeedUpdate::Added) => {
                            added_on_page += 1;
                            summary.added += 1;
                        }
                        Ok(FeedUpdate::Updated) => summary.changed += 1,
                        Ok(FeedUpdate::Unchanged) => {}
                        Err(e) if e.is_skippable() => {
                            warn!(source = %self.source_name, error = %e, "skipping record");
                            summary.skipped += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                guard.set_pagination(page.next_cursor.clone(), request.offset + page_len);
            }

            if self.short_circuit && !self.rerun && added_on_page == 0 {
                info!(source = %self.source_name, "page without new records, stopping");
                break;
            }

            match self.pagination {
                Pagination::Cursor => match page.next_cursor {
                    Some(next) if request.cursor.as_deref() != Some(next.as_str()) => {
                        request.cursor = Some(next);
                        request.offset += page_len;
                    }
                    _ => break,
                },
                Pagination::Offset { page_size } => {
                    request.offset += page_len;
                    if page_len < page_size {
                        break;
                    }
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn upstream(doi: &str, title: &str) -> Record {
        let mut r = Record::new("x", "article");
        r.update_field_with(fields::DOI, doi, "https://api.crossref.org/works", FieldEdit::replace());
        r.update_field_with(fields::TITLE, title, "https://api.crossref.org/works", FieldEdit::replace());
        r
    }

    fn open(dir: &TempDir) -> SearchFeed {
        SearchFeed::open(&dir.path().join("crossref.json"), fields::DOI, KeyCase::Upper).unwrap()
    }

    #[test]
    fn new_records_get_padded_ids_and_origins() {
        let dir = TempDir::new().unwrap();
        let mut feed = open(&dir);
        assert_eq!(feed.add_update_record(&upstream("10.1/a", "A")).unwrap(), FeedUpdate::Added);
        assert_eq!(feed.add_update_record(&upstream("10.1/b", "B")).unwrap(), FeedUpdate::Added);

        let record = &feed.records()["000002"];
        assert!(record.origins().contains("crossref/000002"));
        assert_eq!(record.get(fields::DOI), Some("10.1/B"));
        assert_eq!(
            record.get_field_provenance(fields::TITLE).unwrap().source,
            "crossref/000002"
        );
    }

    #[test]
    fn missing_key_is_not_feed_identifiable() {
        let dir = TempDir::new().unwrap();
        let mut feed = open(&dir);
        let mut r = Record::new("x", "article");
        r.update_field(fields::TITLE, "no doi", "upstream");
        assert!(matches!(
            feed.add_update_record(&r),
            Err(LitscopeError::NotFeedIdentifiable(_))
        ));
    }

    #[test]
    fn keys_are_case_normalized() {
        let dir = TempDir::new().unwrap();
        let mut feed = open(&dir);
        feed.add_update_record(&upstream("10.1/abc", "A")).unwrap();
        assert_eq!(
            feed.add_update_record(&upstream("10.1/ABC", "A")).unwrap(),
            FeedUpdate::Unchanged
        );
        assert_eq!(feed.len(), 1);
        assert!(feed.get_prev_feed_record(&upstream("10.1/Abc", "")).is_some());
    }

    #[test]
    fn equal_authority_keeps_stored_value_and_adds_fields() {
        let dir = TempDir::new().unwrap();
        let mut feed = open(&dir);
        feed.add_update_record(&upstream("10.1/a", "Original title")).unwrap();

        let mut again = upstream("10.1/a", "Changed title");
        again.update_field(fields::URL, "https://doi.org/10.1/a", "https://api.crossref.org/works");
        assert_eq!(feed.add_update_record(&again).unwrap(), FeedUpdate::Updated);

        let stored = &feed.records()["000001"];
        assert_eq!(stored.get(fields::TITLE), Some("Original title"));
        assert_eq!(stored.get(fields::URL), Some("https://doi.org/10.1/a"));
    }

    #[test]
    fn curated_values_replace_primary_ones() {
        let dir = TempDir::new().unwrap();
        let mut feed = open(&dir);
        feed.add_update_record(&upstream("10.1/a", "primary title")).unwrap();

        let mut curated = upstream("10.1/a", "Curated Title");
        curated.update_field_with(fields::TITLE, "Curated Title", "curated:https://repo", FieldEdit::replace());
        assert_eq!(feed.add_update_record(&curated).unwrap(), FeedUpdate::Updated);
        assert_eq!(feed.records()["000001"].get(fields::TITLE), Some("Curated Title"));
    }

    #[test]
    fn repeated_upserts_produce_identical_bytes() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let records: Vec<Record> = (0..5)
            .map(|i| upstream(&format!("10.1/{i}"), &format!("Title {i}")))
            .collect();

        let once = TempDir::new().unwrap();
        let mut feed = open(&once);
        for r in &records {
            feed.add_update_record(r).unwrap();
        }
        feed.save_at(now).unwrap();

        let twice = TempDir::new().unwrap();
        let mut feed = open(&twice);
        for r in records.iter().chain(records.iter()) {
            feed.add_update_record(r).unwrap();
        }
        feed.save_at(now).unwrap();

        assert_eq!(
            std::fs::read(once.path().join("crossref.json")).unwrap(),
            std::fs::read(twice.path().join("crossref.json")).unwrap()
        );
    }

    #[test]
    fn save_never_drops_entries() {
        let dir = TempDir::new().unwrap();
        let mut feed = open(&dir);
        feed.add_update_record(&upstream("10.1/a", "A")).unwrap();
        feed.save().unwrap();

        let mut reopened = open(&dir);
        assert_eq!(reopened.len(), 1);
        assert!(reopened.since().is_some());
        reopened.add_update_record(&upstream("10.1/b", "B")).unwrap();
        reopened.save().unwrap();
        assert_eq!(open(&dir).len(), 2);
    }

    #[test]
    fn offset_pagination_fails_beyond_cap() {
        let dir = TempDir::new().unwrap();
        let feed = open(&dir).into_handle();
        let pager = FeedPager::new("crossref", Pagination::Offset { page_size: 100 }, true);
        let err = pager
            .run(&feed, &CancellationFlag::new(), |req| {
                let records = (0..100)
                    .map(|i| upstream(&format!("10.1/{}", req.offset + i), "t"))
                    .collect();
                Ok(Page {
                    records,
                    next_cursor: None,
                })
            })
            .unwrap_err();
        assert!(matches!(err, LitscopeError::MaxOffset { max: 1000, .. }));
        assert_eq!(SearchFeed::lock(&feed).len(), 1000);
    }

    #[test]
    fn offset_pagination_may_end_exactly_at_cap() {
        let dir = TempDir::new().unwrap();
        let feed = open(&dir).into_handle();
        let pager = FeedPager::new("crossref", Pagination::Offset { page_size: 100 }, true);
        let summary = pager
            .run(&feed, &CancellationFlag::new(), |req| {
                let records = if req.offset < 1000 {
                    (0..100)
                        .map(|i| upstream(&format!("10.1/{}", req.offset + i), "t"))
                        .collect()
                } else {
                    Vec::new()
                };
                Ok(Page {
                    records,
                    next_cursor: None,
                })
            })
            .unwrap();
        assert_eq!(summary.added, 1000);
    }

    #[test]
    fn noted_upstream_fields_upsert_without_change() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut noted = upstream("10.1/abc", "SOME TITLE");
        noted.add_field_provenance_note(fields::TITLE, "mostly-all-caps");

        let once = TempDir::new().unwrap();
        let mut feed = open(&once);
        assert_eq!(feed.add_update_record(&noted).unwrap(), FeedUpdate::Added);
        feed.save_at(now).unwrap();

        let twice = TempDir::new().unwrap();
        let mut feed = open(&twice);
        feed.add_update_record(&noted).unwrap();
        assert_eq!(feed.add_update_record(&noted).unwrap(), FeedUpdate::Unchanged);
        feed.save_at(now).unwrap();

        let stored = &feed.records()["000001"];
        let prov = stored.get_field_provenance(fields::TITLE).unwrap();
        assert_eq!(prov.source, "crossref/000001");
        assert_eq!(prov.note, "mostly-all-caps");
        assert_eq!(
            std::fs::read(once.path().join("crossref.json")).unwrap(),
            std::fs::read(twice.path().join("crossref.json")).unwrap()
        );
    }

    #[test]
    fn short_circuit_stops_on_known_page() {
        let dir = TempDir::new().unwrap();
        let feed = open(&dir).into_handle();
        {
            let mut guard = SearchFeed::lock(&feed);
            for i in 0..10 {
                guard.add_update_record(&upstream(&format!("10.1/{i}"), "t")).unwrap();
            }
        }

        let mut calls = 0;
        let pager = FeedPager::new("crossref", Pagination::Cursor, false).with_short_circuit(true);
        let summary = pager
            .run(&feed, &CancellationFlag::new(), |req| {
                calls += 1;
                let start = req.offset;
                Ok(Page {
                    records: (start..start + 10)
                        .map(|i| upstream(&format!("10.1/{i}"), "t"))
                        .collect(),
                    next_cursor: Some(format!("c{}", start + 10)),
                })
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(summary.added, 0);
    }

    #[test]
    fn cursor_pagination_ends_when_cursor_repeats() {
        let dir = TempDir::new().unwrap();
        let feed = open(&dir).into_handle();
        let pager = FeedPager::new("crossref", Pagination::Cursor, true);
        let summary = pager
            .run(&feed, &CancellationFlag::new(), |req| {
                let start = req.offset;
                let records = if start < 30 {
                    (start..start + 10)
                        .map(|i| upstream(&format!("10.1/{i}"), "t"))
                        .collect()
                } else {
                    Vec::new()
                };
                Ok(Page {
                    records,
                    next_cursor: Some(format!("c{start}")),
                })
            })
            .unwrap();
        assert_eq!(summary.added, 30);
    }
}
