//! `colrev.crossref`: API searches against Crossref and metadata linking
//! through the `md_crossref` feed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use litscope_core::endpoints::{SearchContext, SearchSourceEndpoint};
use litscope_core::models::fields::{self, values};
use litscope_core::registry::bind_settings;
use litscope_core::{
    FeedHandle, FeedPager, KeyCase, LitscopeError, Operation, Page, Pagination, ProjectRoot, Record,
    RecordMap, Result, SearchFeed, SearchSourceSettings, SearchSummary, SearchType, Settings,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::dedup::normalize_text;
use crate::identifiers::Doi;
use crate::sources::crossref::{work_to_record, CrossrefClient, WorksQuery, DEFAULT_API_URL, MAX_ROWS};

pub const CROSSREF: &str = "colrev.crossref";

/// Feed that collects the Crossref records linked during prep.
pub const MD_FEED: &str = "md_crossref.json";

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

/// `search_parameters` of a Crossref source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossrefSearchParams {
    pub query: Option<String>,
    pub issn: Option<String>,
    pub api_url: String,
    pub rows: u32,
}

impl Default for CrossrefSearchParams {
    fn default() -> Self {
        Self {
            query: None,
            issn: None,
            api_url: default_api_url(),
            rows: 100,
        }
    }
}

pub struct CrossrefSource {
    linker: CrossrefLinker,
}

pub fn factory(_params: &toml::Table) -> Result<Arc<dyn SearchSourceEndpoint>> {
    Ok(Arc::new(CrossrefSource {
        linker: CrossrefLinker::new(default_api_url(), 0.9),
    }))
}

impl SearchSourceEndpoint for CrossrefSource {
    fn source_identifier(&self) -> &str {
        fields::DOI
    }

    fn key_case(&self) -> KeyCase {
        KeyCase::Upper
    }

    fn heuristic(&self, filename: &Path, content: &str) -> f64 {
        let named = filename
            .file_name()
            .is_some_and(|n| n.to_string_lossy().to_lowercase().contains("crossref"));
        let keyed = content.contains("\"source_identifier\": \"doi\"");
        match (named, keyed) {
            (true, true) => 1.0,
            (false, true) => 0.5,
            (true, false) => 0.2,
            (false, false) => 0.0,
        }
    }

    fn add_endpoint(&self, params: &toml::Table, project: &ProjectRoot) -> Result<SearchSourceSettings> {
        let parsed: CrossrefSearchParams = bind_settings(CROSSREF, params)?;
        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if !has(&parsed.query) && !has(&parsed.issn) {
            return Err(LitscopeError::InvalidQuery(
                "a Crossref search needs a query or an issn".to_string(),
            ));
        }
        if let Some(issn) = parsed.issn.as_deref().filter(|i| !i.trim().is_empty()) {
            if !is_issn(issn) {
                return Err(LitscopeError::InvalidQuery(format!("invalid ISSN '{issn}'")));
            }
        }

        let taken: Vec<PathBuf> = Settings::load(&project.settings_path())
            .map(|s| s.sources.into_iter().map(|src| src.filename).collect())
            .unwrap_or_default();
        let filename = (1..)
            .map(|n| {
                let stem = if n == 1 { "crossref".to_string() } else { format!("crossref_{n}") };
                PathBuf::from(format!("data/search/{stem}.json"))
            })
            .find(|candidate| !taken.contains(candidate) && !project.root().join(candidate).exists())
            .unwrap_or_else(|| PathBuf::from("data/search/crossref.json"));

        Ok(SearchSourceSettings {
            endpoint: CROSSREF.to_string(),
            filename,
            search_type: SearchType::Api,
            search_parameters: params.clone(),
            comment: None,
        })
    }

    /// Walks the result cursor into the feed. Incremental runs only ask for
    /// works indexed since the feed was last updated.
    fn search(&self, ctx: &SearchContext<'_>) -> Result<SearchSummary> {
        let Some(feed) = &ctx.feed else {
            return Err(LitscopeError::InvalidQuery(format!(
                "{} must be an API source",
                ctx.source.filename.display()
            )));
        };
        let params: CrossrefSearchParams = bind_settings(CROSSREF, &ctx.source.search_parameters)?;
        let since = if ctx.rerun { None } else { SearchFeed::lock(feed).since() };
        let query = WorksQuery {
            query: params.query.clone(),
            issn: params.issn.clone(),
            from_index_date: since.map(|t| t.date_naive()),
            rows: params.rows,
        };
        if let Some(since) = since {
            info!(source = %ctx.source.feed_name(), since = %since.date_naive(), "incremental search");
        }

        let client = CrossrefClient::new(&params.api_url, ctx.op.timeout())?;
        let page_size = query.rows.clamp(1, MAX_ROWS) as usize;
        let pager = FeedPager::new(ctx.source.feed_name(), Pagination::Cursor, ctx.rerun);
        pager.run(feed, ctx.op.cancel_flag(), |request| {
            let mut cursor = request.cursor.clone().unwrap_or_else(|| "*".to_string());
            // Skip pages whose works are all discarded so that an empty page
            // still means the upstream is exhausted.
            loop {
                ctx.op.cancel_flag().check()?;
                let page = client.works_page(&query, &cursor)?;
                if page.items.is_empty() {
                    return Ok(Page::default());
                }
                let short = page.items.len() < page_size;
                let records: Vec<Record> = page.items.iter().filter_map(work_to_record).collect();
                let discarded = page.items.len() - records.len();
                if discarded > 0 {
                    debug!(discarded, "works without DOI, title or author");
                }
                let next_cursor = if short { None } else { page.next_cursor };
                match next_cursor {
                    Some(next) if records.is_empty() && next != cursor => cursor = next,
                    next_cursor => return Ok(Page { records, next_cursor }),
                }
            }
        })
    }

    fn prep_link_md(&self, op: &Operation<'_>, record: &mut Record, save_feed: bool, timeout: Duration) -> Result<()> {
        self.linker.link(op, record, save_feed, timeout)
    }

    fn load(&self, op: &Operation<'_>, source: &SearchSourceSettings) -> Result<RecordMap> {
        let path = op.dataset().project().root().join(&source.filename);
        let feed = SearchFeed::open(&path, self.source_identifier(), self.key_case())?;
        Ok(feed.records().clone())
    }

    fn prepare(&self, record: &mut Record, _source: &SearchSourceSettings) -> Result<()> {
        // Crossref reports pages as `12-34`.
        if let Some(pages) = record.get(fields::PAGES).filter(|p| p.contains('-') && !p.contains("--")) {
            let pages = pages.replace('-', "--");
            let source = record.field_source(fields::PAGES, fields::sources::ORIGINAL);
            record.update_field_with(fields::PAGES, pages, &source, litscope_core::FieldEdit::replace());
        }
        Ok(())
    }
}

fn is_issn(raw: &str) -> bool {
    let compact: Vec<char> = raw.trim().chars().filter(|c| *c != '-').collect();
    compact.len() == 8
        && compact[..7].iter().all(|c| c.is_ascii_digit())
        && (compact[7].is_ascii_digit() || compact[7] == 'X' || compact[7] == 'x')
}

// ─── Linking ───────────────────────────────────────────────

/// Looks records up in Crossref (by DOI, else by a bibliographic query),
/// stores the match in `md_crossref.json` and copies its masterdata over.
pub struct CrossrefLinker {
    api_url: String,
    min_similarity: f64,
    client: OnceLock<CrossrefClient>,
    feed: OnceLock<FeedHandle>,
}

/// Fields copied from a linked Crossref record.
const LINKED_FIELDS: [&str; 13] = [
    fields::TITLE,
    fields::AUTHOR,
    fields::YEAR,
    fields::JOURNAL,
    fields::BOOKTITLE,
    fields::VOLUME,
    fields::NUMBER,
    fields::PAGES,
    fields::DOI,
    fields::ISBN,
    fields::PUBLISHER,
    fields::URL,
    fields::CITED_BY,
];

impl CrossrefLinker {
    pub fn new(api_url: String, min_similarity: f64) -> Self {
        Self {
            api_url,
            min_similarity,
            client: OnceLock::new(),
            feed: OnceLock::new(),
        }
    }

    fn client(&self, timeout: Duration) -> Result<&CrossrefClient> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = CrossrefClient::new(&self.api_url, timeout)?;
        Ok(self.client.get_or_init(|| client))
    }

    fn feed(&self, op: &Operation<'_>) -> Result<&FeedHandle> {
        if let Some(feed) = self.feed.get() {
            return Ok(feed);
        }
        let path = op.dataset().project().search_dir().join(MD_FEED);
        let feed = SearchFeed::open(&path, fields::DOI, KeyCase::Upper)?.into_handle();
        Ok(self.feed.get_or_init(|| feed))
    }

    pub fn link(&self, op: &Operation<'_>, record: &mut Record, save_feed: bool, timeout: Duration) -> Result<()> {
        if record.masterdata_is_curated() {
            return Ok(());
        }
        let client = self.client(timeout)?;
        let item = match record.value(fields::DOI) {
            Some(raw) => {
                let doi = Doi::parse(raw)?;
                client.fetch_by_doi(&doi)?
            }
            None => {
                let reference = bibliographic_reference(record)
                    .ok_or_else(|| LitscopeError::NotEnoughDataToIdentify(record.id.clone()))?;
                client
                    .query_bibliographic(&reference, 3)?
                    .into_iter()
                    .find(|item| work_to_record(item).is_some_and(|c| self.matches(record, &c)))
                    .ok_or_else(|| LitscopeError::RecordNotFoundInPrepSource(record.id.clone()))?
            }
        };
        let retrieved = work_to_record(&item)
            .ok_or_else(|| LitscopeError::RecordNotParsable(format!("Crossref work for {}", record.id)))?;
        if !self.matches(record, &retrieved) {
            return Err(LitscopeError::RecordNotFoundInPrepSource(record.id.clone()));
        }

        let (origin, linked) = {
            let feed = self.feed(op)?;
            let mut guard = SearchFeed::lock(feed);
            guard.add_update_record(&retrieved)?;
            let linked = guard
                .get_prev_feed_record(&retrieved)
                .cloned()
                .ok_or_else(|| LitscopeError::RecordNotFound(retrieved.id.clone()))?;
            if save_feed {
                guard.save()?;
            }
            (format!("{}/{}", guard.name(), linked.id), linked)
        };

        for key in LINKED_FIELDS {
            if let Some(value) = linked.value(key) {
                record.update_field(key, value, &origin);
            }
        }
        record.add_origin(origin);
        if linked.value(fields::RETRACTED).is_some() {
            record.prescreen_exclude(values::RETRACTED)?;
        }
        Ok(())
    }

    /// Same work when the normalized titles are close and the years (if
    /// both known) differ by at most one.
    fn matches(&self, record: &Record, candidate: &Record) -> bool {
        let Some(title) = record.value(fields::TITLE) else {
            return record.value(fields::DOI).is_some();
        };
        let (a, b) = (
            normalize_text(title),
            normalize_text(candidate.value(fields::TITLE).unwrap_or_default()),
        );
        if strsim::normalized_levenshtein(&a, &b) < self.min_similarity {
            return false;
        }
        let year = |r: &Record| r.value(fields::YEAR).and_then(|y| y.trim().parse::<i32>().ok());
        match (year(record), year(candidate)) {
            (Some(x), Some(y)) => (x - y).abs() <= 1,
            _ => true,
        }
    }
}

fn bibliographic_reference(record: &Record) -> Option<String> {
    let title = record.value(fields::TITLE)?;
    let first_author = record
        .value(fields::AUTHOR)
        .and_then(|a| a.split(" and ").next())
        .and_then(|a| a.split(',').next());
    let parts: Vec<&str> = [
        first_author,
        Some(title),
        record.value(fields::JOURNAL).or_else(|| record.value(fields::BOOKTITLE)),
        record.value(fields::YEAR),
    ]
    .into_iter()
    .flatten()
    .collect();
    Some(parts.join(" "))
}
