use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use litscope_core::models::fields;
use litscope_core::Record;
use serde_json::Value;

use crate::error::{Result, ScienceError};
use crate::http::{BlockingClient, RateLimitedClient, USER_AGENT};
use crate::identifiers::Doi;

pub const DEFAULT_API_URL: &str = "https://api.crossref.org";

/// Crossref allows at most this many rows per page.
pub const MAX_ROWS: u32 = 1000;

pub struct CrossrefClient {
    http: BlockingClient,
    base_url: String,
}

impl CrossrefClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Self::with_params(base_url, Duration::from_millis(100), timeout)
    }

    pub fn with_params(base_url: &str, min_interval: Duration, timeout: Duration) -> Result<Self> {
        let inner = RateLimitedClient::new(min_interval, 3, USER_AGENT, timeout)?;
        Ok(Self {
            http: BlockingClient::new(inner)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn fetch_by_doi(&self, doi: &Doi) -> Result<Value> {
        let url = format!("{}/works/{}", self.base_url, doi.normalized);
        let mut val: Value = self.http.get_json(&url)?;
        match val.get_mut("message") {
            Some(message) => Ok(message.take()),
            None => Err(ScienceError::Parse(format!("no message in response for {}", doi.normalized))),
        }
    }

    /// Best candidates for a free-text reference, highest score first.
    pub fn query_bibliographic(&self, reference: &str, rows: u32) -> Result<Vec<Value>> {
        let url = format!(
            "{}/works?query.bibliographic={}&rows={}",
            self.base_url,
            urlencoding::encode(reference),
            rows.clamp(1, MAX_ROWS)
        );
        let val: Value = self.http.get_json(&url)?;
        Ok(items(&val))
    }

    pub fn works_page(&self, query: &WorksQuery, cursor: &str) -> Result<WorksPage> {
        let val: Value = self.http.get_json(&query.url(&self.base_url, cursor))?;
        Ok(WorksPage {
            items: items(&val),
            next_cursor: val["message"]["next-cursor"].as_str().map(str::to_string),
        })
    }
}

fn items(val: &Value) -> Vec<Value> {
    val["message"]["items"].as_array().cloned().unwrap_or_default()
}

/// One page of a cursor-paginated works query.
#[derive(Debug, Clone, Default)]
pub struct WorksPage {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

/// A `/works` query, optionally restricted to one journal and to works
/// indexed since a date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorksQuery {
    pub query: Option<String>,
    pub issn: Option<String>,
    pub from_index_date: Option<NaiveDate>,
    pub rows: u32,
}

impl WorksQuery {
    pub fn url(&self, base_url: &str, cursor: &str) -> String {
        let path = match &self.issn {
            Some(issn) => format!("{base_url}/journals/{}/works", urlencoding::encode(issn.trim())),
            None => format!("{base_url}/works"),
        };
        let mut params = Vec::new();
        if let Some(q) = self.query.as_deref().filter(|q| !q.trim().is_empty()) {
            params.push(format!("query.bibliographic={}", urlencoding::encode(q.trim())));
        }
        if let Some(date) = self.from_index_date {
            params.push(format!("filter=from-index-date:{}", date.format("%Y-%m-%d")));
        }
        params.push(format!("rows={}", self.rows.clamp(1, MAX_ROWS)));
        params.push(format!("cursor={}", urlencoding::encode(cursor)));
        format!("{path}?{}", params.join("&"))
    }
}

// ─── Works → records ───────────────────────────────────────

/// Converts a Crossref work into a record keyed by its (uppercased) DOI.
/// Works without DOI, title or authors are discarded.
pub fn work_to_record(item: &Value) -> Option<Record> {
    let doi = Doi::parse(item["DOI"].as_str()?).ok()?.normalized;
    let title = first_string(&item["title"]).map(|t| clean_text(&t))?;
    let author = authors(item)?;

    let entrytype = match item["type"].as_str().unwrap_or_default() {
        "journal-article" => "article",
        "proceedings-article" => "inproceedings",
        "book" | "monograph" | "edited-book" => "book",
        "book-chapter" | "book-section" | "book-part" => "inbook",
        "dissertation" => "phdthesis",
        "report" => "techreport",
        _ => "misc",
    };

    let mut map = BTreeMap::new();
    map.insert(fields::ID.to_string(), doi.clone());
    map.insert(fields::ENTRYTYPE.to_string(), entrytype.to_string());
    map.insert(fields::DOI.to_string(), doi);
    map.insert(fields::TITLE.to_string(), title);
    map.insert(fields::AUTHOR.to_string(), author);

    if let Some(year) = parse_year(item) {
        map.insert(fields::YEAR.to_string(), year.to_string());
    }
    if let Some(container) = first_string(&item["container-title"]) {
        let key = match entrytype {
            "article" => fields::JOURNAL,
            "inproceedings" | "inbook" => fields::BOOKTITLE,
            _ => "series",
        };
        map.insert(key.to_string(), clean_text(&container));
    }
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            map.insert(key.to_string(), v.trim().to_string());
        }
    };
    put(fields::VOLUME, item["volume"].as_str().map(str::to_string));
    put(fields::NUMBER, item["issue"].as_str().map(str::to_string));
    put(fields::PAGES, item["page"].as_str().map(|p| p.replace('-', "--")));
    put(fields::PUBLISHER, item["publisher"].as_str().map(str::to_string));
    put(fields::ISBN, first_string(&item["ISBN"]));
    put(fields::LANGUAGE, item["language"].as_str().map(str::to_string));
    put(fields::URL, item["URL"].as_str().map(str::to_string));
    put(fields::CITED_BY, item["is-referenced-by-count"].as_u64().map(|n| n.to_string()));
    put(fields::ABSTRACT, item["abstract"].as_str().map(strip_tags));
    if item["update-to"].as_array().is_some_and(|u| {
        u.iter().any(|entry| entry["type"].as_str() == Some("retraction"))
    }) {
        put(fields::RETRACTED, Some("yes".to_string()));
    }

    Record::from_map(map).ok()
}

fn first_string(v: &Value) -> Option<String> {
    v.as_array()
        .and_then(|a| a.iter().find_map(Value::as_str))
        .or_else(|| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
}

fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    clean_text(&out)
}

fn parse_year(v: &Value) -> Option<i64> {
    // "published-print": {"date-parts": [[2017, 6, 12]]}
    ["published-print", "published-online", "issued", "created"]
        .iter()
        .find_map(|key| v[*key]["date-parts"][0][0].as_i64())
}

/// `Family, Given and Family, Given`.
fn authors(item: &Value) -> Option<String> {
    let names: Vec<String> = item["author"]
        .as_array()?
        .iter()
        .filter_map(|a| {
            let family = a["family"].as_str().map(str::trim).filter(|s| !s.is_empty());
            let given = a["given"].as_str().map(str::trim).filter(|s| !s.is_empty());
            match (family, given) {
                (Some(f), Some(g)) => Some(format!("{f}, {g}")),
                (Some(f), None) => Some(f.to_string()),
                (None, _) => a["name"].as_str().map(|n| format!("{{{}}}", n.trim())),
            }
        })
        .collect();
    if names.is_empty() { None } else { Some(names.join(" and ")) }
}
