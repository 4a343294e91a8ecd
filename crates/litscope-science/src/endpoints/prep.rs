//! Automated prep endpoints.

use std::collections::BTreeMap;
use std::time::Duration;

use litscope_core::endpoints::{PrepContext, PrepEndpoint};
use litscope_core::models::fields;
use litscope_core::quality::percent_upper_chars;
use litscope_core::registry::bind_settings;
use litscope_core::{FieldEdit, Record, RecordState, Result};
use serde::Deserialize;
use tracing::debug;

use super::crossref_source::CrossrefLinker;
use crate::sources::crossref::DEFAULT_API_URL;

pub const SOURCE_SPECIFIC_PREP: &str = "colrev.source_specific_prep";
pub const JOURNAL_POLISH: &str = "colrev.journal_polish";
pub const EXCLUDE_LANGUAGES: &str = "colrev.exclude_languages";
pub const CROSSREF_METADATA: &str = "colrev.crossref_metadata";

fn excluded(record: &Record) -> bool {
    record.status() == RecordState::RevPrescreenExcluded
}

// ─── Source-specific prep ──────────────────────────────────

/// Runs the `prepare` hook of every source the record came from.
pub struct SourceSpecificPrep;

pub fn source_specific_factory(_params: &toml::Table) -> Result<Box<dyn PrepEndpoint>> {
    Ok(Box::new(SourceSpecificPrep))
}

impl PrepEndpoint for SourceSpecificPrep {
    fn prepare(&self, ctx: &PrepContext<'_>, record: &mut Record) -> Result<()> {
        let origins: Vec<String> = record.origins().iter().cloned().collect();
        for origin in origins {
            if let Some(bound) = ctx.source_for_origin(&origin) {
                bound.endpoint.prepare(record, &bound.settings)?;
            }
        }
        Ok(())
    }
}

// ─── Journal polish ────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalPolishSettings {
    /// Abbreviation (matched case-insensitively) to full journal name.
    pub abbreviations: BTreeMap<String, String>,
    /// Title-case journal names written in capitals.
    pub title_case: bool,
}

impl Default for JournalPolishSettings {
    fn default() -> Self {
        Self {
            abbreviations: BTreeMap::from([("MISQ".to_string(), "MIS Quarterly".to_string())]),
            title_case: true,
        }
    }
}

pub struct JournalPolish {
    settings: JournalPolishSettings,
}

pub fn journal_polish_factory(params: &toml::Table) -> Result<Box<dyn PrepEndpoint>> {
    Ok(Box::new(JournalPolish {
        settings: bind_settings(JOURNAL_POLISH, params)?,
    }))
}

const LOWERCASE_WORDS: [&str; 9] = ["a", "an", "and", "for", "in", "of", "on", "the", "to"];

fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_lowercase();
            // Acronyms like `IEEE` or `ACM` stay.
            if word.len() <= 4 && word.chars().all(|c| c.is_ascii_uppercase()) && !LOWERCASE_WORDS.contains(&lower.as_str()) {
                return word.to_string();
            }
            if i > 0 && LOWERCASE_WORDS.contains(&lower.as_str()) {
                return lower;
            }
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl JournalPolish {
    fn polished(&self, journal: &str) -> Option<String> {
        let trimmed = journal.trim();
        if let Some(full) = self
            .settings
            .abbreviations
            .iter()
            .find(|(abbr, _)| abbr.eq_ignore_ascii_case(trimmed))
            .map(|(_, full)| full.clone())
        {
            return Some(full);
        }
        if self.settings.title_case && trimmed.len() > 8 && percent_upper_chars(trimmed) > 0.8 {
            return Some(title_case(trimmed));
        }
        None
    }

    fn polish(&self, record: &mut Record) {
        let Some(journal) = record.value(fields::JOURNAL) else {
            return;
        };
        if let Some(polished) = self.polished(journal).filter(|p| p != journal) {
            record.update_field(fields::JOURNAL, polished, JOURNAL_POLISH);
        }
    }
}

impl PrepEndpoint for JournalPolish {
    fn prepare(&self, _ctx: &PrepContext<'_>, record: &mut Record) -> Result<()> {
        if !excluded(record) {
            self.polish(record);
        }
        Ok(())
    }
}

// ─── Languages ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExcludeLanguagesSettings {
    /// ISO 639-3 codes of the languages to keep.
    pub languages: Vec<String>,
}

impl Default for ExcludeLanguagesSettings {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string()],
        }
    }
}

pub struct ExcludeLanguages {
    languages: Vec<String>,
}

pub fn exclude_languages_factory(params: &toml::Table) -> Result<Box<dyn PrepEndpoint>> {
    let settings: ExcludeLanguagesSettings = bind_settings(EXCLUDE_LANGUAGES, params)?;
    let languages = settings
        .languages
        .iter()
        .map(|l| normalize_language(l).unwrap_or_else(|| l.trim().to_lowercase()))
        .collect();
    Ok(Box::new(ExcludeLanguages { languages }))
}

const LANGUAGES: [(&str, &[&str]); 12] = [
    ("eng", &["en", "english", "eng"]),
    ("deu", &["de", "german", "deutsch", "ger", "deu"]),
    ("fra", &["fr", "french", "fre", "fra"]),
    ("spa", &["es", "spanish", "spa"]),
    ("por", &["pt", "portuguese", "por"]),
    ("ita", &["it", "italian", "ita"]),
    ("nld", &["nl", "dutch", "dut", "nld"]),
    ("zho", &["zh", "chinese", "chi", "zho"]),
    ("jpn", &["ja", "japanese", "jpn"]),
    ("kor", &["ko", "korean", "kor"]),
    ("rus", &["ru", "russian", "rus"]),
    ("swe", &["sv", "swedish", "swe"]),
];

/// Maps ISO 639-1 codes, bibliographic codes and English names to ISO 639-3.
pub fn normalize_language(raw: &str) -> Option<String> {
    let key = raw.trim().to_lowercase();
    let key = key.split(['-', '_']).next().unwrap_or_default();
    LANGUAGES
        .iter()
        .find(|(_, aliases)| aliases.contains(&key))
        .map(|(code, _)| code.to_string())
}

impl ExcludeLanguages {
    fn check(&self, record: &mut Record) -> Result<()> {
        let Some(raw) = record.value(fields::LANGUAGE) else {
            return Ok(());
        };
        let Some(code) = normalize_language(raw) else {
            debug!(record = %record.id, language = raw, "unrecognized language");
            return Ok(());
        };
        if code != raw {
            let source = record.field_source(fields::LANGUAGE, fields::sources::ORIGINAL);
            record.update_field_with(fields::LANGUAGE, code.clone(), &source, FieldEdit::replace());
        }
        if !self.languages.contains(&code) {
            record.prescreen_exclude(&format!("language of {code}"))?;
        }
        Ok(())
    }
}

impl PrepEndpoint for ExcludeLanguages {
    fn always_apply_changes(&self) -> bool {
        true
    }

    fn prepare(&self, _ctx: &PrepContext<'_>, record: &mut Record) -> Result<()> {
        if excluded(record) {
            return Ok(());
        }
        self.check(record)
    }
}

// ─── Crossref metadata ─────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossrefMetadataSettings {
    pub api_url: String,
    pub min_similarity: f64,
    pub timeout_secs: Option<u64>,
}

impl Default for CrossrefMetadataSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            min_similarity: 0.9,
            timeout_secs: None,
        }
    }
}

/// Links records to Crossref and completes their masterdata.
pub struct CrossrefMetadata {
    linker: CrossrefLinker,
    timeout: Option<Duration>,
}

pub fn crossref_metadata_factory(params: &toml::Table) -> Result<Box<dyn PrepEndpoint>> {
    let settings: CrossrefMetadataSettings = bind_settings(CROSSREF_METADATA, params)?;
    Ok(Box::new(CrossrefMetadata {
        linker: CrossrefLinker::new(settings.api_url, settings.min_similarity),
        timeout: settings.timeout_secs.map(Duration::from_secs),
    }))
}

impl PrepEndpoint for CrossrefMetadata {
    fn prepare(&self, ctx: &PrepContext<'_>, record: &mut Record) -> Result<()> {
        if excluded(record) {
            return Ok(());
        }
        let timeout = self.timeout.unwrap_or_else(|| ctx.op.timeout());
        self.linker.link(ctx.op, record, true, timeout)
    }
}
