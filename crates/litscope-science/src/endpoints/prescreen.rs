//! Prescreen endpoints: scope rules, a CSV decision table and a pass-through.

use std::collections::BTreeMap;
use std::path::PathBuf;

use litscope_core::endpoints::PrescreenEndpoint;
use litscope_core::models::fields;
use litscope_core::registry::bind_settings;
use litscope_core::{Operation, Record, RecordMap, RecordState, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::prep::normalize_language;
use crate::formats::table::{parse_decision, read_rows, write_rows};

pub const SCOPE_PRESCREEN: &str = "colrev.scope_prescreen";
pub const PRESCREEN_TABLE: &str = "colrev.prescreen_table";
pub const CONDITIONAL_PRESCREEN: &str = "colrev.conditional_prescreen";

/// Records this run may decide on: `md_processed`, restricted to `split`
/// when one is given.
fn pending<'a>(records: &'a mut RecordMap, split: &'a [String]) -> impl Iterator<Item = &'a mut Record> + 'a {
    records
        .values_mut()
        .filter(move |r| r.status() == RecordState::MdProcessed && (split.is_empty() || split.contains(&r.id)))
}

// ─── Scope ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeSettings {
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    /// ISO 639-3 codes; records in other languages are out of scope.
    pub languages: Vec<String>,
    /// Entrytypes in scope; empty admits all.
    pub entrytypes: Vec<String>,
}

/// Excludes records outside the configured years, languages or entrytypes.
/// Records in scope stay undecided for the next endpoint.
pub struct ScopePrescreen {
    settings: ScopeSettings,
}

pub fn scope_factory(params: &toml::Table) -> Result<Box<dyn PrescreenEndpoint>> {
    Ok(Box::new(ScopePrescreen {
        settings: bind_settings(SCOPE_PRESCREEN, params)?,
    }))
}

impl ScopePrescreen {
    fn out_of_scope(&self, record: &Record) -> Option<String> {
        let year = record.value(fields::YEAR).and_then(|y| y.trim().parse::<i32>().ok());
        if let (Some(year), Some(min)) = (year, self.settings.min_year) {
            if year < min {
                return Some(format!("published before {min}"));
            }
        }
        if let (Some(year), Some(max)) = (year, self.settings.max_year) {
            if year > max {
                return Some(format!("published after {max}"));
            }
        }
        if !self.settings.languages.is_empty() {
            if let Some(language) = record.value(fields::LANGUAGE) {
                let code = normalize_language(language).unwrap_or_else(|| language.to_lowercase());
                if !self.settings.languages.contains(&code) {
                    return Some(format!("language of {code}"));
                }
            }
        }
        if !self.settings.entrytypes.is_empty() && !self.settings.entrytypes.contains(&record.entrytype) {
            return Some(format!("entrytype {}", record.entrytype));
        }
        None
    }

    fn exclude(&self, records: &mut RecordMap, split: &[String]) -> Result<usize> {
        let mut excluded = 0;
        for record in pending(records, split) {
            if let Some(reason) = self.out_of_scope(record) {
                record.prescreen_exclude(&reason)?;
                excluded += 1;
            }
        }
        Ok(excluded)
    }
}

impl PrescreenEndpoint for ScopePrescreen {
    fn run_prescreen(&self, _op: &Operation<'_>, records: &mut RecordMap, split: &[String]) -> Result<()> {
        let excluded = self.exclude(records, split)?;
        info!(excluded, "scope prescreen");
        Ok(())
    }
}

// ─── Table ─────────────────────────────────────────────────

const PRESCREEN_FILE: &str = "prescreen.csv";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PrescreenRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    year: String,
    #[serde(default)]
    journal: String,
    #[serde(default)]
    inclusion: String,
    #[serde(default)]
    exclusion_reason: String,
}

impl PrescreenRow {
    fn from_record(record: &Record) -> Self {
        let field = |key: &str| record.value(key).unwrap_or_default().to_string();
        Self {
            id: record.id.clone(),
            title: field(fields::TITLE),
            author: field(fields::AUTHOR),
            year: field(fields::YEAR),
            journal: record
                .value(fields::JOURNAL)
                .or_else(|| record.value(fields::BOOKTITLE))
                .unwrap_or_default()
                .to_string(),
            ..Self::default()
        }
    }
}

/// Exports undecided records to `data/prescreen.csv`; the next run applies
/// the `inclusion` column (`yes`/`no`).
///
/// Applied rows stay in the table until a later run finds their records
/// decided in the committed dataset, so a stage that is rolled back can
/// apply them again.
pub struct PrescreenTable;

pub fn table_factory(_params: &toml::Table) -> Result<Box<dyn PrescreenEndpoint>> {
    Ok(Box::new(PrescreenTable))
}

fn table_path(op: &Operation<'_>) -> PathBuf {
    op.dataset().project().data_dir().join(PRESCREEN_FILE)
}

fn apply_rows(rows: &[PrescreenRow], records: &mut RecordMap, split: &[String]) -> Result<usize> {
    let decisions: BTreeMap<&str, &PrescreenRow> = rows.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut decided = 0;
    for record in pending(records, split) {
        let Some(row) = decisions.get(record.id.as_str()) else {
            continue;
        };
        match parse_decision(&row.inclusion) {
            Some(true) => record.prescreen_include()?,
            Some(false) => {
                let reason = if row.exclusion_reason.trim().is_empty() {
                    "prescreen table"
                } else {
                    row.exclusion_reason.trim()
                };
                record.prescreen_exclude(reason)?;
            }
            None => continue,
        }
        decided += 1;
    }
    Ok(decided)
}

/// One run over the table: drops rows whose records were decided before
/// this run, applies the rest, and returns the rows to write back (applied
/// rows, rows still undecided, and new pending records) with the number of
/// undecided ones.
fn update_table(rows: Vec<PrescreenRow>, records: &mut RecordMap, split: &[String]) -> Result<(Vec<PrescreenRow>, usize)> {
    let mut rows: Vec<PrescreenRow> = rows
        .into_iter()
        .filter(|row| {
            records
                .get(&row.id)
                .is_some_and(|r| r.status() == RecordState::MdProcessed)
        })
        .collect();
    let decided = apply_rows(&rows, records, split)?;
    if decided > 0 {
        info!(decided, "applied prescreen table");
    }

    let mut undecided = 0;
    for record in pending(records, split) {
        undecided += 1;
        if !rows.iter().any(|row| row.id == record.id) {
            rows.push(PrescreenRow::from_record(record));
        }
    }
    Ok((rows, undecided))
}

impl PrescreenEndpoint for PrescreenTable {
    fn run_prescreen(&self, op: &Operation<'_>, records: &mut RecordMap, split: &[String]) -> Result<()> {
        let path = table_path(op);
        let rows: Vec<PrescreenRow> = if path.is_file() { read_rows(&path)? } else { Vec::new() };
        let (rows, undecided) = update_table(rows, records, split)?;

        if rows.is_empty() {
            if path.is_file() {
                std::fs::remove_file(&path)?;
            }
            return Ok(());
        }
        write_rows(&path, &rows)?;
        if undecided > 0 {
            warn!(
                records = undecided,
                file = %op.dataset().project().relative(&path).display(),
                "fill in the inclusion column (yes/no) and run prescreen again"
            );
        }
        Ok(())
    }
}

// ─── Pass-through ──────────────────────────────────────────

/// Includes every pending record (for reviews without a prescreen).
pub struct ConditionalPrescreen;

pub fn conditional_factory(_params: &toml::Table) -> Result<Box<dyn PrescreenEndpoint>> {
    Ok(Box::new(ConditionalPrescreen))
}

impl PrescreenEndpoint for ConditionalPrescreen {
    fn run_prescreen(&self, _op: &Operation<'_>, records: &mut RecordMap, split: &[String]) -> Result<()> {
        for record in pending(records, split) {
            record.prescreen_include()?;
        }
        Ok(())
    }
}
