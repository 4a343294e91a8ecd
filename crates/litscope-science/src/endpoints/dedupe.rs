use litscope_core::endpoints::DedupeEndpoint;
use litscope_core::registry::bind_settings;
use litscope_core::{Operation, Record, RecordMap, RecordState, Result};
use serde::Deserialize;
use tracing::info;

use crate::dedup::DuplicateFinder;

pub const DEDUPE: &str = "colrev.dedupe";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupeSettings {
    pub title_threshold: f64,
    pub author_threshold: f64,
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            title_threshold: 0.91,
            author_threshold: 0.85,
        }
    }
}

/// Blocks on DOI and ISBN, then compares title, first author and year.
pub struct Dedupe {
    finder: DuplicateFinder,
}

pub fn factory(params: &toml::Table) -> Result<Box<dyn DedupeEndpoint>> {
    let settings: DedupeSettings = bind_settings(DEDUPE, params)?;
    Ok(Box::new(Dedupe {
        finder: DuplicateFinder::new()
            .with_title_threshold(settings.title_threshold)
            .with_author_threshold(settings.author_threshold),
    }))
}

fn is_candidate(record: &Record) -> bool {
    let status = record.status();
    status >= RecordState::MdPrepared
        && !status.is_manual_branch()
        && !matches!(status, RecordState::RevPrescreenExcluded | RecordState::RevExcluded)
}

impl Dedupe {
    fn groups(&self, records: &RecordMap) -> Vec<Vec<String>> {
        let candidates: Vec<&Record> = records.values().filter(|r| is_candidate(r)).collect();
        // Groups of already processed records were settled in earlier runs.
        self.finder
            .find_all(&candidates)
            .into_iter()
            .filter(|group| {
                group
                    .iter()
                    .any(|id| records.get(id).is_some_and(|r| r.status() == RecordState::MdPrepared))
            })
            .collect()
    }
}

impl DedupeEndpoint for Dedupe {
    fn run_dedupe(&self, _op: &Operation<'_>, records: &RecordMap) -> Result<Vec<Vec<String>>> {
        let groups = self.groups(records);
        info!(groups = groups.len(), "duplicates found");
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use litscope_core::models::fields;
    use pretty_assertions::assert_eq;

    fn record(id: &str, status: RecordState, doi: &str) -> Record {
        let mut record = Record::new(id, "article");
        record.force_status(status);
        record.update_field(fields::DOI, doi, "feed/1");
        record.update_field(fields::TITLE, format!("Title of {id}"), "feed/1");
        record
    }

    #[test]
    fn only_groups_with_new_records_are_reported() {
        let records: RecordMap = [
            record("A", RecordState::MdProcessed, "10.1234/old"),
            record("B", RecordState::RevIncluded, "https://doi.org/10.1234/OLD"),
            record("C", RecordState::MdProcessed, "10.1234/new"),
            record("D", RecordState::MdPrepared, "10.1234/NEW"),
            record("E", RecordState::MdNeedsManualPreparation, "10.1234/new"),
        ]
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

        let dedupe = Dedupe {
            finder: DuplicateFinder::new(),
        };
        assert_eq!(dedupe.groups(&records), vec![vec!["C".to_string(), "D".to_string()]]);
    }

    #[test]
    fn thresholds_are_validated_as_parameters() {
        let params = toml::Table::from_iter([("title_treshold".to_string(), toml::Value::Float(0.8))]);
        assert!(factory(&params).is_err());
    }
}
