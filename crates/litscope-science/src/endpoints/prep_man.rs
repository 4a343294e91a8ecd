//! `colrev.prep_man_export`: round-trips records needing manual prep through
//! a BibTeX file the user edits.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use litscope_core::endpoints::PrepManEndpoint;
use litscope_core::models::fields::{self, sources};
use litscope_core::{
    LitscopeError, Operation, QualityModel, Record, RecordMap, RecordState, Result,
};
use tracing::{info, warn};

use crate::formats::bibtex::{self, WriteOptions};

pub const PREP_MAN_EXPORT: &str = "colrev.prep_man_export";

const EXPORT_FILE: &str = "records_prep_man.bib";

pub struct PrepManExport;

pub fn factory(_params: &toml::Table) -> Result<Box<dyn PrepManEndpoint>> {
    Ok(Box::new(PrepManExport))
}

fn export_path(op: &Operation<'_>) -> PathBuf {
    op.dataset().project().prep_man_dir().join(EXPORT_FILE)
}

/// Applies the user's edits to one record. Returns whether anything changed.
fn apply_edits(record: &mut Record, edited: &Record, quality: &QualityModel) -> Result<bool> {
    let before = record.clone();
    if edited.entrytype != record.entrytype {
        record.change_entrytype(&edited.entrytype, quality)?;
    }
    for (key, value) in edited.fields() {
        if fields::is_reserved(key) || record.get(key) == Some(value.as_str()) {
            continue;
        }
        record.update_field(key, value.as_str(), sources::MANUAL);
    }
    let removed: Vec<String> = record
        .fields()
        .keys()
        .filter(|k| !edited.contains(k))
        .cloned()
        .collect();
    for key in removed {
        // Deleting a masterdata field acknowledges that it is missing.
        record.remove_field(&key, fields::is_masterdata(&key), sources::MANUAL);
    }
    quality.run(record);
    Ok(*record != before)
}

fn import(path: &Path, records: &mut RecordMap, quality: &QualityModel) -> Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let file = bibtex::parse(&content);
    for err in &file.errors {
        warn!(file = %path.display(), "{err}");
    }

    let mut prepared = 0;
    for entry in file.entries {
        let edited = Record::from_map(entry.into_map())?;
        let Some(record) = records.get_mut(&edited.id) else {
            warn!(record = %edited.id, "not in the dataset; ignoring");
            continue;
        };
        if record.status() != RecordState::MdNeedsManualPreparation {
            continue;
        }
        apply_edits(record, &edited, quality)?;
        if !quality.has_fatal_defects(record) {
            record.set_status(RecordState::MdPrepared)?;
            prepared += 1;
        }
    }
    Ok(prepared)
}

impl PrepManEndpoint for PrepManExport {
    /// Imports the edited file if there is one, then exports every record
    /// that needed manual preparation at the start of this run. Records
    /// prepared now stay in the file (with the user's edits) until a later
    /// run finds them prepared in the committed dataset.
    fn prepare_manual(&self, op: &Operation<'_>, records: &mut RecordMap) -> Result<()> {
        let path = export_path(op);
        let quality = QualityModel::new(op.settings().prep.defect_policy);
        let needed: BTreeSet<String> = records
            .values()
            .filter(|r| r.status() == RecordState::MdNeedsManualPreparation)
            .map(|r| r.id.clone())
            .collect();

        if path.is_file() {
            let prepared = import(&path, records, &quality)?;
            info!(prepared, "imported manual preparation");
        }

        let export: Vec<&Record> = needed.iter().filter_map(|id| records.get(id)).collect();
        if export.is_empty() {
            if path.is_file() {
                std::fs::remove_file(&path)?;
            }
            return Ok(());
        }
        let dir = path
            .parent()
            .ok_or_else(|| LitscopeError::ConfigError(format!("invalid export path {}", path.display())))?;
        std::fs::create_dir_all(dir)?;
        let content = bibtex::write_records(export.iter().copied(), WriteOptions { include_reserved: true });
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;

        let pending = export
            .iter()
            .filter(|r| r.status() == RecordState::MdNeedsManualPreparation)
            .count();
        if pending > 0 {
            info!(
                records = pending,
                file = %op.dataset().project().relative(&path).display(),
                "fix the records (defects are listed in masterdata_provenance) and run prep-man again"
            );
        }
        Ok(())
    }
}
