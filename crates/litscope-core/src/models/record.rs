use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LitscopeError, Result};
use crate::models::fields::{self, sources, values};
use crate::models::provenance::{
    provenance_from_flat, provenance_to_flat, FieldProvenance, ProvenanceMap, IGNORE_PREFIX,
};
use crate::quality::{DefectCode, QualityModel};
use crate::state::RecordState;

/// Records of a project keyed by id.
pub type RecordMap = BTreeMap<String, Record>;

/// A bibliographic record: free-form fields plus status, origins and
/// per-field provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ENTRYTYPE")]
    pub entrytype: String,
    pub(crate) status: RecordState,
    #[serde(rename = "origin", default)]
    pub(crate) origins: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) masterdata_provenance: ProvenanceMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) data_provenance: ProvenanceMap,
    #[serde(flatten)]
    pub(crate) fields: BTreeMap<String, String>,
}

/// Options for [`Record::update_field_with`].
#[derive(Debug, Clone)]
pub struct FieldEdit<'a> {
    pub note: &'a str,
    /// Leave value and provenance untouched when the value does not change.
    pub keep_source_if_equal: bool,
    /// Chain the new source onto the previous one (`previous|source`).
    pub append_edit: bool,
}

impl Default for FieldEdit<'_> {
    fn default() -> Self {
        Self {
            note: "",
            keep_source_if_equal: true,
            append_edit: true,
        }
    }
}

impl<'a> FieldEdit<'a> {
    /// Overwrite the provenance source instead of chaining it.
    pub fn replace() -> Self {
        Self {
            append_edit: false,
            ..Self::default()
        }
    }

    pub fn with_note(mut self, note: &'a str) -> Self {
        self.note = note;
        self
    }
}

impl Record {
    pub fn new(id: impl Into<String>, entrytype: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entrytype: entrytype.into(),
            status: RecordState::MdRetrieved,
            origins: BTreeSet::new(),
            masterdata_provenance: ProvenanceMap::new(),
            data_provenance: ProvenanceMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Builds a record from a flat mapping as produced by wire-format readers.
    ///
    /// Reserved keys are interpreted (`origin` is `;`-separated, provenance
    /// uses the flat `key:source;note;` form); every other key becomes a
    /// field. Fields without provenance stay unprovenanced until
    /// [`Record::align_provenance`] or [`Record::add_provenance_all`] runs.
    pub fn from_map(mut map: BTreeMap<String, String>) -> Result<Self> {
        let id = map
            .remove(fields::ID)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| LitscopeError::RecordNotParsable("record without ID".to_string()))?;
        let entrytype = map
            .remove(fields::ENTRYTYPE)
            .map(|t| t.to_lowercase())
            .unwrap_or_else(|| "misc".to_string());
        let status = match map.remove(fields::STATUS) {
            Some(raw) => raw.parse()?,
            None => RecordState::MdRetrieved,
        };
        let origins = map
            .remove(fields::ORIGIN)
            .map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let masterdata_provenance = map
            .remove(fields::MASTERDATA_PROVENANCE)
            .map(|raw| provenance_from_flat(&raw))
            .unwrap_or_default();
        let data_provenance = map
            .remove(fields::DATA_PROVENANCE)
            .map(|raw| provenance_from_flat(&raw))
            .unwrap_or_default();

        Ok(Self {
            id,
            entrytype,
            status,
            origins,
            masterdata_provenance,
            data_provenance,
            fields: map,
        })
    }

    /// Inverse of [`Record::from_map`].
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.fields.clone();
        map.insert(fields::ID.to_string(), self.id.clone());
        map.insert(fields::ENTRYTYPE.to_string(), self.entrytype.clone());
        map.insert(fields::STATUS.to_string(), self.status.to_string());
        if !self.origins.is_empty() {
            map.insert(
                fields::ORIGIN.to_string(),
                self.origins.iter().cloned().collect::<Vec<_>>().join(";"),
            );
        }
        if !self.masterdata_provenance.is_empty() {
            map.insert(
                fields::MASTERDATA_PROVENANCE.to_string(),
                provenance_to_flat(&self.masterdata_provenance),
            );
        }
        if !self.data_provenance.is_empty() {
            map.insert(
                fields::DATA_PROVENANCE.to_string(),
                provenance_to_flat(&self.data_provenance),
            );
        }
        map
    }

    // ─── Accessors ──────────────────────────────────────────

    pub fn status(&self) -> RecordState {
        self.status
    }

    pub fn origins(&self) -> &BTreeSet<String> {
        &self.origins
    }

    pub fn add_origin(&mut self, origin: impl Into<String>) {
        self.origins.insert(origin.into());
    }

    pub fn set_origins<I, S>(&mut self, origins: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origins = origins.into_iter().map(Into::into).collect();
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            fields::ID => Some(&self.id),
            fields::ENTRYTYPE => Some(&self.entrytype),
            _ => self.fields.get(key).map(String::as_str),
        }
    }

    /// Non-empty value of a field.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn masterdata_provenance(&self) -> &ProvenanceMap {
        &self.masterdata_provenance
    }

    pub fn data_provenance(&self) -> &ProvenanceMap {
        &self.data_provenance
    }

    /// Masterdata confirmed by a curated repository.
    pub fn masterdata_is_curated(&self) -> bool {
        self.masterdata_provenance.contains_key(values::CURATED)
    }

    pub fn mark_masterdata_curated(&mut self, source: &str) {
        self.masterdata_provenance
            .insert(values::CURATED.to_string(), FieldProvenance::new(source, ""));
    }

    // ─── Provenance ─────────────────────────────────────────

    fn provenance_map_mut(&mut self, key: &str) -> &mut ProvenanceMap {
        if fields::is_masterdata(key) {
            &mut self.masterdata_provenance
        } else {
            &mut self.data_provenance
        }
    }

    pub fn get_field_provenance(&self, key: &str) -> Option<&FieldProvenance> {
        if fields::is_masterdata(key) {
            self.masterdata_provenance.get(key)
        } else {
            self.data_provenance.get(key)
        }
    }

    /// Provenance source of a field, falling back to `default_source`.
    pub fn field_source(&self, key: &str, default_source: &str) -> String {
        self.get_field_provenance(key)
            .map(|p| p.source.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_source.to_string())
    }

    /// Sets the source of a field and merges `note` into its notes. An empty
    /// note clears existing notes.
    pub fn add_field_provenance(&mut self, key: &str, source: &str, note: &str) {
        if fields::is_reserved(key) {
            return;
        }
        let map = self.provenance_map_mut(key);
        match map.get_mut(key) {
            None => {
                map.insert(key.to_string(), FieldProvenance::new(source, note));
            }
            Some(prov) => {
                prov.source = source.to_string();
                if note.is_empty() || prov.note.is_empty() {
                    prov.note = note.to_string();
                } else {
                    prov.remove_note(&format!("{IGNORE_PREFIX}{note}"));
                    prov.remove_note(note);
                    prov.add_note(note);
                }
            }
        }
    }

    pub fn add_field_provenance_note(&mut self, key: &str, note: &str) {
        if fields::is_reserved(key) {
            return;
        }
        self.provenance_map_mut(key)
            .entry(key.to_string())
            .or_insert_with(|| FieldProvenance::new(sources::ORIGINAL, ""))
            .add_note(note);
    }

    pub fn remove_field_provenance_note(&mut self, key: &str, note: &str) {
        if let Some(prov) = self.provenance_map_mut(key).get_mut(key) {
            prov.remove_note(note);
        }
    }

    /// Whether a field carries unacknowledged defect notes.
    pub fn has_quality_defects(&self, key: &str) -> bool {
        self.get_field_provenance(key)
            .is_some_and(|p| !p.defects().is_empty())
    }

    /// All unacknowledged defects as `(field, code)` pairs.
    pub fn defects(&self) -> Vec<(String, String)> {
        self.masterdata_provenance
            .iter()
            .chain(self.data_provenance.iter())
            .flat_map(|(key, prov)| {
                prov.defects()
                    .into_iter()
                    .map(move |code| (key.clone(), code.to_string()))
            })
            .collect()
    }

    /// Tags every field with `source`, keeping the notes already attached.
    /// Curated masterdata is left alone.
    pub fn add_provenance_all(&mut self, source: &str) {
        let curated = self.masterdata_is_curated();
        let keys: Vec<String> = self.fields.keys().cloned().collect();
        for key in keys {
            let map = if fields::is_masterdata(&key) {
                if curated {
                    continue;
                }
                &mut self.masterdata_provenance
            } else {
                &mut self.data_provenance
            };
            map.entry(key)
                .and_modify(|prov| prov.source = source.to_string())
                .or_insert_with(|| FieldProvenance::new(source, ""));
        }
    }

    /// Drops provenance of absent fields (unless the absence is
    /// acknowledged) and adds `ORIGINAL` provenance for unprovenanced fields.
    pub fn align_provenance(&mut self) {
        let missing_ack = format!("{IGNORE_PREFIX}{}", DefectCode::Missing.as_str());
        let present: BTreeSet<String> = self.fields.keys().cloned().collect();
        self.masterdata_provenance.retain(|key, prov| {
            key == values::CURATED
                || present.contains(key)
                || prov.has_note(&missing_ack)
                || prov.has_note(DefectCode::Missing.as_str())
        });
        self.data_provenance
            .retain(|key, prov| present.contains(key) || prov.has_note(&missing_ack));

        let curated = self.masterdata_is_curated();
        for key in present {
            if fields::is_masterdata(&key) {
                if !curated && !self.masterdata_provenance.contains_key(&key) {
                    self.masterdata_provenance
                        .insert(key, FieldProvenance::new(sources::ORIGINAL, ""));
                }
            } else if !self.data_provenance.contains_key(&key) {
                self.data_provenance
                    .insert(key, FieldProvenance::new(sources::ORIGINAL, ""));
            }
        }
    }

    /// Fields lacking a provenance entry.
    pub fn unprovenanced_fields(&self) -> Vec<&str> {
        let curated = self.masterdata_is_curated();
        self.fields
            .keys()
            .filter(|key| {
                if fields::is_masterdata(key) {
                    !curated && !self.masterdata_provenance.contains_key(*key)
                } else {
                    !self.data_provenance.contains_key(*key)
                }
            })
            .map(String::as_str)
            .collect()
    }

    // ─── Field edits ────────────────────────────────────────

    pub fn update_field(&mut self, key: &str, value: impl Into<String>, source: &str) {
        self.update_field_with(key, value, source, FieldEdit::default());
    }

    /// Sets a field value and its provenance.
    pub fn update_field_with(
        &mut self,
        key: &str,
        value: impl Into<String>,
        source: &str,
        edit: FieldEdit<'_>,
    ) {
        let value = value.into();
        match key {
            fields::ID => {
                self.id = value;
                return;
            }
            fields::ENTRYTYPE => {
                self.entrytype = value;
                return;
            }
            _ if fields::is_reserved(key) => return,
            _ => {}
        }

        let existing = self.fields.get(key);
        if edit.keep_source_if_equal && existing == Some(&value) {
            return;
        }

        let skip_provenance = fields::is_masterdata(key) && self.masterdata_is_curated();
        if !skip_provenance {
            let source = if edit.append_edit && existing.is_some() {
                match self.get_field_provenance(key) {
                    Some(prev) => format!("{}|{source}", prev.source),
                    None => format!("{}|{source}", sources::ORIGINAL),
                }
            } else {
                source.to_string()
            };
            self.add_field_provenance(key, &source, edit.note);
        }
        self.fields.insert(key.to_string(), value);
    }

    /// Moves a value to a new key, carrying provenance along.
    pub fn rename_field(&mut self, key: &str, new_key: &str) {
        let Some(value) = self.fields.get(key).cloned() else {
            return;
        };
        let mut prov = self
            .get_field_provenance(key)
            .cloned()
            .unwrap_or_else(|| FieldProvenance::new("", ""));
        prov.source = format!("{}|rename-from:{key}", prov.source);

        self.remove_field(key, false, "");
        self.fields.insert(new_key.to_string(), value);
        self.provenance_map_mut(new_key)
            .insert(new_key.to_string(), prov);
    }

    /// Removes a field. With `not_missing_note`, an acknowledged-missing
    /// note keeps the quality model from flagging the absence.
    pub fn remove_field(&mut self, key: &str, not_missing_note: bool, source: &str) {
        self.fields.remove(key);
        if not_missing_note && fields::is_masterdata(key) {
            let prov = self
                .masterdata_provenance
                .entry(key.to_string())
                .or_insert_with(|| FieldProvenance::new(sources::MANUAL, ""));
            prov.note = format!("{IGNORE_PREFIX}{}", DefectCode::Missing.as_str());
            if !source.is_empty() {
                prov.source = source.to_string();
            }
        } else {
            self.masterdata_provenance.remove(key);
            self.data_provenance.remove(key);
        }
    }

    // ─── Status ─────────────────────────────────────────────

    fn invalid_transition(&self, to: RecordState) -> LitscopeError {
        LitscopeError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// Moves the record along one transition of its lifecycle.
    pub fn set_status(&mut self, target: RecordState) -> Result<()> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.has_edge(target) {
            return Err(self.invalid_transition(target));
        }
        self.status = target;
        Ok(())
    }

    /// Walks `path` one transition at a time. On an illegal step the record
    /// keeps the status it started with.
    pub fn advance_through(&mut self, path: &[RecordState]) -> Result<()> {
        let start = self.status;
        for state in path {
            if let Err(e) = self.set_status(*state) {
                self.status = start;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Sets the status without checking the lifecycle. Reserved for merges
    /// and explicit manual overrides.
    pub fn force_status(&mut self, target: RecordState) {
        self.status = target;
    }

    /// Excludes the record at prescreen and records the reason.
    pub fn prescreen_exclude(&mut self, reason: &str) -> Result<()> {
        if matches!(
            self.status,
            RecordState::RevIncluded | RecordState::RevSynthesized
        ) {
            warn!(
                record = %self.id,
                status = %self.status,
                "excluding a record that was already included; check the synthesis"
            );
            self.force_status(RecordState::RevPrescreenExcluded);
        } else {
            // Exclusions during prep pass through the skipped stages.
            let path = self
                .status
                .path_to(RecordState::RevPrescreenExcluded)
                .ok_or_else(|| self.invalid_transition(RecordState::RevPrescreenExcluded))?;
            self.advance_through(&path)?;
        }

        if reason == values::RETRACTED {
            self.update_field_with(
                fields::RETRACTED,
                "yes",
                "prescreen",
                FieldEdit::replace(),
            );
        }
        self.update_field_with(
            fields::PRESCREEN_EXCLUSION,
            reason,
            "prescreen",
            FieldEdit::replace().with_note(reason),
        );

        let unknown: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, v)| v.as_str() == values::UNKNOWN)
            .map(|(k, _)| k.clone())
            .collect();
        for key in unknown {
            self.remove_field(&key, false, "");
        }
        Ok(())
    }

    pub fn prescreen_include(&mut self) -> Result<()> {
        self.set_status(RecordState::RevPrescreenIncluded)
    }

    /// Screen decision with per-criterion values (`criterion=in|out`).
    pub fn screen_include(&mut self, criteria: &BTreeMap<String, bool>) -> Result<()> {
        self.set_status(RecordState::RevIncluded)?;
        self.set_screening_criteria(criteria);
        Ok(())
    }

    pub fn screen_exclude(&mut self, criteria: &BTreeMap<String, bool>) -> Result<()> {
        self.set_status(RecordState::RevExcluded)?;
        self.set_screening_criteria(criteria);
        Ok(())
    }

    fn set_screening_criteria(&mut self, criteria: &BTreeMap<String, bool>) {
        if criteria.is_empty() {
            return;
        }
        let value = criteria
            .iter()
            .map(|(name, ok)| format!("{name}={}", if *ok { "in" } else { "out" }))
            .collect::<Vec<_>>()
            .join(";");
        self.update_field_with(
            fields::SCREENING_CRITERIA,
            value,
            "screen",
            FieldEdit::replace(),
        );
    }

    // ─── Entrytype ──────────────────────────────────────────

    /// Changes the entrytype, moving the venue between `journal` and
    /// `booktitle`, then reruns the quality model.
    pub fn change_entrytype(&mut self, new_type: &str, qm: &QualityModel) -> Result<()> {
        let new_type = new_type.trim().to_lowercase();
        if !qm.supports(&new_type) {
            return Err(LitscopeError::MissingQualityRule(new_type));
        }

        let unknown: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, v)| v.as_str() == values::UNKNOWN)
            .map(|(k, _)| k.clone())
            .collect();
        for key in unknown {
            self.remove_field(&key, false, "");
        }

        self.entrytype = new_type.clone();
        match new_type.as_str() {
            "inproceedings" | "proceedings" => {
                if !self.contains(fields::BOOKTITLE) && self.contains(fields::JOURNAL) {
                    self.rename_field(fields::JOURNAL, fields::BOOKTITLE);
                }
            }
            "article" => {
                if self.contains(fields::BOOKTITLE) {
                    self.rename_field(fields::BOOKTITLE, fields::JOURNAL);
                }
            }
            _ => {}
        }
        qm.run(self);
        Ok(())
    }
}
