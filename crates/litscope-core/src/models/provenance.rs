use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Separator between notes of one provenance entry.
pub const NOTE_SEPARATOR: char = '|';

/// Prefix marking a defect as acknowledged and not to be reported again.
pub const IGNORE_PREFIX: &str = "IGNORE:";

/// Where a field value came from and which defects it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldProvenance {
    pub source: String,
    #[serde(default)]
    pub note: String,
}

impl FieldProvenance {
    pub fn new(source: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            note: note.into(),
        }
    }

    pub fn notes(&self) -> Vec<&str> {
        self.note
            .split(NOTE_SEPARATOR)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect()
    }

    pub fn has_note(&self, note: &str) -> bool {
        self.notes().contains(&note)
    }

    /// Notes that are defects still to be addressed.
    pub fn defects(&self) -> Vec<&str> {
        self.notes()
            .into_iter()
            .filter(|n| !n.starts_with(IGNORE_PREFIX))
            .collect()
    }

    /// Adds a note unless it (or its acknowledged form) is already present.
    /// Returns whether the note list changed.
    pub fn add_note(&mut self, note: &str) -> bool {
        let note = note.trim();
        if note.is_empty() {
            return false;
        }
        let notes = self.notes();
        if notes.contains(&note) || notes.contains(&format!("{IGNORE_PREFIX}{note}").as_str()) {
            return false;
        }
        let mut notes: Vec<String> = notes.into_iter().map(str::to_string).collect();
        notes.push(note.to_string());
        self.note = notes.join(&NOTE_SEPARATOR.to_string());
        true
    }

    /// Removes a note and its acknowledged form.
    pub fn remove_note(&mut self, note: &str) -> bool {
        let ignored = format!("{IGNORE_PREFIX}{note}");
        let before = self.notes().len();
        let kept: Vec<String> = self
            .notes()
            .into_iter()
            .filter(|n| *n != note && *n != ignored)
            .map(str::to_string)
            .collect();
        let changed = kept.len() != before;
        self.note = kept.join(&NOTE_SEPARATOR.to_string());
        changed
    }

    /// Merges notes from another entry, keeping order of first appearance.
    pub fn absorb_notes(&mut self, other: &FieldProvenance) -> bool {
        let mut changed = false;
        for note in other.notes() {
            changed |= self.add_note(note);
        }
        changed
    }
}

pub type ProvenanceMap = BTreeMap<String, FieldProvenance>;

/// Serializes a provenance map as `key:source;note;` lines, the form used
/// in flat (wire format) mappings.
pub fn provenance_to_flat(map: &ProvenanceMap) -> String {
    map.iter()
        .map(|(key, prov)| format!("{key}:{};{};", prov.source, prov.note))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses the flat form written by [`provenance_to_flat`]. Malformed lines
/// are skipped.
pub fn provenance_from_flat(flat: &str) -> ProvenanceMap {
    let mut map = ProvenanceMap::new();
    for line in flat.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let rest = rest.strip_suffix(';').unwrap_or(rest);
        let (source, note) = match rest.rsplit_once(';') {
            Some((source, note)) => (source, note),
            None => (rest, ""),
        };
        map.insert(key.trim().to_string(), FieldProvenance::new(source, note));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_are_deduplicated_and_respect_ignore() {
        let mut prov = FieldProvenance::new("feed-1/A2020", "");
        assert!(prov.add_note("missing"));
        assert!(!prov.add_note("missing"));
        assert!(prov.add_note("mostly-all-caps"));
        assert_eq!(prov.note, "missing|mostly-all-caps");

        let mut ignored = FieldProvenance::new("manual", "IGNORE:missing");
        assert!(!ignored.add_note("missing"));
        assert!(ignored.defects().is_empty());
    }

    #[test]
    fn remove_note_drops_ignored_form() {
        let mut prov = FieldProvenance::new("x", "IGNORE:missing|html-tags");
        assert!(prov.remove_note("missing"));
        assert_eq!(prov.note, "html-tags");
        assert!(!prov.remove_note("missing"));
    }

    #[test]
    fn flat_form_round_trips() {
        let mut map = ProvenanceMap::new();
        map.insert("author".into(), FieldProvenance::new("feed-1/A2020", ""));
        map.insert(
            "doi".into(),
            FieldProvenance::new("https://api.crossref.org/works/10.1/x", "doi-not-matching-pattern"),
        );
        let flat = provenance_to_flat(&map);
        assert_eq!(provenance_from_flat(&flat), map);
    }
}
