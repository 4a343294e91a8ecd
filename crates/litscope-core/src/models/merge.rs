//! Record fusion used by deduplication and feed reconciliation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{LitscopeError, Result};
use crate::models::fields::{self, values};
use crate::models::provenance::FieldProvenance;
use crate::models::record::{FieldEdit, Record};
use crate::quality::{percent_upper_chars, DefectCode};

static PART_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"part [a-z0-9]+$").expect("valid regex"));

/// Title terms that identify a notice about a work rather than the work.
const NOTICE_TERMS: [&str; 6] = [
    "erratum",
    "correction",
    "corrigendum",
    "comment",
    "commentary",
    "response",
];

/// How trustworthy a provenance source is. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceAuthority {
    Derived = 10,
    Primary = 50,
    Curated = 100,
}

impl SourceAuthority {
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// Classifies the most recent editor of a (possibly chained) source.
    /// Sources starting with one of `primary_prefixes`, and values that came
    /// with the upstream record unchanged, count as primary.
    pub fn classify(source: &str, primary_prefixes: &[&str]) -> Self {
        let latest = source.rsplit('|').next().unwrap_or(source).trim();
        if latest.contains(values::CURATED) || latest.starts_with("curated:") {
            Self::Curated
        } else if latest.is_empty()
            || latest == fields::sources::ORIGINAL
            || primary_prefixes.iter().any(|p| !p.is_empty() && latest.starts_with(p))
        {
            Self::Primary
        } else {
            Self::Derived
        }
    }
}

/// Options for [`Record::merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeOptions<'a> {
    /// Source assumed for fields of the merging record without provenance.
    pub default_source: &'a str,
    /// Origin prefixes whose masterdata should win, in order of preference.
    pub preferred_sources: &'a [String],
}

/// Position of the first preferred source matching one of the record's
/// origins; `usize::MAX` when none matches.
pub fn preference_rank(record: &Record, preferred: &[String]) -> usize {
    preferred
        .iter()
        .position(|prefix| record.origins().iter().any(|o| o.contains(prefix.as_str())))
        .unwrap_or(usize::MAX)
}

fn prevent_invalid_merges(main: &Record, merging: &Record) -> Result<()> {
    let title_a = main.get(fields::TITLE).unwrap_or_default().to_lowercase();
    let title_b = merging.get(fields::TITLE).unwrap_or_default().to_lowercase();

    let part_a = PART_SUFFIX.find(&title_a).map(|m| m.as_str());
    let part_b = PART_SUFFIX.find(&title_b).map(|m| m.as_str());
    if part_a != part_b {
        return Err(LitscopeError::InvalidMerge(format!(
            "{} and {} are different parts",
            main.id, merging.id
        )));
    }

    let terms_a: Vec<&str> = NOTICE_TERMS.iter().copied().filter(|t| title_a.contains(t)).collect();
    let terms_b: Vec<&str> = NOTICE_TERMS.iter().copied().filter(|t| title_b.contains(t)).collect();
    if terms_a != terms_b {
        return Err(LitscopeError::InvalidMerge(format!(
            "{} and {} differ in notice terms",
            main.id, merging.id
        )));
    }
    Ok(())
}

fn normalized(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn select_best_author<'v>(main: &'v Record, merging: &'v Record, a: &'v str, b: &'v str) -> &'v str {
    let a_defects = main.has_quality_defects(fields::AUTHOR);
    let b_defects = merging.has_quality_defects(fields::AUTHOR);
    if a_defects != b_defects {
        return if a_defects { b } else { a };
    }
    if percent_upper_chars(a) > 0.8 && percent_upper_chars(b) <= 0.8 {
        return b;
    }
    a
}

fn select_best_pages<'v>(a: &'v str, b: &'v str) -> &'v str {
    if b.contains("--") && !a.contains("--") { b } else { a }
}

fn select_best_title<'v>(a: &'v str, b: &'v str) -> &'v str {
    if a.replace(" - ", ": ") == b.replace(" - ", ": ") {
        return a;
    }
    let ends_with_marker = b.ends_with(['*', '1', '2']);
    if !ends_with_marker && percent_upper_chars(a) > percent_upper_chars(b) {
        return b;
    }
    a
}

fn select_best_container<'v>(a: &'v str, b: &'v str) -> &'v str {
    let mut best = a;
    if a.contains('.') && !b.contains('.') {
        best = b;
    }
    if percent_upper_chars(a) > percent_upper_chars(b) {
        best = b;
    }
    best
}

impl Record {
    /// Merges `other` into `self`.
    ///
    /// Origins are united, the status becomes the earlier of the two,
    /// curated masterdata wins over non-curated, a preferred source wins
    /// masterdata, and otherwise the better value is fused field by field. Conflicting masterdata without a curated source keeps both
    /// sources in provenance together with a `disagreement` note.
    pub fn merge(&mut self, other: &Record, opts: &MergeOptions<'_>) -> Result<()> {
        prevent_invalid_merges(self, other)?;

        self.origins.extend(other.origins.iter().cloned());
        if other.status < self.status {
            self.status = other.status;
        }

        if other.masterdata_is_curated() && !self.masterdata_is_curated() {
            self.fields
                .retain(|k, _| !fields::is_identifying(k) || k == fields::PAGES);
            self.masterdata_provenance = other.masterdata_provenance.clone();
            for (key, value) in other.fields.iter().filter(|(k, _)| fields::is_masterdata(k)) {
                self.fields.insert(key.clone(), value.clone());
            }
        }

        let other_preferred = !opts.preferred_sources.is_empty()
            && preference_rank(other, opts.preferred_sources)
                < preference_rank(self, opts.preferred_sources);

        for (key, value) in &other.fields {
            if value.trim().is_empty() {
                continue;
            }
            let prov = other
                .get_field_provenance(key)
                .cloned()
                .unwrap_or_else(|| FieldProvenance::new(opts.default_source, ""));

            if fields::is_masterdata(key) && self.masterdata_is_curated() {
                continue;
            }

            if fields::is_masterdata(key) {
                if self.contains(key) {
                    let prefer_other = (!opts.preferred_sources.is_empty()).then_some(other_preferred);
                    self.fuse_masterdata(other, key, &prov, prefer_other);
                } else {
                    self.update_field_with(
                        key,
                        value.clone(),
                        &prov.source,
                        FieldEdit::replace().with_note(&prov.note),
                    );
                }
            } else if key == fields::FILE {
                match self.fields.get(key).cloned() {
                    Some(existing) if !existing.split(';').any(|f| f == value) => {
                        self.fields.insert(key.clone(), format!("{existing};{value}"));
                    }
                    Some(_) => {}
                    None => {
                        self.update_field_with(key, value.clone(), &prov.source, FieldEdit::replace());
                    }
                }
            } else if !self.contains(key) {
                self.update_field_with(
                    key,
                    value.clone(),
                    &prov.source,
                    FieldEdit::replace().with_note(&prov.note),
                );
            } else if let Some(existing) = self.data_provenance.get_mut(key) {
                existing.absorb_notes(&prov);
            }
        }
        Ok(())
    }

    /// Settles a masterdata field both records hold. `prefer_other` is the
    /// verdict of the preferred-source rule, if one is configured; otherwise
    /// the better value is picked per field. Values that differ beyond
    /// punctuation and case keep both sources (`kept|dropped`) and a
    /// `disagreement` note.
    fn fuse_masterdata(&mut self, other: &Record, key: &str, other_prov: &FieldProvenance, prefer_other: Option<bool>) {
        let (Some(current), Some(candidate)) = (self.get(key), other.get(key)) else {
            return;
        };
        if current == candidate {
            return;
        }
        let candidate = candidate.to_string();

        if normalized(current) == normalized(&candidate) {
            if prefer_other == Some(true) {
                self.update_field_with(key, candidate, &other_prov.source, FieldEdit::replace());
            }
            return;
        }

        let take_other = match prefer_other {
            Some(preferred) => preferred,
            None => {
                let best = match key {
                    fields::AUTHOR => select_best_author(self, other, current, &candidate),
                    fields::PAGES => select_best_pages(current, &candidate),
                    fields::TITLE => select_best_title(current, &candidate),
                    fields::JOURNAL | fields::BOOKTITLE => select_best_container(current, &candidate),
                    _ => current,
                };
                best != current
            }
        };

        let current_source = self.field_source(key, fields::sources::ORIGINAL);
        let (kept, dropped) = if take_other {
            self.fields.insert(key.to_string(), candidate);
            (other_prov.source.clone(), current_source)
        } else {
            (current_source, other_prov.source.clone())
        };
        let prov = self
            .masterdata_provenance
            .entry(key.to_string())
            .or_default();
        prov.source = format!("{kept}|{dropped}");
        prov.add_note(DefectCode::Disagreement.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RecordState;
    use pretty_assertions::assert_eq;

    fn record(id: &str, origin: &str, fields_: &[(&str, &str)]) -> Record {
        let mut r = Record::new(id, "article");
        r.add_origin(origin);
        for (k, v) in fields_ {
            r.update_field(k, *v, origin);
        }
        r
    }

    #[test]
    fn merge_unites_origins_commutatively() {
        let a = record("A", "feed-1/1", &[(fields::TITLE, "Digital platforms")]);
        let b = record("B", "feed-1/2", &[(fields::TITLE, "Digital platforms")]);
        let opts = MergeOptions::default();

        let mut ab = a.clone();
        ab.merge(&b, &opts).unwrap();
        let mut ba = b.clone();
        ba.merge(&a, &opts).unwrap();
        assert_eq!(ab.origins(), ba.origins());
        assert_eq!(ab.origins().len(), 2);
    }

    #[test]
    fn merged_status_is_the_earlier_one() {
        let mut a = record("A", "feed-1/1", &[(fields::TITLE, "x")]);
        a.force_status(RecordState::MdProcessed);
        let mut b = record("B", "feed-2/1", &[(fields::TITLE, "x")]);
        b.force_status(RecordState::MdPrepared);
        a.merge(&b, &MergeOptions::default()).unwrap();
        assert_eq!(a.status(), RecordState::MdPrepared);
    }

    #[test]
    fn preferred_source_wins_masterdata() {
        let preferred = vec!["crossref".to_string()];
        let opts = MergeOptions {
            default_source: "merge",
            preferred_sources: &preferred,
        };
        let mut main = record("A", "feed-1/1", &[(fields::TITLE, "Digital Platforms: a review")]);
        let other = record("B", "crossref/000001", &[(fields::TITLE, "Digital platforms - A review")]);
        main.merge(&other, &opts).unwrap();
        assert_eq!(main.get(fields::TITLE), Some("Digital platforms - A review"));
        assert_eq!(
            main.get_field_provenance(fields::TITLE).unwrap().source,
            "crossref/000001"
        );
    }

    #[test]
    fn conflicting_masterdata_records_disagreement() {
        let mut main = record("A", "feed-1/1", &[(fields::PAGES, "1-10")]);
        let other = record("B", "feed-2/1", &[(fields::PAGES, "1--12")]);
        main.merge(&other, &MergeOptions::default()).unwrap();
        assert_eq!(main.get(fields::PAGES), Some("1--12"));
        let prov = main.get_field_provenance(fields::PAGES).unwrap();
        assert_eq!(prov.source, "feed-2/1|feed-1/1");
        assert!(prov.has_note("disagreement"));
    }

    #[test]
    fn conflicting_dois_keep_both_sources() {
        let mut main = record("A", "f1/1", &[(fields::TITLE, "Digital platforms"), (fields::DOI, "10.1/AAA")]);
        let other = record("B", "f2/1", &[(fields::TITLE, "Digital platforms"), (fields::DOI, "10.1/BBB")]);
        main.merge(&other, &MergeOptions::default()).unwrap();
        assert_eq!(main.get(fields::DOI), Some("10.1/AAA"));
        let prov = main.get_field_provenance(fields::DOI).unwrap();
        assert_eq!(prov.source, "f1/1|f2/1");
        assert!(prov.has_note("disagreement"));
        assert!(!main.get_field_provenance(fields::TITLE).unwrap().has_note("disagreement"));
    }

    #[test]
    fn preferred_source_conflicts_are_noted() {
        let preferred = vec!["crossref".to_string()];
        let opts = MergeOptions {
            default_source: "merge",
            preferred_sources: &preferred,
        };
        let mut main = record("A", "feed-1/1", &[(fields::YEAR, "2019"), (fields::LANGUAGE, "eng")]);
        let other = record("B", "crossref/000001", &[(fields::YEAR, "2020"), (fields::LANGUAGE, "deu")]);
        main.merge(&other, &opts).unwrap();
        assert_eq!(main.get(fields::YEAR), Some("2020"));
        assert_eq!(main.get(fields::LANGUAGE), Some("deu"));
        let prov = main.get_field_provenance(fields::YEAR).unwrap();
        assert_eq!(prov.source, "crossref/000001|feed-1/1");
        assert!(prov.has_note("disagreement"));

        // The same preference keeps the main record's value when it ranks first.
        let mut crossref = record("C", "crossref/000002", &[(fields::YEAR, "2021")]);
        crossref.merge(&record("D", "feed-1/2", &[(fields::YEAR, "2018")]), &opts).unwrap();
        assert_eq!(crossref.get(fields::YEAR), Some("2021"));
        let prov = crossref.get_field_provenance(fields::YEAR).unwrap();
        assert_eq!(prov.source, "crossref/000002|feed-1/2");
        assert!(prov.has_note("disagreement"));
    }

    #[test]
    fn curated_masterdata_is_adopted() {
        let mut main = record("A", "feed-1/1", &[(fields::TITLE, "old"), (fields::YEAR, "2019")]);
        let mut curated = record("B", "curation/1", &[(fields::TITLE, "New title")]);
        curated.mark_masterdata_curated("curated:https://example.org/repo");
        main.merge(&curated, &MergeOptions::default()).unwrap();
        assert!(main.masterdata_is_curated());
        assert_eq!(main.get(fields::TITLE), Some("New title"));
        assert!(!main.contains(fields::YEAR));
    }

    #[test]
    fn data_fields_are_added_not_overwritten() {
        let mut main = record("A", "feed-1/1", &[("keywords", "a")]);
        let other = record("B", "feed-2/1", &[("keywords", "b"), ("abstract", "text")]);
        main.merge(&other, &MergeOptions::default()).unwrap();
        assert_eq!(main.get("keywords"), Some("a"));
        assert_eq!(main.get("abstract"), Some("text"));
    }

    #[test]
    fn invalid_merges_are_refused() {
        let mut a = record("A", "f/1", &[(fields::TITLE, "Platform design part 1")]);
        let b = record("B", "f/2", &[(fields::TITLE, "Platform design part 2")]);
        assert!(matches!(
            a.merge(&b, &MergeOptions::default()),
            Err(LitscopeError::InvalidMerge(_))
        ));

        let c = record("C", "f/3", &[(fields::TITLE, "Erratum: Platform design part 1")]);
        assert!(a.merge(&c, &MergeOptions::default()).is_err());
    }

    #[test]
    fn authority_classification() {
        let prefixes = ["crossref/", "https://api.crossref.org"];
        assert_eq!(
            SourceAuthority::classify("crossref/000001", &prefixes),
            SourceAuthority::Primary
        );
        assert_eq!(
            SourceAuthority::classify("crossref/000001|colrev.journal_polish", &prefixes),
            SourceAuthority::Derived
        );
        assert_eq!(
            SourceAuthority::classify("curated:https://x", &prefixes),
            SourceAuthority::Curated
        );
        assert!(SourceAuthority::Curated > SourceAuthority::Primary);
    }
}
