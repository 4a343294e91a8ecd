//! Quality model: field-level checks that write defect codes into provenance.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::fields::{self, values};
use crate::models::Record;

pub static DOI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^10\.\d{4,9}/[-._;/:A-Za-z0-9]+$").expect("valid regex"));

static YEAR_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").expect("valid regex"));

static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?(?:i|b|sub|sup|em|strong|p|br|span)\b[^>]*>").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefectCode {
    Missing,
    DoiNotMatchingPattern,
    IsbnNotMatchingPattern,
    YearFormat,
    MostlyAllCaps,
    HtmlTags,
    InconsistentWithEntrytype,
    Disagreement,
}

impl DefectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::DoiNotMatchingPattern => "doi-not-matching-pattern",
            Self::IsbnNotMatchingPattern => "isbn-not-matching-pattern",
            Self::YearFormat => "year-format",
            Self::MostlyAllCaps => "mostly-all-caps",
            Self::HtmlTags => "html-tags",
            Self::InconsistentWithEntrytype => "inconsistent-with-entrytype",
            Self::Disagreement => "disagreement",
        }
    }

    /// Fatal defects keep a record out of `md_prepared`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Missing
                | Self::DoiNotMatchingPattern
                | Self::IsbnNotMatchingPattern
                | Self::YearFormat
                | Self::InconsistentWithEntrytype
        )
    }

    pub fn from_note(note: &str) -> Option<Self> {
        [
            Self::Missing,
            Self::DoiNotMatchingPattern,
            Self::IsbnNotMatchingPattern,
            Self::YearFormat,
            Self::MostlyAllCaps,
            Self::HtmlTags,
            Self::InconsistentWithEntrytype,
            Self::Disagreement,
        ]
        .into_iter()
        .find(|code| code.as_str() == note)
    }
}

impl fmt::Display for DefectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with identifier fields that fail their pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectPolicy {
    /// Keep the value and leave a defect note.
    #[default]
    Retain,
    /// Drop the value together with its provenance.
    Remove,
}

/// Required fields per entrytype.
pub fn required_fields(entrytype: &str) -> Option<&'static [&'static str]> {
    let fields: &'static [&'static str] = match entrytype {
        "article" => &[
            fields::AUTHOR,
            fields::TITLE,
            fields::JOURNAL,
            fields::YEAR,
            fields::VOLUME,
            fields::NUMBER,
        ],
        "inproceedings" => &[fields::AUTHOR, fields::TITLE, fields::BOOKTITLE, fields::YEAR],
        "proceedings" => &[fields::TITLE, fields::BOOKTITLE, fields::YEAR],
        "incollection" | "inbook" => &[
            fields::AUTHOR,
            fields::TITLE,
            fields::BOOKTITLE,
            fields::PUBLISHER,
            fields::YEAR,
        ],
        "book" => &[fields::AUTHOR, fields::TITLE, fields::PUBLISHER, fields::YEAR],
        "phdthesis" | "mastersthesis" | "thesis" => {
            &[fields::AUTHOR, fields::TITLE, fields::YEAR, "school"]
        }
        "techreport" => &[fields::AUTHOR, fields::TITLE, fields::YEAR, "institution"],
        "unpublished" | "online" | "misc" | "software" => {
            &[fields::AUTHOR, fields::TITLE, fields::YEAR]
        }
        _ => return None,
    };
    Some(fields)
}

/// Share of uppercase letters among alphabetic characters.
pub fn percent_upper_chars(input: &str) -> f64 {
    let letters: Vec<char> = input.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return 0.0;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64
}

/// Syntax check for ISBN-10/13 (checksums are verified by the identifier
/// parser used during deduplication).
pub fn isbn_syntax_is_valid(raw: &str) -> bool {
    raw.split(';').map(str::trim).all(|candidate| {
        let compact: String = candidate
            .chars()
            .filter(|c| !matches!(c, '-' | ' '))
            .collect::<String>()
            .to_uppercase();
        match compact.len() {
            10 => {
                compact[..9].chars().all(|c| c.is_ascii_digit())
                    && compact
                        .chars()
                        .last()
                        .is_some_and(|c| c.is_ascii_digit() || c == 'X')
            }
            13 => compact.chars().all(|c| c.is_ascii_digit()),
            _ => false,
        }
    })
}

/// A single check over a record.
pub trait QualityChecker: Send + Sync {
    fn code(&self) -> DefectCode;

    /// Adds or clears this checker's defect notes on `record`.
    fn run(&self, record: &mut Record, policy: DefectPolicy);
}

fn set_defect(record: &mut Record, key: &str, code: DefectCode, present: bool) {
    if present {
        record.add_field_provenance_note(key, code.as_str());
    } else {
        record.remove_field_provenance_note(key, code.as_str());
    }
}

struct MissingFieldChecker;

impl QualityChecker for MissingFieldChecker {
    fn code(&self) -> DefectCode {
        DefectCode::Missing
    }

    fn run(&self, record: &mut Record, _policy: DefectPolicy) {
        let Some(required) = required_fields(&record.entrytype) else {
            return;
        };
        for key in required {
            let missing = record
                .value(key)
                .is_none_or(|v| v == values::UNKNOWN);
            set_defect(record, key, self.code(), missing);
        }
    }
}

struct DoiChecker;

impl QualityChecker for DoiChecker {
    fn code(&self) -> DefectCode {
        DefectCode::DoiNotMatchingPattern
    }

    fn run(&self, record: &mut Record, policy: DefectPolicy) {
        let Some(doi) = record.value(fields::DOI).map(str::to_string) else {
            record.remove_field_provenance_note(fields::DOI, self.code().as_str());
            return;
        };
        let invalid = !DOI_PATTERN.is_match(doi.trim());
        set_defect(record, fields::DOI, self.code(), invalid);
        if invalid && policy == DefectPolicy::Remove {
            debug!(record = %record.id, doi = %doi, "removing DOI with invalid pattern");
            record.remove_field(fields::DOI, false, "");
        }
    }
}

struct IsbnChecker;

impl QualityChecker for IsbnChecker {
    fn code(&self) -> DefectCode {
        DefectCode::IsbnNotMatchingPattern
    }

    fn run(&self, record: &mut Record, policy: DefectPolicy) {
        let Some(isbn) = record.value(fields::ISBN).map(str::to_string) else {
            record.remove_field_provenance_note(fields::ISBN, self.code().as_str());
            return;
        };
        let invalid = !isbn_syntax_is_valid(&isbn);
        set_defect(record, fields::ISBN, self.code(), invalid);
        if invalid && policy == DefectPolicy::Remove {
            record.remove_field(fields::ISBN, false, "");
        }
    }
}

struct YearChecker;

impl QualityChecker for YearChecker {
    fn code(&self) -> DefectCode {
        DefectCode::YearFormat
    }

    fn run(&self, record: &mut Record, _policy: DefectPolicy) {
        let Some(year) = record.value(fields::YEAR).map(str::to_string) else {
            return;
        };
        let invalid = !(YEAR_PATTERN.is_match(&year)
            || year == values::FORTHCOMING
            || year == values::UNKNOWN);
        set_defect(record, fields::YEAR, self.code(), invalid);
    }
}

struct MostlyAllCapsChecker;

impl QualityChecker for MostlyAllCapsChecker {
    fn code(&self) -> DefectCode {
        DefectCode::MostlyAllCaps
    }

    fn run(&self, record: &mut Record, _policy: DefectPolicy) {
        for key in [fields::AUTHOR, fields::TITLE, fields::JOURNAL, fields::BOOKTITLE] {
            let Some(value) = record.value(key).map(str::to_string) else {
                continue;
            };
            let caps = value.len() > 8 && percent_upper_chars(&value) > 0.8;
            set_defect(record, key, self.code(), caps);
        }
    }
}

struct HtmlTagsChecker;

impl QualityChecker for HtmlTagsChecker {
    fn code(&self) -> DefectCode {
        DefectCode::HtmlTags
    }

    fn run(&self, record: &mut Record, _policy: DefectPolicy) {
        for key in [fields::TITLE, fields::JOURNAL, fields::BOOKTITLE, fields::AUTHOR] {
            let Some(value) = record.value(key).map(str::to_string) else {
                continue;
            };
            set_defect(record, key, self.code(), HTML_TAG.is_match(&value));
        }
    }
}

struct EntrytypeChecker;

impl QualityChecker for EntrytypeChecker {
    fn code(&self) -> DefectCode {
        DefectCode::InconsistentWithEntrytype
    }

    fn run(&self, record: &mut Record, _policy: DefectPolicy) {
        let (stray, kept) = match record.entrytype.as_str() {
            "article" => (fields::BOOKTITLE, fields::JOURNAL),
            "inproceedings" => (fields::JOURNAL, fields::BOOKTITLE),
            _ => return,
        };
        let inconsistent = record.value(stray).is_some();
        set_defect(record, stray, self.code(), inconsistent);
        if !inconsistent {
            record.remove_field_provenance_note(kept, self.code().as_str());
        }
    }
}

/// Ordered collection of checkers plus the identifier defect policy.
pub struct QualityModel {
    checkers: Vec<Box<dyn QualityChecker>>,
    policy: DefectPolicy,
}

impl Default for QualityModel {
    fn default() -> Self {
        Self::new(DefectPolicy::default())
    }
}

impl fmt::Debug for QualityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<&str> = self.checkers.iter().map(|c| c.code().as_str()).collect();
        f.debug_struct("QualityModel")
            .field("checkers", &codes)
            .field("policy", &self.policy)
            .finish()
    }
}

impl QualityModel {
    pub fn new(policy: DefectPolicy) -> Self {
        Self {
            checkers: vec![
                Box::new(MissingFieldChecker),
                Box::new(DoiChecker),
                Box::new(IsbnChecker),
                Box::new(YearChecker),
                Box::new(MostlyAllCapsChecker),
                Box::new(HtmlTagsChecker),
                Box::new(EntrytypeChecker),
            ],
            policy,
        }
    }

    pub fn with_checker(mut self, checker: Box<dyn QualityChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn supports(&self, entrytype: &str) -> bool {
        required_fields(entrytype).is_some()
    }

    /// Aligns provenance and runs every checker.
    pub fn run(&self, record: &mut Record) {
        record.align_provenance();
        for checker in &self.checkers {
            checker.run(record, self.policy);
        }
    }

    pub fn has_fatal_defects(&self, record: &Record) -> bool {
        if !self.supports(&record.entrytype) {
            return true;
        }
        record
            .defects()
            .iter()
            .any(|(_, note)| DefectCode::from_note(note).is_some_and(|c| c.is_fatal()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_article() -> Record {
        let mut record = Record::new("Smith2020", "article");
        record.add_origin("feed-1/A2020");
        for (key, value) in [
            (fields::AUTHOR, "Smith, Jane"),
            (fields::TITLE, "A study of things"),
            (fields::JOURNAL, "MIS Quarterly"),
            (fields::YEAR, "2020"),
            (fields::VOLUME, "44"),
            (fields::NUMBER, "2"),
        ] {
            record.update_field(key, value, "feed-1/A2020");
        }
        record
    }

    #[test]
    fn complete_article_has_no_fatal_defects() {
        let qm = QualityModel::default();
        let mut record = complete_article();
        qm.run(&mut record);
        assert!(!qm.has_fatal_defects(&record), "{:?}", record.defects());
    }

    #[test]
    fn missing_fields_are_flagged_and_cleared() {
        let qm = QualityModel::default();
        let mut record = complete_article();
        record.remove_field(fields::NUMBER, false, "");
        qm.run(&mut record);
        assert!(record.has_quality_defects(fields::NUMBER));
        assert!(qm.has_fatal_defects(&record));

        record.update_field(fields::NUMBER, "2", "manual");
        qm.run(&mut record);
        assert!(!record.has_quality_defects(fields::NUMBER));
        assert!(!qm.has_fatal_defects(&record));
    }

    #[test]
    fn acknowledged_missing_field_is_not_a_defect() {
        let qm = QualityModel::default();
        let mut record = complete_article();
        record.remove_field(fields::NUMBER, true, "manual");
        qm.run(&mut record);
        assert!(!qm.has_fatal_defects(&record), "{:?}", record.defects());
    }

    #[test]
    fn doi_pattern_and_policy() {
        let mut record = complete_article();
        record.update_field(fields::DOI, "10.1000/abc-1", "feed-1/A2020");
        QualityModel::default().run(&mut record);
        assert!(!record.has_quality_defects(fields::DOI));

        record.update_field(fields::DOI, "doi 10/x", "feed-1/A2020");
        QualityModel::default().run(&mut record);
        assert!(record.has_quality_defects(fields::DOI));
        assert!(record.contains(fields::DOI));

        QualityModel::new(DefectPolicy::Remove).run(&mut record);
        assert!(!record.contains(fields::DOI));
    }

    #[test]
    fn isbn_syntax() {
        assert!(isbn_syntax_is_valid("978-0-306-40615-7"));
        assert!(isbn_syntax_is_valid("007462542X"));
        assert!(!isbn_syntax_is_valid("12345"));
    }

    #[test]
    fn all_caps_titles_are_flagged_but_not_fatal() {
        let qm = QualityModel::default();
        let mut record = complete_article();
        record.update_field(fields::TITLE, "A STUDY OF THINGS", "feed-1/A2020");
        qm.run(&mut record);
        assert!(record.has_quality_defects(fields::TITLE));
        assert!(!qm.has_fatal_defects(&record));
    }

    #[test]
    fn percent_upper() {
        assert_eq!(percent_upper_chars("ABC"), 1.0);
        assert_eq!(percent_upper_chars("abC1"), 1.0 / 3.0);
        assert_eq!(percent_upper_chars("123"), 0.0);
    }
}
