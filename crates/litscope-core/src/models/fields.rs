//! Field names, field sets and reserved values shared by every stage.

pub const ID: &str = "ID";
pub const ENTRYTYPE: &str = "ENTRYTYPE";
pub const STATUS: &str = "status";
pub const ORIGIN: &str = "origin";
pub const MASTERDATA_PROVENANCE: &str = "masterdata_provenance";
pub const DATA_PROVENANCE: &str = "data_provenance";

pub const AUTHOR: &str = "author";
pub const TITLE: &str = "title";
pub const YEAR: &str = "year";
pub const JOURNAL: &str = "journal";
pub const BOOKTITLE: &str = "booktitle";
pub const VOLUME: &str = "volume";
pub const NUMBER: &str = "number";
pub const PAGES: &str = "pages";
pub const DOI: &str = "doi";
pub const ISBN: &str = "isbn";
pub const LANGUAGE: &str = "language";
pub const PUBLISHER: &str = "publisher";
pub const EDITOR: &str = "editor";

pub const URL: &str = "url";
pub const FILE: &str = "file";
pub const ABSTRACT: &str = "abstract";
pub const CITED_BY: &str = "cited_by";
pub const PRESCREEN_EXCLUSION: &str = "prescreen_exclusion";
pub const SCREENING_CRITERIA: &str = "screening_criteria";
pub const RETRACTED: &str = "retracted";

/// Keys that are structural and never carry provenance.
pub const RESERVED: [&str; 6] = [
    ID,
    ENTRYTYPE,
    STATUS,
    ORIGIN,
    MASTERDATA_PROVENANCE,
    DATA_PROVENANCE,
];

/// Canonical bibliographic fields tracked in masterdata provenance.
pub const MASTERDATA: [&str; 11] = [
    AUTHOR, TITLE, YEAR, JOURNAL, BOOKTITLE, VOLUME, NUMBER, PAGES, DOI, ISBN, LANGUAGE,
];

/// Fields used to decide whether two records describe the same work.
pub const IDENTIFYING: [&str; 8] = [
    TITLE, AUTHOR, YEAR, JOURNAL, BOOKTITLE, VOLUME, NUMBER, PAGES,
];

/// Fields whose upstream value changes over time without the work changing.
pub const TIME_VARIANT: [&str; 1] = [CITED_BY];

pub fn is_reserved(key: &str) -> bool {
    RESERVED.contains(&key)
}

pub fn is_masterdata(key: &str) -> bool {
    MASTERDATA.contains(&key)
}

pub fn is_identifying(key: &str) -> bool {
    IDENTIFYING.contains(&key)
}

pub fn is_time_variant(key: &str) -> bool {
    TIME_VARIANT.contains(&key)
}

/// Sentinel values with a meaning beyond the literal text.
pub mod values {
    pub const UNKNOWN: &str = "UNKNOWN";
    pub const FORTHCOMING: &str = "forthcoming";
    pub const CURATED: &str = "CURATED";
    pub const RETRACTED: &str = "retracted";
}

/// Sources that mark a value as entered or confirmed by hand.
pub mod sources {
    pub const ORIGINAL: &str = "ORIGINAL";
    pub const MANUAL: &str = "manual";
}
