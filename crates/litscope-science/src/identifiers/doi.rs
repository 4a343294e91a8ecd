use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScienceError};

static DOI_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(10\.\d{4,9}/[-._;()/:A-Z0-9]+)").expect("valid regex"));

const PREFIXES: [&str; 6] = [
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi:",
    "DOI:",
];

/// A DOI in the form records store it: uppercase, without resolver prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Doi {
    pub raw: String,
    pub normalized: String,
}

impl Doi {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let stripped = PREFIXES
            .iter()
            .find_map(|p| input.strip_prefix(p))
            .unwrap_or(input)
            .trim_start();

        if !stripped.starts_with("10.") {
            return Err(ScienceError::InvalidDoi(input.to_string()));
        }
        let (_, suffix) = stripped
            .split_once('/')
            .ok_or_else(|| ScienceError::InvalidDoi(input.to_string()))?;
        if suffix.trim().is_empty() {
            return Err(ScienceError::InvalidDoi(input.to_string()));
        }

        Ok(Self {
            raw: input.to_string(),
            normalized: stripped.trim_end_matches(['.', ',', ';']).to_uppercase(),
        })
    }

    /// First DOI mentioned in `text` (URLs, notes, reference strings).
    pub fn find_in(text: &str) -> Option<Self> {
        DOI_IN_TEXT
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| Self::parse(m.as_str()).ok())
    }

    pub fn url(&self) -> String {
        format!("https://doi.org/{}", self.normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_doi() {
        let doi = Doi::parse("10.1000/xyz123").unwrap();
        assert_eq!(doi.normalized, "10.1000/XYZ123");
        assert_eq!(doi.url(), "https://doi.org/10.1000/XYZ123");
    }

    #[test]
    fn resolver_prefixes_are_stripped() {
        for raw in [
            "https://doi.org/10.1000/xyz123",
            "http://dx.doi.org/10.1000/xyz123",
            "doi:10.1000/xyz123",
            "DOI: 10.1000/xyz123",
        ] {
            assert_eq!(Doi::parse(raw).unwrap().normalized, "10.1000/XYZ123", "{raw}");
        }
    }

    #[test]
    fn reject_malformed() {
        assert!(Doi::parse("not-a-doi").is_err());
        assert!(Doi::parse("10.1000").is_err());
        assert!(Doi::parse("10.1000/").is_err());
        assert!(Doi::parse("").is_err());
    }

    #[test]
    fn doi_found_in_url() {
        let doi = Doi::find_in("see https://www.example.org/article/10.25300/MISQ/2021/15434.").unwrap();
        assert_eq!(doi.normalized, "10.25300/MISQ/2021/15434");
        assert!(Doi::find_in("no identifier here").is_none());
    }
}
