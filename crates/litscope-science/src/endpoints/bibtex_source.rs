//! `colrev.bibtex`: a BibTeX export from a database, placed in `data/search`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use litscope_core::endpoints::{SearchContext, SearchSourceEndpoint};
use litscope_core::models::fields::{self, sources};
use litscope_core::registry::bind_settings;
use litscope_core::{
    FieldEdit, LitscopeError, Operation, ProjectRoot, Record, RecordMap, Result, SearchSourceSettings,
    SearchSummary, SearchType,
};
use serde::Deserialize;
use tracing::warn;

use crate::formats::bibtex;
use crate::identifiers::Doi;

pub const BIBTEX: &str = "colrev.bibtex";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AddParams {
    filename: String,
    comment: Option<String>,
}

pub struct BibtexSource;

pub fn factory(_params: &toml::Table) -> Result<Arc<dyn SearchSourceEndpoint>> {
    Ok(Arc::new(BibtexSource))
}

fn read_entries(path: &Path) -> Result<bibtex::BibFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(bibtex::parse(&content))
}

impl SearchSourceEndpoint for BibtexSource {
    fn source_identifier(&self) -> &str {
        fields::ID
    }

    fn heuristic(&self, filename: &Path, content: &str) -> f64 {
        let mut confidence = 0.0;
        if filename.extension().is_some_and(|e| e.eq_ignore_ascii_case("bib")) {
            confidence += 0.7;
        }
        let lowered = content.to_lowercase();
        if ["@article{", "@inproceedings{", "@book{", "@misc{"].iter().any(|p| lowered.contains(p)) {
            confidence += 0.3;
        }
        f64::min(confidence, 1.0)
    }

    /// Copies the file into `data/search` unless it already lives there.
    fn add_endpoint(&self, params: &toml::Table, project: &ProjectRoot) -> Result<SearchSourceSettings> {
        let params: AddParams = bind_settings(BIBTEX, params)?;
        if params.filename.trim().is_empty() {
            return Err(LitscopeError::PackageParameter {
                endpoint: BIBTEX.to_string(),
                message: "filename is required".to_string(),
            });
        }
        let given = PathBuf::from(params.filename.trim());
        let candidates = [
            given.clone(),
            project.root().join(&given),
            project.search_dir().join(&given),
        ];
        let Some(existing) = candidates.into_iter().find(|p| p.is_file()) else {
            return Err(LitscopeError::InvalidQuery(format!("{} does not exist", given.display())));
        };
        let Some(name) = existing.file_name().map(PathBuf::from) else {
            return Err(LitscopeError::InvalidQuery(format!("{} is not a file", given.display())));
        };

        std::fs::create_dir_all(project.search_dir())?;
        let target = project.search_dir().join(&name);
        if std::fs::canonicalize(&existing)? != std::fs::canonicalize(project.search_dir())?.join(&name) {
            std::fs::copy(&existing, &target)?;
        }
        let file = read_entries(&target)?;
        if file.entries.is_empty() {
            return Err(LitscopeError::InvalidQuery(format!("{} holds no BibTeX entries", name.display())));
        }

        Ok(SearchSourceSettings {
            endpoint: BIBTEX.to_string(),
            filename: project.relative(&target),
            search_type: SearchType::Db,
            search_parameters: toml::Table::new(),
            comment: params.comment,
        })
    }

    /// Database exports are added by hand; searching only checks the file.
    fn search(&self, ctx: &SearchContext<'_>) -> Result<SearchSummary> {
        let path = ctx.op.dataset().project().root().join(&ctx.source.filename);
        if !path.is_file() {
            return Err(LitscopeError::InvalidQuery(format!(
                "{} is missing; export it from the database again",
                ctx.source.filename.display()
            )));
        }
        let file = read_entries(&path)?;
        for err in &file.errors {
            warn!(source = %ctx.source.feed_name(), "{err}");
        }
        Ok(SearchSummary {
            added: file.entries.len(),
            changed: 0,
            skipped: file.errors.len(),
        })
    }

    fn load(&self, op: &Operation<'_>, source: &SearchSourceSettings) -> Result<RecordMap> {
        let path = op.dataset().project().root().join(&source.filename);
        let file = read_entries(&path)?;
        for err in &file.errors {
            warn!(source = %source.feed_name(), "{err}");
        }

        let mut records = RecordMap::new();
        for entry in file.entries {
            let key = entry.key.clone();
            if records.contains_key(&key) {
                warn!(source = %source.feed_name(), key = %key, "duplicate BibTeX key, keeping the first entry");
                continue;
            }
            match Record::from_map(entry.into_map()) {
                Ok(record) => {
                    records.insert(key, record);
                }
                Err(e) => warn!(source = %source.feed_name(), key = %key, "{e}"),
            }
        }
        Ok(records)
    }

    /// Undoes LaTeX escaping and maps biblatex field names.
    fn prepare(&self, record: &mut Record, _source: &SearchSourceSettings) -> Result<()> {
        for (from, to) in [("journaltitle", fields::JOURNAL), ("issue", fields::NUMBER), ("location", "address")] {
            if record.contains(from) && !record.contains(to) {
                record.rename_field(from, to);
            }
        }
        if !record.contains(fields::YEAR) {
            if let Some(year) = record.get("date").and_then(|d| d.get(..4)).filter(|y| y.chars().all(|c| c.is_ascii_digit())) {
                let year = year.to_string();
                let source = record.field_source("date", sources::ORIGINAL);
                record.update_field_with(fields::YEAR, year, &source, FieldEdit::replace());
            }
        }

        let keys: Vec<String> = record.fields().keys().cloned().collect();
        for key in keys {
            let Some(value) = record.get(&key) else { continue };
            let cleaned = unescape_latex(value);
            let cleaned = match key.as_str() {
                fields::PAGES => normalize_pages(&cleaned),
                fields::DOI => Doi::parse(&cleaned).map(|d| d.normalized).unwrap_or(cleaned),
                _ => cleaned,
            };
            if cleaned.is_empty() {
                record.remove_field(&key, false, "");
            } else if cleaned != value {
                let source = record.field_source(&key, sources::ORIGINAL);
                record.update_field_with(&key, cleaned, &source, FieldEdit::replace());
            }
        }
        Ok(())
    }
}

fn unescape_latex(value: &str) -> String {
    let mut out = value.to_string();
    for (escaped, plain) in [("\\&", "&"), ("\\%", "%"), ("\\_", "_"), ("\\$", "$"), ("\\#", "#")] {
        out = out.replace(escaped, plain);
    }
    out.trim().to_string()
}

/// `12-34` and `12 – 34` become `12--34`.
fn normalize_pages(pages: &str) -> String {
    let parts: Vec<&str> = pages
        .split(['-', '–', '—'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [start, end] => format!("{start}--{end}"),
        _ => pages.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn heuristic_prefers_bib_files() {
        let source = BibtexSource;
        assert_eq!(source.heuristic(Path::new("wos.bib"), "@article{A, title={T}}"), 1.0);
        assert!(source.heuristic(Path::new("wos.txt"), "@ARTICLE{A, title={T}}") > 0.0);
        assert_eq!(source.heuristic(Path::new("scopus.csv"), "Title,Authors"), 0.0);
    }

    #[test]
    fn prepare_removes_wire_artifacts_and_is_idempotent() {
        let mut record = Record::new("A2020", "article");
        record.update_field("journaltitle", "Management Information Systems Quarterly", "feed-1/A2020");
        record.update_field(fields::TITLE, "Platforms \\& ecosystems", "feed-1/A2020");
        record.update_field(fields::PAGES, "12 - 34", "feed-1/A2020");
        record.update_field("date", "2020-05-01", "feed-1/A2020");
        record.update_field(fields::DOI, "https://doi.org/10.1234/misq.2020.1", "feed-1/A2020");

        let source = SearchSourceSettings {
            endpoint: BIBTEX.to_string(),
            filename: PathBuf::from("data/search/feed-1.bib"),
            search_type: SearchType::Db,
            search_parameters: toml::Table::new(),
            comment: None,
        };
        BibtexSource.prepare(&mut record, &source).unwrap();
        let once = record.clone();
        BibtexSource.prepare(&mut record, &source).unwrap();
        assert_eq!(record, once);

        assert_eq!(record.get(fields::JOURNAL), Some("Management Information Systems Quarterly"));
        assert_eq!(record.get(fields::TITLE), Some("Platforms & ecosystems"));
        assert_eq!(record.get(fields::PAGES), Some("12--34"));
        assert_eq!(record.get(fields::YEAR), Some("2020"));
        assert_eq!(record.get(fields::DOI), Some("10.1234/MISQ.2020.1"));
        assert_eq!(record.get_field_provenance(fields::TITLE).unwrap().source, "feed-1/A2020");
    }
}
