//! `colrev.screen_table`: full-text screen through a CSV table with one
//! column per screening criterion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use litscope_core::endpoints::ScreenEndpoint;
use litscope_core::models::fields;
use litscope_core::{Operation, Record, RecordMap, RecordState, Result};
use tracing::{info, warn};

use crate::formats::table::parse_decision;

pub const SCREEN_TABLE: &str = "colrev.screen_table";

const SCREEN_FILE: &str = "screen.csv";
const INCLUSION: &str = "inclusion";
const FIXED_COLUMNS: [&str; 4] = [fields::ID, fields::TITLE, fields::AUTHOR, fields::YEAR];

pub struct ScreenTable;

pub fn factory(_params: &toml::Table) -> Result<Box<dyn ScreenEndpoint>> {
    Ok(Box::new(ScreenTable))
}

/// A decision read from one row: per-criterion values, or the plain
/// inclusion flag when the review has no criteria.
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Criteria(BTreeMap<String, bool>),
    Plain(bool),
}

impl Decision {
    fn included(&self) -> bool {
        match self {
            Self::Criteria(values) => values.values().all(|v| *v),
            Self::Plain(included) => *included,
        }
    }
}

/// The table as the user left it: header plus raw rows.
#[derive(Debug, Clone, Default, PartialEq)]
struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn new(criteria: &[String]) -> Self {
        let mut headers: Vec<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
        if criteria.is_empty() {
            headers.push(INCLUSION.to_string());
        } else {
            headers.extend(criteria.iter().cloned());
        }
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(std::io::Error::from)?;
        let headers = reader
            .headers()
            .map_err(std::io::Error::from)?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for row in reader.records() {
            let row = row.map_err(std::io::Error::from)?;
            rows.push(row.iter().map(str::to_string).collect());
        }
        Ok(Self { headers, rows })
    }

    fn write(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(&mut tmp);
            writer.write_record(&self.headers).map_err(std::io::Error::from)?;
            for row in &self.rows {
                writer.write_record(row).map_err(std::io::Error::from)?;
            }
            writer.flush()?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    fn row_id<'r>(&self, row: &'r [String]) -> Option<&'r str> {
        self.column(fields::ID)
            .and_then(|i| row.get(i))
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    fn push_record(&mut self, record: &Record) {
        let row = self
            .headers
            .iter()
            .map(|h| match h.as_str() {
                fields::ID => record.id.clone(),
                key if FIXED_COLUMNS.contains(&key) => record.value(key).unwrap_or_default().to_string(),
                _ => String::new(),
            })
            .collect();
        self.rows.push(row);
    }

    fn decisions(&self, criteria: &[String]) -> BTreeMap<String, Decision> {
        let mut decisions = BTreeMap::new();
        for row in &self.rows {
            let Some(id) = self.row_id(row) else {
                continue;
            };
            let cell = |name: &str| self.column(name).and_then(|i| row.get(i)).and_then(|c| parse_decision(c));
            let decision = if criteria.is_empty() {
                cell(INCLUSION).map(Decision::Plain)
            } else {
                criteria
                    .iter()
                    .map(|c| cell(c).map(|v| (c.clone(), v)))
                    .collect::<Option<BTreeMap<_, _>>>()
                    .map(Decision::Criteria)
            };
            if let Some(decision) = decision {
                decisions.insert(id.to_string(), decision);
            }
        }
        decisions
    }
}

fn apply(decisions: &BTreeMap<String, Decision>, records: &mut RecordMap, split: &[String]) -> Result<usize> {
    let mut decided = 0;
    for record in records
        .values_mut()
        .filter(|r| r.status() == RecordState::PdfPrepared && (split.is_empty() || split.contains(&r.id)))
    {
        let Some(decision) = decisions.get(&record.id) else {
            continue;
        };
        let values = match decision {
            Decision::Criteria(values) => values.clone(),
            Decision::Plain(_) => BTreeMap::new(),
        };
        if decision.included() {
            record.screen_include(&values)?;
        } else {
            record.screen_exclude(&values)?;
        }
        decided += 1;
    }
    Ok(decided)
}

/// One run over the table. Rows of records decided before this run are
/// dropped; applied rows stay until a later run sees their decisions
/// committed. Returns the table to write back and the undecided count.
fn update_table(mut table: Table, criteria: &[String], records: &mut RecordMap, split: &[String]) -> Result<(Table, usize)> {
    let rows = std::mem::take(&mut table.rows);
    let kept: Vec<Vec<String>> = rows
        .into_iter()
        .filter(|row| {
            table
                .row_id(row)
                .and_then(|id| records.get(id))
                .is_some_and(|r| r.status() == RecordState::PdfPrepared)
        })
        .collect();
    table.rows = kept;
    let decided = apply(&table.decisions(criteria), records, split)?;
    if decided > 0 {
        info!(decided, "applied screen table");
    }

    let mut undecided = 0;
    for record in records
        .values()
        .filter(|r| r.status() == RecordState::PdfPrepared && (split.is_empty() || split.contains(&r.id)))
    {
        undecided += 1;
        if !table.rows.iter().any(|row| table.row_id(row) == Some(record.id.as_str())) {
            table.push_record(record);
        }
    }
    Ok((table, undecided))
}

fn table_path(op: &Operation<'_>) -> PathBuf {
    op.dataset().project().data_dir().join(SCREEN_FILE)
}

impl ScreenEndpoint for ScreenTable {
    /// Applies a filled-in table, then exports the records still undecided.
    fn run_screen(&self, op: &Operation<'_>, records: &mut RecordMap, split: &[String]) -> Result<()> {
        let criteria: Vec<String> = op.settings().screen.criteria.keys().cloned().collect();
        let path = table_path(op);
        let table = if path.is_file() { Table::read(&path)? } else { Table::new(&criteria) };
        let (table, undecided) = update_table(table, &criteria, records, split)?;

        if table.rows.is_empty() {
            if path.is_file() {
                std::fs::remove_file(&path)?;
            }
            return Ok(());
        }
        table.write(&path)?;
        if undecided > 0 {
            warn!(
                records = undecided,
                file = %op.dataset().project().relative(&path).display(),
                "mark each criterion in/out (or inclusion yes/no) and run screen again"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn prepared(id: &str) -> Record {
        let mut record = Record::new(id, "article");
        record.force_status(RecordState::PdfPrepared);
        record.update_field(fields::TITLE, format!("Title {id}"), "feed/1");
        record
    }

    #[test]
    fn criteria_columns_decide_inclusion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.csv");
        let criteria = vec!["empirical".to_string(), "is_platform".to_string()];
        let mut records: RecordMap = [prepared("A"), prepared("B"), prepared("C")]
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let (table, undecided) = update_table(Table::new(&criteria), &criteria, &mut records, &[]).unwrap();
        assert_eq!(undecided, 3);
        table.write(&path).unwrap();

        let exported = std::fs::read_to_string(&path).unwrap();
        assert!(exported.starts_with("ID,title,author,year,empirical,is_platform\n"));

        std::fs::write(
            &path,
            "ID,title,author,year,empirical,is_platform\nA,,,,in,in\nB,,,,in,out\nC,,,,in,\n",
        )
        .unwrap();
        let table = Table::read(&path).unwrap();
        assert_eq!(table.decisions(&criteria).len(), 2);

        let (kept, undecided) = update_table(table, &criteria, &mut records, &[]).unwrap();
        assert_eq!(undecided, 1);
        assert_eq!(kept.rows.len(), 3);
        assert_eq!(records["A"].status(), RecordState::RevIncluded);
        assert_eq!(records["B"].status(), RecordState::RevExcluded);
        assert_eq!(records["B"].get(fields::SCREENING_CRITERIA), Some("empirical=in;is_platform=out"));
        assert_eq!(records["C"].status(), RecordState::PdfPrepared);

        // Once the decisions are committed, only the undecided row remains.
        let (next, _) = update_table(kept, &criteria, &mut records, &[]).unwrap();
        assert_eq!(next.rows.len(), 1);
        assert_eq!(next.row_id(&next.rows[0]), Some("C"));
    }

    #[test]
    fn plain_inclusion_without_criteria() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.csv");
        std::fs::write(&path, "ID,title,author,year,inclusion\nA,,,,yes\nB,,,,no\n").unwrap();
        let decisions = Table::read(&path).unwrap().decisions(&[]);

        let mut records: RecordMap = [prepared("A"), prepared("B")].into_iter().map(|r| (r.id.clone(), r)).collect();
        apply(&decisions, &mut records, &["A".to_string()]).unwrap();
        assert_eq!(records["A"].status(), RecordState::RevIncluded);
        assert_eq!(records["A"].get(fields::SCREENING_CRITERIA), None);
        assert_eq!(records["B"].status(), RecordState::PdfPrepared);
    }
}
