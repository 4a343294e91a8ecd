//! CSV decision tables the user edits between runs.

use std::path::Path;

use litscope_core::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(std::io::Error::from)?;
    let rows = reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, csv::Error>>()
        .map_err(std::io::Error::from)?;
    Ok(rows)
}

/// Replaces the table through a temporary file, so a hand-edited table is
/// never left half written.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = csv::Writer::from_writer(&mut tmp);
        for row in rows {
            writer.serialize(row).map_err(std::io::Error::from)?;
        }
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// `yes`/`no` style cells; empty means undecided.
pub fn parse_decision(cell: &str) -> Option<bool> {
    match cell.trim().to_lowercase().as_str() {
        "yes" | "y" | "1" | "true" | "in" | "include" => Some(true),
        "no" | "n" | "0" | "false" | "out" | "exclude" => Some(false),
        _ => None,
    }
}
