//! PDF retrieval and checks on local files.

use std::io::Read;
use std::path::{Path, PathBuf};

use litscope_core::endpoints::{PdfGetEndpoint, PdfGetManEndpoint, PdfPrepEndpoint, PdfPrepManEndpoint};
use litscope_core::models::fields;
use litscope_core::registry::bind_settings;
use litscope_core::settings::PdfPathType;
use litscope_core::{FieldEdit, Operation, ProjectRoot, Record, RecordMap, RecordState, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub const LOCAL_PDFS: &str = "colrev.local_pdfs";
pub const PDF_GET_MAN: &str = "colrev.pdf_get_man";
pub const PDF_CHECK: &str = "colrev.pdf_check";
pub const PDF_PREP_MAN: &str = "colrev.pdf_prep_man";

const NOT_A_PDF: &str = "pdf-not-readable";

/// Expected location of a record's PDF inside the project.
fn target_path(project: &ProjectRoot, id: &str) -> PathBuf {
    project.pdf_dir().join(format!("{id}.pdf"))
}

fn set_file(project: &ProjectRoot, record: &mut Record, path: &Path, source: &str) {
    let relative = project.relative(path).to_string_lossy().to_string();
    record.update_field_with(fields::FILE, relative, source, FieldEdit::replace());
}

/// Whether the file starts with the PDF magic bytes.
pub fn looks_like_pdf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .is_ok_and(|()| &magic == b"%PDF")
}

// ─── Local directory ───────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalPdfsSettings {
    /// Directory searched for `<ID>.pdf` (absolute or project-relative).
    pub dir: PathBuf,
}

impl Default for LocalPdfsSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/pdfs"),
        }
    }
}

pub struct LocalPdfs {
    dir: PathBuf,
}

pub fn local_pdfs_factory(params: &toml::Table) -> Result<Box<dyn PdfGetEndpoint>> {
    let settings: LocalPdfsSettings = bind_settings(LOCAL_PDFS, params)?;
    Ok(Box::new(LocalPdfs { dir: settings.dir }))
}

/// Finds `<id>.pdf` in `dir` or its subdirectories, ignoring case.
fn find_pdf(dir: &Path, id: &str) -> Option<PathBuf> {
    let wanted = format!("{id}.pdf").to_lowercase();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if entry.file_name().to_string_lossy().to_lowercase() == wanted {
                return Some(path);
            }
        }
    }
    None
}

fn place(source: &Path, target: &Path, path_type: PdfPathType) -> Result<()> {
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match path_type {
        #[cfg(unix)]
        PdfPathType::Symlink => std::os::unix::fs::symlink(std::fs::canonicalize(source)?, target)?,
        _ => {
            std::fs::copy(source, target)?;
        }
    }
    Ok(())
}

impl PdfGetEndpoint for LocalPdfs {
    fn get_pdf(&self, op: &Operation<'_>, record: &mut Record) -> Result<()> {
        let project = op.dataset().project();
        let dir = if self.dir.is_absolute() {
            self.dir.clone()
        } else {
            project.root().join(&self.dir)
        };
        let Some(found) = find_pdf(&dir, &record.id) else {
            debug!(record = %record.id, dir = %dir.display(), "no local PDF");
            return Ok(());
        };

        let target = target_path(project, &record.id);
        if found != target && !target.exists() {
            place(&found, &target, op.settings().pdf_get.pdf_path_type)?;
        }
        set_file(project, record, &target, LOCAL_PDFS);
        Ok(())
    }
}

// ─── Manual retrieval ──────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PdfGetManSettings {
    /// Mark PDFs that are still missing as not available.
    pub discard_missing: bool,
}

pub struct PdfGetMan {
    settings: PdfGetManSettings,
}

pub fn pdf_get_man_factory(params: &toml::Table) -> Result<Box<dyn PdfGetManEndpoint>> {
    Ok(Box::new(PdfGetMan {
        settings: bind_settings(PDF_GET_MAN, params)?,
    }))
}

impl PdfGetManEndpoint for PdfGetMan {
    /// Picks up PDFs the user placed in `data/pdfs/<ID>.pdf`.
    fn pdf_get_man(&self, op: &Operation<'_>, records: &mut RecordMap) -> Result<()> {
        let project = op.dataset().project();
        let mut missing = Vec::new();
        for record in records
            .values_mut()
            .filter(|r| r.status() == RecordState::PdfNeedsManualRetrieval)
        {
            let target = target_path(project, &record.id);
            if target.is_file() {
                set_file(project, record, &target, fields::sources::MANUAL);
                record.set_status(RecordState::PdfImported)?;
            } else if self.settings.discard_missing {
                record.set_status(RecordState::PdfNotAvailable)?;
            } else {
                missing.push(record.id.clone());
            }
        }
        if !missing.is_empty() {
            warn!(
                records = missing.len(),
                dir = %project.relative(&project.pdf_dir()).display(),
                "place the PDFs as <ID>.pdf and run pdf-get-man again: {}",
                missing.join(", ")
            );
        }
        Ok(())
    }
}

// ─── Checks ────────────────────────────────────────────────

pub struct PdfCheck;

pub fn pdf_check_factory(_params: &toml::Table) -> Result<Box<dyn PdfPrepEndpoint>> {
    Ok(Box::new(PdfCheck))
}

fn pdf_file(project: &ProjectRoot, record: &Record) -> Option<PathBuf> {
    record
        .value(fields::FILE)
        .and_then(|f| f.split(';').next())
        .map(|f| project.root().join(f.trim()))
}

impl PdfPrepEndpoint for PdfCheck {
    /// Sends files that are missing, empty or not PDFs to manual prep.
    fn prep_pdf(&self, op: &Operation<'_>, record: &mut Record, pad: usize) -> Result<()> {
        let project = op.dataset().project();
        let valid = pdf_file(project, record).is_some_and(|p| looks_like_pdf(&p));
        if valid {
            record.remove_field_provenance_note(fields::FILE, NOT_A_PDF);
            debug!("{:<pad$} PDF ok", record.id);
        } else {
            record.add_field_provenance_note(fields::FILE, NOT_A_PDF);
            record.set_status(RecordState::PdfNeedsManualPreparation)?;
            info!("{:<pad$} PDF needs manual preparation", record.id);
        }
        Ok(())
    }
}

pub struct PdfPrepMan;

pub fn pdf_prep_man_factory(_params: &toml::Table) -> Result<Box<dyn PdfPrepManEndpoint>> {
    Ok(Box::new(PdfPrepMan))
}

impl PdfPrepManEndpoint for PdfPrepMan {
    /// Accepts files the user has replaced with readable PDFs.
    fn pdf_prep_man(&self, op: &Operation<'_>, records: &mut RecordMap) -> Result<()> {
        let project = op.dataset().project();
        let mut pending = Vec::new();
        for record in records
            .values_mut()
            .filter(|r| r.status() == RecordState::PdfNeedsManualPreparation)
        {
            if pdf_file(project, record).is_some_and(|p| looks_like_pdf(&p)) {
                record.remove_field_provenance_note(fields::FILE, NOT_A_PDF);
                record.set_status(RecordState::PdfPrepared)?;
            } else {
                pending.push(record.id.clone());
            }
        }
        if !pending.is_empty() {
            warn!(records = pending.len(), "PDFs still not readable: {}", pending.join(", "));
        }
        Ok(())
    }
}
