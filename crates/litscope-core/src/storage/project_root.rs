use std::path::{Path, PathBuf};

use crate::error::{LitscopeError, Result};

/// File that marks a project root.
pub const SETTINGS_FILE: &str = "settings.toml";
/// Per-commit summary of record counts.
pub const STATUS_FILE: &str = "status.toml";

/// A project directory and the well-known paths inside it.
///
/// # Layout
/// ```text
/// review/                      ← root()
/// ├── settings.toml            ← settings_path()
/// ├── status.toml              ← status_path()
/// ├── .gitignore
/// └── data/
///     ├── records.json         ← records_path()
///     ├── search/              ← search_dir()
///     ├── pdfs/                ← pdf_dir()
///     ├── prep_man/            ← prep_man_dir()
///     ├── data/                ← output_dir()
///     └── .tei/                ← tei_dir()
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRoot {
    root: PathBuf,
}

impl ProjectRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // ─── Path accessors ─────────────────────────────────────

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir().join("records.json")
    }

    pub fn search_dir(&self) -> PathBuf {
        self.data_dir().join("search")
    }

    pub fn pdf_dir(&self) -> PathBuf {
        self.data_dir().join("pdfs")
    }

    pub fn prep_man_dir(&self) -> PathBuf {
        self.data_dir().join("prep_man")
    }

    /// Output of data endpoints (bibliographies, PRISMA tables).
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir().join("data")
    }

    pub fn tei_dir(&self) -> PathBuf {
        self.data_dir().join(".tei")
    }

    /// Project-relative form of `path`, as git reports it.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    // ─── Discovery ──────────────────────────────────────────

    /// Walks up from `start` looking for a directory with `settings.toml`.
    pub fn discover(start: &Path) -> Option<Self> {
        let mut current = if start.is_file() {
            start.parent()?.to_path_buf()
        } else {
            start.to_path_buf()
        };

        loop {
            if current.join(SETTINGS_FILE).is_file() {
                return Some(Self::new(current));
            }
            if !current.pop() {
                break;
            }
        }
        None
    }

    /// `LITSCOPE_PROJECT` first, then walking up from `start`.
    pub fn discover_with_env(start: &Path) -> Result<Self> {
        if let Ok(path) = std::env::var("LITSCOPE_PROJECT") {
            let root = PathBuf::from(&path);
            if root.join(SETTINGS_FILE).is_file() {
                return Ok(Self::new(root));
            }
            return Err(LitscopeError::ProjectNotFound(path));
        }
        Self::discover(start)
            .ok_or_else(|| LitscopeError::ProjectNotFound(start.display().to_string()))
    }
}
