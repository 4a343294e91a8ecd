use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::UserConfig;
use crate::error::{LitscopeError, PreconditionViolation, Result};
use crate::models::provenance::ProvenanceMap;
use crate::models::record::{Record, RecordMap};
use crate::settings::Settings;
use crate::state::{state_path_is_valid, RecordState};
use crate::storage::git::{GitIdentity, GitRepo};
use crate::storage::project_root::{ProjectRoot, SETTINGS_FILE, STATUS_FILE};
use crate::storage::status::StatusReport;

/// Id, origins, status and provenance of a record, read without keeping
/// the field values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordHeader {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "origin", default)]
    pub origins: BTreeSet<String>,
    pub status: RecordState,
    #[serde(default)]
    pub masterdata_provenance: ProvenanceMap,
}

/// The project state on disk plus its git history.
#[derive(Debug, Clone)]
pub struct Dataset {
    project: ProjectRoot,
    git: GitRepo,
    user: GitIdentity,
}

impl Dataset {
    /// Opens an initialized project.
    pub fn open(project: ProjectRoot, user: &UserConfig) -> Result<Self> {
        if !project.settings_path().is_file() {
            return Err(LitscopeError::ProjectNotFound(
                project.root().display().to_string(),
            ));
        }
        if !GitRepo::is_repository(project.root()) {
            return Err(LitscopeError::Git(format!(
                "{} is not a git repository",
                project.root().display()
            )));
        }
        let git = GitRepo::new(project.root());
        Ok(Self {
            project,
            git,
            user: GitIdentity::new(&user.user.name, &user.user.email),
        })
    }

    pub(crate) fn from_parts(project: ProjectRoot, git: GitRepo, user: GitIdentity) -> Self {
        Self { project, git, user }
    }

    pub fn project(&self) -> &ProjectRoot {
        &self.project
    }

    pub fn git(&self) -> &GitRepo {
        &self.git
    }

    pub fn user(&self) -> &GitIdentity {
        &self.user
    }

    // ─── Settings ───────────────────────────────────────────

    pub fn load_settings(&self) -> Result<Settings> {
        Settings::load(&self.project.settings_path())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        settings.save(&self.project.settings_path())?;
        self.add_changes(Path::new(SETTINGS_FILE))
    }

    // ─── Records ────────────────────────────────────────────

    /// Current working state. A project without a records file is empty.
    pub fn load_records_dict(&self) -> Result<RecordMap> {
        let path = self.project.records_path();
        if !path.exists() {
            return Ok(RecordMap::new());
        }
        parse_records(&std::fs::read_to_string(path)?)
    }

    /// Writes the record set and stages it. An unchanged set leaves the file
    /// untouched so that no commit results.
    pub fn save_records_dict(&self, records: &RecordMap) -> Result<()> {
        check_records(records)?;
        let path = self.project.records_path();
        let serialized = serialize_records(records)?;
        let unchanged = path.exists() && std::fs::read_to_string(&path)? == serialized;
        if !unchanged {
            write_replacing(&path, &serialized)?;
        }
        self.add_changes(&path)
    }

    /// Fast scan of record headers.
    pub fn get_record_header_list(&self) -> Result<Vec<RecordHeader>> {
        let path = self.project.records_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let headers: BTreeMap<String, RecordHeader> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(headers.into_values().collect())
    }

    /// Record sets of past commits, most recent first, read lazily.
    pub fn load_records_from_history(&self, commit: Option<&str>) -> Result<RecordHistory<'_>> {
        let commits = match commit.map(str::to_string).or_else(|| self.git.head()) {
            Some(from) => self.git.commits_touching(&from, &self.records_rel())?,
            None => Vec::new(),
        };
        Ok(RecordHistory {
            git: &self.git,
            path: self.records_rel(),
            commits: commits.into_iter(),
        })
    }

    /// Status of one record at every commit that touched the records file,
    /// oldest first. Records are followed through id changes by origin.
    pub fn trace_record(&self, id: &str) -> Result<Vec<(String, RecordState)>> {
        let current = self.load_records_dict()?;
        let origins = current
            .get(id)
            .map(|r| r.origins().clone())
            .unwrap_or_default();

        let mut trace = Vec::new();
        for entry in self.load_records_from_history(None)? {
            let (commit, records) = entry?;
            let found = records.get(id).or_else(|| {
                records
                    .values()
                    .find(|r| r.origins().iter().any(|o| origins.contains(o)))
            });
            if let Some(record) = found {
                trace.push((commit, record.status()));
            }
        }
        trace.reverse();
        if trace.is_empty() && !current.contains_key(id) {
            return Err(LitscopeError::RecordNotFound(id.to_string()));
        }
        Ok(trace)
    }

    // ─── Git ────────────────────────────────────────────────

    pub fn add_changes(&self, path: &Path) -> Result<()> {
        let rel = self.project.relative(path);
        self.git.add(&[rel.as_path()])
    }

    pub fn has_record_changes(&self) -> Result<bool> {
        self.git.path_changed(&self.records_rel())
    }

    pub fn has_changes(&self) -> Result<bool> {
        self.git.has_staged_changes()
    }

    /// Fails with [`PreconditionViolation::DirtyTree`] when tracked files
    /// outside `ignored` have uncommitted changes.
    pub fn require_clean_tree(&self, ignored: &[PathBuf]) -> Result<()> {
        let files = self.git.changed_files(ignored)?;
        if files.is_empty() {
            Ok(())
        } else {
            Err(PreconditionViolation::DirtyTree { files }.into())
        }
    }

    /// Updates the status file and commits everything staged. Returns
    /// `false` when there was nothing to commit.
    ///
    /// Script commits are authored as `script:<call>`; manual commits use
    /// the configured user.
    pub fn create_commit(&self, msg: &str, manual_author: bool, script_call: Option<&str>) -> Result<bool> {
        let report = StatusReport::from_records(&self.load_records_dict()?);
        report.save(&self.project.status_path())?;
        self.add_changes(Path::new(STATUS_FILE))?;

        if !self.has_changes()? {
            info!("nothing to commit");
            return Ok(false);
        }

        let author = if manual_author {
            self.user.clone()
        } else {
            GitIdentity::new(
                format!("script:{}", script_call.unwrap_or("litscope")),
                &self.user.email,
            )
        };
        let message = format!(
            "{msg}\n\nReport\n\n  actor: {}\n  command: litscope {}\n\nStatus ({} records)\n\n{}",
            if manual_author { self.user.name.as_str() } else { "litscope" },
            script_call.unwrap_or("-"),
            report.total,
            report.summary_lines()
        );
        let committed = self.git.commit(message.trim_end(), &author, &self.user)?;
        if committed {
            info!(message = msg, "created commit");
        }

        let leftover = self.git.changed_files(&[])?;
        if !leftover.is_empty() {
            warn!(files = ?leftover, "working tree not clean after commit");
        }
        Ok(committed)
    }

    /// Pulls from the tracking remote when one is configured.
    pub fn pull(&self) -> Result<bool> {
        if !self.git.has_remote() {
            info!("no remote configured, nothing to pull");
            return Ok(false);
        }
        self.git.pull_ff_only()?;
        Ok(true)
    }

    // ─── Validation ─────────────────────────────────────────

    /// Checks the records file and its history. Returns one line per issue.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        let records = match self.load_records_dict() {
            Ok(records) => records,
            Err(e) => return Ok(vec![format!("records file not parsable: {e}")]),
        };
        if let Err(e) = check_records(&records) {
            issues.push(e.to_string());
        }
        for record in records.values() {
            for field in record.unprovenanced_fields() {
                issues.push(format!("{}: field '{field}' lacks provenance", record.id));
            }
        }

        let mut paths: BTreeMap<String, Vec<RecordState>> = BTreeMap::new();
        for entry in self.load_records_from_history(None)? {
            let (_, past) = entry?;
            for record in past.values() {
                for origin in record.origins() {
                    paths.entry(origin.clone()).or_default().push(record.status());
                }
            }
        }
        for (origin, mut path) in paths {
            path.reverse();
            if !state_path_is_valid(&path) {
                let states: Vec<&str> = path.iter().map(|s| s.as_str()).collect();
                issues.push(format!("{origin}: invalid status path {}", states.join(" -> ")));
            }
        }
        Ok(issues)
    }

    fn records_rel(&self) -> PathBuf {
        self.project.relative(&self.project.records_path())
    }
}

/// Lazy iterator over `(commit, records)` pairs.
pub struct RecordHistory<'a> {
    git: &'a GitRepo,
    path: PathBuf,
    commits: std::vec::IntoIter<String>,
}

impl Iterator for RecordHistory<'_> {
    type Item = Result<(String, RecordMap)>;

    fn next(&mut self) -> Option<Self::Item> {
        let commit = self.commits.next()?;
        Some(
            self.git
                .show_file(&commit, &self.path)
                .and_then(|content| parse_records(&content))
                .map(|records| (commit, records)),
        )
    }
}

pub(crate) fn parse_records(content: &str) -> Result<RecordMap> {
    if content.trim().is_empty() {
        return Ok(RecordMap::new());
    }
    Ok(serde_json::from_str(content)?)
}

pub(crate) fn serialize_records(records: &RecordMap) -> Result<String> {
    let mut out = serde_json::to_string_pretty(records)?;
    out.push('\n');
    Ok(out)
}

/// Writes `contents` next to `path` and renames it into place, so readers
/// never see a partly written records file.
fn write_replacing(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| LitscopeError::Io(e.error))?;
    Ok(())
}

/// Keys match ids, every record has an origin and no origin is shared.
fn check_records(records: &RecordMap) -> Result<()> {
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for (key, record) in records {
        if key != &record.id {
            return Err(LitscopeError::RecordNotParsable(format!(
                "record stored under '{key}' has id '{}'",
                record.id
            )));
        }
        if record.origins().is_empty() {
            return Err(LitscopeError::RecordNotParsable(format!(
                "{} has no origin",
                record.id
            )));
        }
        // Metadata links (`md_*` feeds) may be shared until dedupe merges.
        for origin in record.origins().iter().filter(|o| !o.starts_with("md_")) {
            if let Some(first) = seen.insert(origin, &record.id) {
                return Err(LitscopeError::DuplicateOrigin {
                    origin: origin.clone(),
                    first: first.to_string(),
                    second: record.id.clone(),
                });
            }
        }
    }
    Ok(())
}
