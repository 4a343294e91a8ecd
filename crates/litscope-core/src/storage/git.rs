use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{LitscopeError, Result};

/// Author identity passed to `git commit` through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl GitIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// One line of `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Parses `git status --porcelain -z`. Renames and copies report the new
/// path; the original path that follows them is skipped.
fn parse_status(out: &str) -> Vec<StatusEntry> {
    let mut entries = Vec::new();
    let mut fields = out.split('\0');
    while let Some(entry) = fields.next() {
        let (Some(code), Some(path)) = (entry.get(..2), entry.get(3..)) else {
            continue;
        };
        if code.contains(['R', 'C']) {
            fields.next();
        }
        entries.push(StatusEntry {
            code: code.trim().to_string(),
            path: path.to_string(),
        });
    }
    entries
}

/// Thin wrapper around the `git` executable, scoped to one working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a `git` binary can be executed.
    pub fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    pub fn is_repository(root: &Path) -> bool {
        Command::new("git")
            .current_dir(root)
            .args(["rev-parse", "--is-inside-work-tree"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    pub fn init(root: &Path) -> Result<Self> {
        let repo = Self::new(root);
        repo.run(&["init", "--quiet"])?;
        Ok(repo)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    /// Runs git and returns stdout; a non-zero exit becomes [`LitscopeError::Git`].
    pub fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "git");
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| LitscopeError::Git(format!("cannot run git: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(LitscopeError::Git(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )))
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.command()
            .args(["check-ignore", "--quiet", "--"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    /// Stages `paths`. Paths excluded by `.gitignore` (such as the PDF
    /// directory) are passed over.
    pub fn add(&self, paths: &[&Path]) -> Result<()> {
        let paths: Vec<&&Path> = paths.iter().filter(|p| !self.is_ignored(p)).collect();
        if paths.is_empty() {
            return Ok(());
        }
        let mut cmd = self.command();
        cmd.args(["add", "--all", "--"]);
        for path in paths {
            cmd.arg(path);
        }
        let output = cmd.stdout(Stdio::null()).stderr(Stdio::piped()).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(LitscopeError::Git(format!(
                "git add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run(&["status", "--porcelain", "-z", "--untracked-files=all"])?;
        Ok(parse_status(&out))
    }

    /// Tracked files with uncommitted changes, excluding anything under
    /// one of the `ignored` (project-relative) paths.
    pub fn changed_files(&self, ignored: &[PathBuf]) -> Result<Vec<String>> {
        Ok(self
            .status()?
            .into_iter()
            .filter(|entry| !entry.is_untracked())
            .filter(|entry| !ignored.iter().any(|ig| Path::new(&entry.path).starts_with(ig)))
            .map(|entry| entry.path)
            .collect())
    }

    /// Whether `path` differs from HEAD, including when it is untracked.
    pub fn path_changed(&self, path: &Path) -> Result<bool> {
        let out = self.run(&["status", "--porcelain", "--", &path.to_string_lossy()])?;
        Ok(!out.trim().is_empty())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let status = self
            .command()
            .args(["diff", "--cached", "--quiet"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(!status.success())
    }

    /// Commits the index. Returns `false` when nothing was staged.
    pub fn commit(&self, message: &str, author: &GitIdentity, committer: &GitIdentity) -> Result<bool> {
        if !self.has_staged_changes()? {
            return Ok(false);
        }
        let output = self
            .command()
            .args(["-c", "commit.gpgsign=false", "commit", "--quiet", "--no-verify", "-m", message])
            .env("GIT_AUTHOR_NAME", &author.name)
            .env("GIT_AUTHOR_EMAIL", &author.email)
            .env("GIT_COMMITTER_NAME", &committer.name)
            .env("GIT_COMMITTER_EMAIL", &committer.email)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;
        if output.status.success() {
            Ok(true)
        } else {
            Err(LitscopeError::Git(format!(
                "git commit failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    pub fn head(&self) -> Option<String> {
        self.run(&["rev-parse", "HEAD"])
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Commits that touched `path`, most recent first, starting at `from`.
    pub fn commits_touching(&self, from: &str, path: &Path) -> Result<Vec<String>> {
        let out = self.run(&["rev-list", from, "--", &path.to_string_lossy()])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Contents of `path` at `commit`.
    pub fn show_file(&self, commit: &str, path: &Path) -> Result<String> {
        let spec = format!("{commit}:{}", path.to_string_lossy().replace('\\', "/"));
        self.run(&["show", &spec])
    }

    pub fn last_commit_message(&self) -> Result<String> {
        Ok(self.run(&["log", "-1", "--format=%B"])?.trim().to_string())
    }

    pub fn last_commit_author(&self) -> Result<String> {
        Ok(self.run(&["log", "-1", "--format=%an"])?.trim().to_string())
    }

    pub fn commit_count(&self) -> Result<usize> {
        match self.run(&["rev-list", "--count", "HEAD"]) {
            Ok(out) => Ok(out.trim().parse().unwrap_or(0)),
            Err(_) if self.head().is_none() => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn has_remote(&self) -> bool {
        self.run(&["remote"])
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn pull_ff_only(&self) -> Result<()> {
        self.run(&["pull", "--ff-only", "--quiet"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> GitIdentity {
        GitIdentity::new("Tester", "tester@example.com")
    }

    #[test]
    fn status_reports_the_new_path_of_renames() {
        let out = "R  data/search/new.bib\0data/search/old.bib\0 M data/records.json\0?? notes.txt\0";
        let entries = parse_status(out);
        let paths: Vec<(&str, &str)> = entries.iter().map(|e| (e.code.as_str(), e.path.as_str())).collect();
        assert_eq!(
            paths,
            vec![
                ("R", "data/search/new.bib"),
                ("M", "data/records.json"),
                ("??", "notes.txt"),
            ]
        );
        assert!(entries[2].is_untracked());
    }

    #[test]
    fn commit_and_read_back() {
        if !GitRepo::is_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let repo = GitRepo::init(tmp.path()).unwrap();
        assert!(GitRepo::is_repository(tmp.path()));

        std::fs::write(tmp.path().join("a.txt"), "one").unwrap();
        repo.add(&[Path::new("a.txt")]).unwrap();
        assert!(repo.commit("First", &identity(), &identity()).unwrap());
        assert!(!repo.commit("Nothing", &identity(), &identity()).unwrap());

        std::fs::write(tmp.path().join("a.txt"), "two").unwrap();
        repo.add(&[Path::new("a.txt")]).unwrap();
        repo.commit("Second", &identity(), &identity()).unwrap();

        let head = repo.head().unwrap();
        let commits = repo.commits_touching(&head, Path::new("a.txt")).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(repo.show_file(&commits[1], Path::new("a.txt")).unwrap(), "one");
        assert_eq!(repo.last_commit_message().unwrap(), "Second");
        assert_eq!(repo.commit_count().unwrap(), 2);
    }

    #[test]
    fn untracked_files_are_not_changes() {
        if !GitRepo::is_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let repo = GitRepo::init(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "one").unwrap();
        repo.add(&[Path::new("a.txt")]).unwrap();
        repo.commit("First", &identity(), &identity()).unwrap();

        std::fs::write(tmp.path().join("new.txt"), "x").unwrap();
        assert!(repo.changed_files(&[]).unwrap().is_empty());

        std::fs::create_dir_all(tmp.path().join("data/pdfs")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "changed").unwrap();
        assert_eq!(repo.changed_files(&[]).unwrap(), vec!["a.txt".to_string()]);
        assert!(repo
            .changed_files(&[PathBuf::from("a.txt")])
            .unwrap()
            .is_empty());
    }
}
