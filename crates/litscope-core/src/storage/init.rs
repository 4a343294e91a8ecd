use std::path::Path;

use tracing::info;

use crate::config::UserConfig;
use crate::error::{LitscopeError, Result};
use crate::settings::Settings;
use crate::storage::dataset::Dataset;
use crate::storage::git::{GitIdentity, GitRepo};
use crate::storage::project_root::{ProjectRoot, SETTINGS_FILE};

/// Options for [`init_project`].
#[derive(Debug, Default)]
pub struct InitOptions {
    /// Settings to start from; defaults when `None`.
    pub settings: Option<Settings>,
    /// Create the root directory if it doesn't exist.
    pub create_dir: bool,
}

impl InitOptions {
    pub fn minimal() -> Self {
        Self::default()
    }
}

const GITIGNORE: &str = "\
data/pdfs/
data/.tei/
*.tmp
.DS_Store
";

/// Creates a new project: directory layout, `.gitignore`, settings, a git
/// repository and the initial commit.
///
/// # Errors
///
/// Fails if the directory doesn't exist (and `opts.create_dir` is false) or
/// already holds a project.
pub fn init_project(root: &Path, opts: InitOptions, user: &UserConfig) -> Result<Dataset> {
    if opts.create_dir {
        std::fs::create_dir_all(root)?;
    }
    if !root.is_dir() {
        return Err(LitscopeError::ProjectNotFound(root.display().to_string()));
    }

    let project = ProjectRoot::new(root);
    if project.settings_path().exists() {
        return Err(LitscopeError::ProjectAlreadyExists(
            root.display().to_string(),
        ));
    }

    for dir in [
        project.search_dir(),
        project.pdf_dir(),
        project.output_dir(),
    ] {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(root.join(".gitignore"), GITIGNORE)?;

    let mut settings = opts.settings.unwrap_or_default();
    if settings.project.title.is_empty() {
        settings.project.title = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("Literature review")
            .to_string();
    }
    settings.save(&project.settings_path())?;

    let git = if GitRepo::is_repository(root) {
        GitRepo::new(root)
    } else {
        GitRepo::init(root)?
    };
    let dataset = Dataset::from_parts(
        project,
        git,
        GitIdentity::new(&user.user.name, &user.user.email),
    );
    dataset.add_changes(Path::new(SETTINGS_FILE))?;
    dataset.add_changes(Path::new(".gitignore"))?;
    dataset.create_commit(
        &format!("Init: {}", settings.project.review_type),
        false,
        Some("init"),
    )?;
    info!(root = %root.display(), "initialized project");
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn user() -> UserConfig {
        let mut cfg = UserConfig::default();
        cfg.user.name = "Tester".to_string();
        cfg.user.email = "tester@example.com".to_string();
        cfg
    }

    #[test]
    fn init_creates_layout_and_commit() {
        if !GitRepo::is_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let dataset = init_project(tmp.path(), InitOptions::minimal(), &user()).unwrap();

        let project = dataset.project();
        assert!(project.search_dir().is_dir());
        assert!(project.output_dir().is_dir());
        assert!(project.settings_path().is_file());
        assert!(project.status_path().is_file());
        assert!(!project.records_path().exists());
        assert_eq!(dataset.git().commit_count().unwrap(), 1);
        assert!(dataset
            .git()
            .last_commit_message()
            .unwrap()
            .starts_with("Init: colrev.literature_review"));
        dataset.require_clean_tree(&[]).unwrap();
    }

    #[test]
    fn init_twice_fails() {
        if !GitRepo::is_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let tmp = TempDir::new().unwrap();
        init_project(tmp.path(), InitOptions::minimal(), &user()).unwrap();
        let err = init_project(tmp.path(), InitOptions::minimal(), &user()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_nonexistent_dir_without_create() {
        let err = init_project(
            Path::new("/tmp/litscope_test_nonexistent_42_1234"),
            InitOptions::minimal(),
            &user(),
        )
        .unwrap_err();
        assert!(matches!(err, LitscopeError::ProjectNotFound(_)));
    }
}
