//! Per-stage operation: precondition checks, lifecycle and record fan-out.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{LitscopeError, Result};
use crate::logging;
use crate::models::record::RecordMap;
use crate::settings::Settings;
use crate::state::{check_process_order, Stage};
use crate::storage::dataset::Dataset;
use crate::storage::project_root::{SETTINGS_FILE, STATUS_FILE};

// ─── Cancellation ──────────────────────────────────────────

/// Shared flag checked between work items.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(LitscopeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationOptions {
    /// Skip precondition checks.
    pub force: bool,
    /// Worker pool size.
    pub cpus: usize,
    /// Quiet logging inside decorated calls.
    pub ci: bool,
    pub notify_state_transition: bool,
    /// Timeout for every upstream call.
    pub timeout: Duration,
    pub cancel: CancellationFlag,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            force: false,
            cpus: 4,
            ci: logging::in_ci(),
            notify_state_transition: true,
            timeout: Duration::from_secs(30),
            cancel: CancellationFlag::new(),
        }
    }
}

// ─── Progress ──────────────────────────────────────────────

/// Progress of one operation's fan-out.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    done: AtomicUsize,
    total: AtomicUsize,
}

impl ProgressCounter {
    pub fn reset(&self, total: usize) {
        self.done.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// Marks one item done and returns the new count.
    pub fn tick(&self) -> usize {
        self.done.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

// ─── Docker ────────────────────────────────────────────────

/// Containers started by endpoints during an operation.
#[derive(Debug, Default)]
pub struct DockerTracker {
    containers: Mutex<Vec<String>>,
}

impl DockerTracker {
    pub fn register(&self, container: impl Into<String>) {
        if let Ok(mut containers) = self.containers.lock() {
            containers.push(container.into());
        }
    }

    pub fn tracked(&self) -> Vec<String> {
        self.containers
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Stops and forgets every tracked container.
    pub fn stop_all(&self) {
        let containers: Vec<String> = match self.containers.lock() {
            Ok(mut c) => c.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for container in containers {
            let stopped = Command::new("docker")
                .args(["stop", &container])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if stopped {
                debug!(container = %container, "stopped container");
            } else {
                warn!(container = %container, "could not stop container");
            }
        }
    }
}

// ─── Operation ─────────────────────────────────────────────

/// One stage run against a dataset. Short-lived: build it, run the
/// endpoints through [`Operation::decorate`], drop it.
#[derive(Debug)]
pub struct Operation<'a> {
    stage: Stage,
    dataset: &'a Dataset,
    settings: Settings,
    options: OperationOptions,
    docker: DockerTracker,
    progress: ProgressCounter,
}

impl<'a> Operation<'a> {
    /// Builds the operation and, unless `options.force` is set, checks its
    /// preconditions.
    pub fn new(stage: Stage, dataset: &'a Dataset, options: OperationOptions) -> Result<Self> {
        let settings = dataset.load_settings()?;
        let op = Self {
            stage,
            dataset,
            settings,
            options,
            docker: DockerTracker::default(),
            progress: ProgressCounter::default(),
        };
        if op.options.notify_state_transition {
            info!(stage = %stage, "starting {}", stage.title().to_lowercase());
        }
        if op.options.force {
            warn!(stage = %stage, "skipping precondition checks");
        } else {
            op.check_precondition()?;
        }
        Ok(op)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn dataset(&self) -> &'a Dataset {
        self.dataset
    }

    /// Settings as of operation start; read-only for the whole run.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn options(&self) -> &OperationOptions {
        &self.options
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }

    pub fn docker(&self) -> &DockerTracker {
        &self.docker
    }

    pub fn progress(&self) -> &ProgressCounter {
        &self.progress
    }

    pub fn cancel_flag(&self) -> &CancellationFlag {
        &self.options.cancel
    }

    /// Project-relative paths whose changes do not block the stage.
    pub fn ignored_paths(stage: Stage) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(STATUS_FILE)];
        match stage {
            Stage::Search | Stage::Load => {
                paths.push(PathBuf::from("data/search"));
                paths.push(PathBuf::from(SETTINGS_FILE));
            }
            Stage::PrepMan => {
                paths.push(PathBuf::from("data/records.json"));
                paths.push(PathBuf::from("data/prep_man"));
            }
            Stage::PdfGet | Stage::PdfGetMan => paths.push(PathBuf::from("data/pdfs")),
            _ => {}
        }
        paths
    }

    /// Clean tree (except for the stage's ignored paths), then process order.
    pub fn check_precondition(&self) -> Result<()> {
        if self.stage != Stage::Data {
            self.dataset
                .require_clean_tree(&Self::ignored_paths(self.stage))?;
        }
        if self.stage == Stage::Search {
            return Ok(());
        }
        let states = self
            .dataset
            .get_record_header_list()?
            .into_iter()
            .map(|h| h.status);
        check_process_order(
            self.stage,
            states,
            self.settings.project.allow_parallel_stages,
        )
    }

    /// Runs `f` and releases the operation's resources on every exit path,
    /// unwinding included. In CI mode logging is reduced to warnings.
    pub fn decorate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Self) -> R,
    {
        let _guard = ConcludeGuard { op: self };
        if self.options.ci {
            logging::quiet(|| f(self))
        } else {
            f(self)
        }
    }

    pub fn conclude(&self) {
        self.docker.stop_all();
    }

    /// Processes `items` on the worker pool. Results come back in input
    /// order; items not started before cancellation are dropped.
    pub fn run_parallel<T, R, F>(&self, items: Vec<T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        let total = items.len();
        self.progress.reset(total);
        if total == 0 {
            return Vec::new();
        }
        let workers = self.options.cpus.clamp(1, total);

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, T)>();
        let (out_tx, out_rx) = crossbeam_channel::unbounded::<(usize, R)>();
        for job in items.into_iter().enumerate() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let work = &work;
        let cancel = &self.options.cancel;
        let progress = &self.progress;
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                scope.spawn(move || {
                    while let Ok((idx, item)) = job_rx.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let result = work(item);
                        progress.tick();
                        let _ = out_tx.send((idx, result));
                    }
                });
            }
        });
        drop(out_tx);

        let mut results: Vec<(usize, R)> = out_rx.into_iter().collect();
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Saves the records, then commits with a `<Stage>: <detail>` message.
    /// Nothing is written once the operation was cancelled.
    pub fn save_and_commit(&self, records: &RecordMap, detail: &str) -> Result<bool> {
        self.options.cancel.check()?;
        self.dataset.save_records_dict(records)?;
        let msg = if detail.is_empty() {
            self.stage.title()
        } else {
            format!("{}: {detail}", self.stage.title())
        };
        self.dataset
            .create_commit(&msg, false, Some(self.stage.as_str()))
    }
}

struct ConcludeGuard<'o, 'a> {
    op: &'o Operation<'a>,
}

impl Drop for ConcludeGuard<'_, '_> {
    fn drop(&mut self) {
        self.op.conclude();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::error::PreconditionViolation;
    use crate::models::fields;
    use crate::models::record::Record;
    use crate::state::RecordState;
    use crate::storage::git::GitRepo;
    use crate::storage::init::{init_project, InitOptions};
    use tempfile::TempDir;

    fn setup() -> Option<(TempDir, Dataset)> {
        if !GitRepo::is_available() {
            eprintln!("skipping: git not available");
            return None;
        }
        let tmp = TempDir::new().unwrap();
        let mut user = UserConfig::default();
        user.user.name = "Tester".to_string();
        let dataset = init_project(tmp.path(), InitOptions::minimal(), &user).unwrap();
        Some((tmp, dataset))
    }

    fn options() -> OperationOptions {
        OperationOptions {
            ci: false,
            ..OperationOptions::default()
        }
    }

    fn commit_records(dataset: &Dataset, states: &[RecordState]) {
        let mut records = RecordMap::new();
        for (i, state) in states.iter().enumerate() {
            let mut r = Record::new(format!("R{i}"), "article");
            r.add_origin(format!("feed/{i}"));
            r.update_field(fields::TITLE, "t", "feed");
            r.force_status(*state);
            records.insert(r.id.clone(), r);
        }
        dataset.save_records_dict(&records).unwrap();
        dataset.create_commit("Load", false, Some("load")).unwrap();
    }

    #[test]
    fn out_of_order_stage_is_refused() {
        let Some((_tmp, dataset)) = setup() else { return };
        commit_records(&dataset, &[RecordState::MdRetrieved]);

        let err = Operation::new(Stage::Prescreen, &dataset, options()).unwrap_err();
        match err {
            LitscopeError::PreconditionViolation(PreconditionViolation::ProcessOrder {
                blocking_states,
                ..
            }) => assert_eq!(blocking_states, vec![RecordState::MdRetrieved]),
            other => panic!("unexpected error: {other}"),
        }

        let forced = OperationOptions {
            force: true,
            ..options()
        };
        assert!(Operation::new(Stage::Prescreen, &dataset, forced).is_ok());
    }

    #[test]
    fn empty_project_has_no_records() {
        let Some((_tmp, dataset)) = setup() else { return };
        let err = Operation::new(Stage::Prep, &dataset, options()).unwrap_err();
        assert!(matches!(err, LitscopeError::NoRecords));
        assert!(Operation::new(Stage::Load, &dataset, options()).is_ok());
    }

    #[test]
    fn run_parallel_keeps_input_order() {
        let Some((_tmp, dataset)) = setup() else { return };
        let op = Operation::new(Stage::Load, &dataset, options()).unwrap();
        let out = op.run_parallel((0..50).collect(), |n: u32| n * 2);
        assert_eq!(out, (0..50).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(op.progress().done(), 50);
    }

    #[test]
    fn cancelled_operation_does_not_commit() {
        let Some((_tmp, dataset)) = setup() else { return };
        let op = Operation::new(Stage::Load, &dataset, options()).unwrap();
        op.cancel_flag().cancel();
        let out = op.run_parallel(vec![1, 2, 3], |n: u32| n);
        assert!(out.is_empty());
        let err = op.save_and_commit(&RecordMap::new(), "").unwrap_err();
        assert!(matches!(err, LitscopeError::Cancelled));
    }

    #[test]
    fn decorate_concludes_on_panic() {
        let Some((_tmp, dataset)) = setup() else { return };
        let op = Operation::new(Stage::Load, &dataset, options()).unwrap();
        op.docker().register("litscope-test-nonexistent-container");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            op.decorate(|_| panic!("endpoint failed"));
        }));
        assert!(result.is_err());
        assert!(op.docker().tracked().is_empty());
    }

    #[test]
    fn ignored_paths_follow_stage() {
        assert!(Operation::ignored_paths(Stage::PdfGet).contains(&PathBuf::from("data/pdfs")));
        assert!(Operation::ignored_paths(Stage::Load).contains(&PathBuf::from(SETTINGS_FILE)));
        assert_eq!(Operation::ignored_paths(Stage::Screen), vec![PathBuf::from(STATUS_FILE)]);
    }
}
