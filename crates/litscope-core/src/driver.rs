//! Pipeline driver: resolves a stage to its enabled endpoints, runs them
//! inside an [`Operation`] and persists the result through the dataset.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::endpoints::{Advice, BoundSource, PrepContext, SearchContext, SynthesisColumn};
use crate::error::{LitscopeError, Result};
use crate::feed::SearchFeed;
use crate::models::fields;
use crate::models::ids::IdSetter;
use crate::models::merge::{preference_rank, MergeOptions};
use crate::models::record::{Record, RecordMap};
use crate::operation::{Operation, OperationOptions};
use crate::quality::QualityModel;
use crate::registry::EndpointRegistry;
use crate::settings::{PackageEndpoint, SearchSourceSettings, SearchType, Settings};
use crate::state::{RecordState, Stage, PDF_NOT_REQUIRED, TRANSITIONS};
use crate::storage::dataset::Dataset;
use crate::storage::status::StatusReport;

// ─── Reports ───────────────────────────────────────────────

/// Skipped records per error kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipSummary(BTreeMap<String, usize>);

impl SkipSummary {
    pub fn add(&mut self, kind: &str, n: usize) {
        if n > 0 {
            *self.0.entry(kind.to_string()).or_default() += n;
        }
    }

    pub fn record(&mut self, err: &LitscopeError) {
        self.add(err.kind(), 1);
    }

    pub fn count(&self, kind: &str) -> usize {
        self.0.get(kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn log(&self, stage: Stage) {
        for (kind, n) in &self.0 {
            warn!(stage = %stage, kind = %kind, count = n, "records skipped");
        }
    }
}

/// An endpoint that stopped working during a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub kind: String,
    pub message: String,
    pub hint: String,
}

impl EndpointFailure {
    fn new(endpoint: &str, err: &LitscopeError) -> Self {
        let hint = match err {
            LitscopeError::ServiceNotAvailable(_) => "check the network connection and retry later",
            LitscopeError::MaxOffset { .. } => "narrow the query of this source",
            LitscopeError::MissingDependency { .. } => "install the missing dependency",
            _ => "see the log for details",
        };
        Self {
            endpoint: endpoint.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            hint: hint.to_string(),
        }
    }
}

/// Outcome of one stage run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub committed: bool,
    /// Records (or feed entries, for search) the stage acted on.
    pub processed: usize,
    pub skipped: SkipSummary,
    pub endpoint_failures: Vec<EndpointFailure>,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            committed: false,
            processed: 0,
            skipped: SkipSummary::default(),
            endpoint_failures: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.endpoint_failures.is_empty()
    }

    fn fail(&mut self, endpoint: &str, err: &LitscopeError) {
        error!(
            stage = %self.stage,
            endpoint = %endpoint,
            "{err}"
        );
        self.endpoint_failures.push(EndpointFailure::new(endpoint, err));
    }

    /// Sorts an endpoint result into the report. Skip-level errors are
    /// counted, endpoint-fatal ones recorded; everything else propagates.
    fn absorb<T>(&mut self, endpoint: &str, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_skippable() => {
                debug!(stage = %self.stage, endpoint = %endpoint, "{e}");
                self.skipped.record(&e);
                Ok(None)
            }
            Err(e) if e.is_fatal_to_endpoint() => {
                self.fail(endpoint, &e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn finish(self) -> Self {
        self.skipped.log(self.stage);
        info!(
            stage = %self.stage,
            processed = self.processed,
            skipped = self.skipped.total(),
            committed = self.committed,
            "stage completed"
        );
        self
    }
}

/// An instantiated per-record endpoint. Disabled after its service failed.
struct Active<T: ?Sized> {
    id: String,
    endpoint: Box<T>,
    disabled: AtomicBool,
}

// ─── Driver ────────────────────────────────────────────────

/// Runs stages against one dataset. Single-threaded between stages.
pub struct PipelineDriver {
    dataset: Dataset,
    registry: Arc<EndpointRegistry>,
    options: OperationOptions,
}

impl PipelineDriver {
    pub fn new(dataset: Dataset, registry: Arc<EndpointRegistry>, options: OperationOptions) -> Self {
        Self {
            dataset,
            registry,
            options,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn options(&self) -> &OperationOptions {
        &self.options
    }

    fn operation(&self, stage: Stage) -> Result<Operation<'_>> {
        Operation::new(stage, &self.dataset, self.options.clone())
    }

    /// Instantiates the endpoints of `entries`; endpoints with unmet
    /// requirements are reported and left out.
    fn activate<T: ?Sized>(
        &self,
        report: &mut StageReport,
        entries: &[&PackageEndpoint],
        make: impl Fn(&str, &toml::Table) -> Result<Box<T>>,
    ) -> Result<Vec<Active<T>>> {
        let mut active = Vec::new();
        for entry in entries {
            match make(&entry.endpoint, &entry.params) {
                Ok(endpoint) => active.push(Active {
                    id: entry.endpoint.clone(),
                    endpoint,
                    disabled: AtomicBool::new(false),
                }),
                Err(e @ LitscopeError::MissingDependency { .. }) => report.fail(&entry.endpoint, &e),
                Err(e) => return Err(e),
            }
        }
        Ok(active)
    }

    fn bind_sources(&self, settings: &Settings) -> Result<Vec<BoundSource>> {
        settings
            .sources
            .iter()
            .map(|source| {
                Ok(BoundSource {
                    settings: source.clone(),
                    endpoint: self
                        .registry
                        .search_source(&source.endpoint, &toml::Table::new())?,
                })
            })
            .collect()
    }

    /// Runs `work` for every endpoint on each record in the stage's source
    /// states, spread over the worker pool, then `finish` once per record.
    /// A failing endpoint leaves the record as it was before the call.
    fn fan_out<T, W, F>(
        &self,
        op: &Operation<'_>,
        report: &mut StageReport,
        records: &mut RecordMap,
        endpoints: &[Active<T>],
        work: W,
        finish: F,
    ) -> Result<()>
    where
        T: ?Sized + Sync,
        W: Fn(&Active<T>, &mut Record) -> Result<()> + Sync,
        F: Fn(&mut Record) -> Result<()> + Sync,
    {
        let source_states = op.stage().source_states();
        let ids: Vec<String> = records
            .values()
            .filter(|r| source_states.contains(&r.status()))
            .map(|r| r.id.clone())
            .collect();
        let items: Vec<Record> = ids.iter().filter_map(|id| records.remove(id)).collect();

        let failures: Mutex<Vec<EndpointFailure>> = Mutex::new(Vec::new());
        let outcomes = op.run_parallel(items, |mut record| {
            let mut skipped = Vec::new();
            for active in endpoints {
                if active.disabled.load(Ordering::SeqCst) {
                    continue;
                }
                let before = record.clone();
                if let Err(e) = work(active, &mut record) {
                    record = before;
                    if e.is_skippable() {
                        debug!(record = %record.id, endpoint = %active.id, "{e}");
                        skipped.push(e.kind());
                    } else if e.is_fatal_to_endpoint() {
                        if !active.disabled.swap(true, Ordering::SeqCst) {
                            error!(endpoint = %active.id, "{e}; disabled for this run");
                            failures
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .push(EndpointFailure::new(&active.id, &e));
                        }
                    } else {
                        return Err(e);
                    }
                }
            }
            finish(&mut record)?;
            Ok((record, skipped))
        });
        op.cancel_flag().check()?;

        for outcome in outcomes {
            let (record, skipped) = outcome?;
            for kind in skipped {
                report.skipped.add(kind, 1);
            }
            report.processed += 1;
            records.insert(record.id.clone(), record);
        }
        report
            .endpoint_failures
            .extend(failures.into_inner().unwrap_or_else(|p| p.into_inner()));
        Ok(())
    }

    /// Fails when an endpoint moved a record other than along one edge the
    /// stage owns (or into a prescreen exclusion). Nothing has been written
    /// at that point.
    fn check_transitions(stage: Stage, before: &RecordMap, after: &RecordMap) -> Result<()> {
        for (id, record) in after {
            let Some(old) = before.get(id) else { continue };
            let (from, to) = (old.status(), record.status());
            if from == to {
                continue;
            }
            let owned = TRANSITIONS
                .iter()
                .any(|t| t.trigger == stage && t.source == from && t.dest == to);
            let excluded = to == RecordState::RevPrescreenExcluded && from.is_reachable(to);
            let legal = owned || excluded;
            if !legal {
                return Err(LitscopeError::InvalidTransition {
                    id: id.clone(),
                    from: old.status(),
                    to: record.status(),
                });
            }
        }
        Ok(())
    }

    // ─── Search ────────────────────────────────────────────

    /// Registers a new search source: validates the parameters with the
    /// endpoint, stores the entry in the settings and commits them.
    pub fn add_search_source(&self, endpoint: &str, params: &toml::Table) -> Result<SearchSourceSettings> {
        let _op = self.operation(Stage::Search)?;
        let source_endpoint = self.registry.search_source(endpoint, &toml::Table::new())?;
        let source = source_endpoint.add_endpoint(params, self.dataset.project())?;

        let mut settings = self.dataset.load_settings()?;
        if settings.source_by_filename(&source.filename).is_some() {
            return Err(LitscopeError::PackageParameter {
                endpoint: endpoint.to_string(),
                message: format!("a source already writes to {}", source.filename.display()),
            });
        }
        settings.sources.push(source.clone());
        self.dataset.save_settings(&settings)?;
        self.dataset.create_commit(
            &format!("Add search source {}", source.filename.display()),
            false,
            Some("search --add"),
        )?;
        info!(endpoint = %endpoint, filename = %source.filename.display(), "search source added");
        Ok(source)
    }

    /// Runs every source (or those whose feed name is in `selected`) and
    /// commits each feed file on its own.
    pub fn search(&self, rerun: bool, selected: &[String]) -> Result<StageReport> {
        let op = self.operation(Stage::Search)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::Search);
            for source in &op.settings().sources {
                if !selected.is_empty() && !selected.contains(&source.feed_name()) {
                    continue;
                }
                op.cancel_flag().check()?;
                let endpoint = self.registry.search_source(&source.endpoint, &toml::Table::new())?;
                let path = self.dataset.project().root().join(&source.filename);

                let feed = match source.search_type {
                    SearchType::Api | SearchType::Md => Some(
                        SearchFeed::open(&path, endpoint.source_identifier(), endpoint.key_case())?
                            .into_handle(),
                    ),
                    _ => None,
                };
                let ctx = SearchContext {
                    op,
                    source,
                    feed: feed.clone(),
                    rerun,
                };
                info!(source = %source.feed_name(), rerun, "searching");
                let Some(summary) = report.absorb(&source.endpoint, endpoint.search(&ctx))? else {
                    continue;
                };
                report.processed += summary.added + summary.changed;
                report.skipped.add("upstream-record", summary.skipped);

                op.cancel_flag().check()?;
                if let Some(feed) = &feed {
                    let mut guard = SearchFeed::lock(feed);
                    guard.save()?;
                    guard.print_post_run_search_infos();
                }
                if path.exists() {
                    self.dataset.add_changes(&path)?;
                }
                report.committed |= self.dataset.create_commit(
                    &format!("Search: {}", source.filename.display()),
                    false,
                    Some("search"),
                )?;
            }
            Ok(report.finish())
        })
    }

    // ─── Load ──────────────────────────────────────────────

    /// Imports new feed entries into the record set as `md_imported`.
    pub fn load(&self) -> Result<StageReport> {
        let op = self.operation(Stage::Load)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::Load);
            let mut records = self.dataset.load_records_dict()?;
            let mut known: BTreeSet<String> = records
                .values()
                .flat_map(|r| r.origins().iter().cloned())
                .collect();
            let mut loaded_files = Vec::new();

            for source in &op.settings().sources {
                let endpoint = self.registry.search_source(&source.endpoint, &toml::Table::new())?;
                let Some(entries) = report.absorb(&source.endpoint, endpoint.load(op, source))? else {
                    continue;
                };
                let feed_name = source.feed_name();
                let mut added = 0;
                for (local_id, mut record) in entries {
                    let origin = format!("{feed_name}/{local_id}");
                    if known.contains(&origin) {
                        continue;
                    }
                    record.set_origins([origin.clone()]);
                    record.force_status(RecordState::MdRetrieved);
                    record.add_provenance_all(&origin);
                    if report
                        .absorb(&source.endpoint, endpoint.prepare(&mut record, source))?
                        .is_none()
                    {
                        continue;
                    }
                    record.set_status(RecordState::MdImported)?;
                    // Temporary key until ids are assigned below.
                    record.id = origin.clone();
                    known.insert(origin.clone());
                    records.insert(origin, record);
                    added += 1;
                }
                info!(source = %feed_name, added, "loaded");
                report.processed += added;
                if added > 0 {
                    loaded_files.push(source.filename.display().to_string());
                }
            }

            IdSetter::set_ids(&mut records);
            report.committed = op.save_and_commit(&records, &loaded_files.join(", "))?;
            Ok(report.finish())
        })
    }

    // ─── Prep ──────────────────────────────────────────────

    /// Runs the prep rounds over `md_imported` records, then the quality
    /// model decides between `md_prepared` and manual preparation.
    pub fn prep(&self) -> Result<StageReport> {
        let op = self.operation(Stage::Prep)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::Prep);
            let settings = op.settings();
            let entries: Vec<&PackageEndpoint> = settings
                .prep
                .prep_rounds
                .iter()
                .flat_map(|round| round.prep_package_endpoints.iter())
                .collect();
            let endpoints = self.activate(&mut report, &entries, |id, params| self.registry.prep(id, params))?;
            let sources = self.bind_sources(settings)?;
            let ctx = PrepContext { op, sources: &sources };
            let quality = QualityModel::new(settings.prep.defect_policy);

            let mut records = self.dataset.load_records_dict()?;
            self.fan_out(
                op,
                &mut report,
                &mut records,
                &endpoints,
                |active, record| {
                    let before = record.clone();
                    active.endpoint.prepare(&ctx, record)?;
                    if !active.endpoint.always_apply_changes()
                        && introduces_fatal_defects(&quality, &before, record)
                    {
                        debug!(record = %record.id, endpoint = %active.id, "discarding changes that add fatal defects");
                        *record = before;
                    }
                    Ok(())
                },
                |record| {
                    // Excluded during prep (e.g. by language).
                    if record.status() == RecordState::RevPrescreenExcluded {
                        return Ok(());
                    }
                    quality.run(record);
                    let target = if quality.has_fatal_defects(record) {
                        RecordState::MdNeedsManualPreparation
                    } else {
                        RecordState::MdPrepared
                    };
                    record.set_status(target)
                },
            )?;

            IdSetter::set_ids(&mut records);
            // Metadata feeds written by linking endpoints.
            let search_dir = self.dataset.project().search_dir();
            if search_dir.is_dir() {
                self.dataset.add_changes(&search_dir)?;
            }
            let rounds: Vec<&str> = settings.prep.prep_rounds.iter().map(|r| r.name.as_str()).collect();
            report.committed = op.save_and_commit(&records, &rounds.join(", "))?;
            Ok(report.finish())
        })
    }

    /// Hands records in `md_needs_manual_preparation` to the manual prep
    /// endpoints, committing after each.
    pub fn prep_man(&self) -> Result<StageReport> {
        let op = self.operation(Stage::PrepMan)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::PrepMan);
            let entries: Vec<&PackageEndpoint> = op.settings().prep.prep_man_package_endpoints.iter().collect();
            let endpoints = self.activate(&mut report, &entries, |id, params| self.registry.prep_man(id, params))?;
            let mut records = self.dataset.load_records_dict()?;
            for active in &endpoints {
                let before = records.clone();
                if report
                    .absorb(&active.id, active.endpoint.prepare_manual(op, &mut records))?
                    .is_none()
                {
                    records = before;
                    continue;
                }
                Self::check_transitions(Stage::PrepMan, &before, &records)?;
                report.processed += changed_count(&before, &records);
                report.committed |= op.save_and_commit(&records, &active.id)?;
            }
            Ok(report.finish())
        })
    }

    // ─── Dedupe ────────────────────────────────────────────

    /// Merges the duplicate groups reported by the dedupe endpoints and
    /// moves the remaining `md_prepared` records to `md_processed`.
    pub fn dedupe(&self) -> Result<StageReport> {
        let op = self.operation(Stage::Dedupe)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::Dedupe);
            let settings = op.settings();
            let entries = settings.stage_endpoints(Stage::Dedupe);
            let endpoints = self.activate(&mut report, &entries, |id, params| self.registry.dedupe(id, params))?;
            let preferred = &settings.dedupe.preferred_masterdata_sources;

            let mut records = self.dataset.load_records_dict()?;
            for active in &endpoints {
                let Some(groups) = report.absorb(&active.id, active.endpoint.run_dedupe(op, &records))? else {
                    continue;
                };
                for group in groups {
                    op.cancel_flag().check()?;
                    let merged = merge_group(&mut records, &group, preferred, &mut report.skipped);
                    report.processed += merged;
                }
            }

            for record in records.values_mut() {
                if record.status() == RecordState::MdPrepared {
                    record.set_status(RecordState::MdProcessed)?;
                }
            }
            let ids: Vec<&str> = endpoints.iter().map(|a| a.id.as_str()).collect();
            report.committed = op.save_and_commit(&records, &ids.join(", "))?;
            Ok(report.finish())
        })
    }

    // ─── Prescreen / screen ────────────────────────────────

    /// Runs the prescreen endpoints on `md_processed` records (all of them,
    /// or only `split` when given), committing after each endpoint.
    pub fn prescreen(&self, split: &[String]) -> Result<StageReport> {
        self.decide(Stage::Prescreen, split)
    }

    /// Runs the screen endpoints on `pdf_prepared` records.
    pub fn screen(&self, split: &[String]) -> Result<StageReport> {
        self.decide(Stage::Screen, split)
    }

    fn decide(&self, stage: Stage, split: &[String]) -> Result<StageReport> {
        let op = self.operation(stage)?;
        op.decorate(|op| {
            let mut report = StageReport::new(stage);
            let entries = op.settings().stage_endpoints(stage);
            let mut records = self.dataset.load_records_dict()?;

            for entry in entries {
                let before = records.clone();
                let result = match stage {
                    Stage::Prescreen => self
                        .registry
                        .prescreen(&entry.endpoint, &entry.params)
                        .and_then(|ep| ep.run_prescreen(op, &mut records, split)),
                    _ => self
                        .registry
                        .screen(&entry.endpoint, &entry.params)
                        .and_then(|ep| ep.run_screen(op, &mut records, split)),
                };
                let result = match result {
                    Err(e @ LitscopeError::MissingDependency { .. }) => {
                        report.fail(&entry.endpoint, &e);
                        None
                    }
                    other => report.absorb(&entry.endpoint, other)?,
                };
                if result.is_none() {
                    records = before;
                    continue;
                }
                Self::check_transitions(stage, &before, &records)?;
                report.processed += changed_count(&before, &records);
                report.committed |= op.save_and_commit(&records, &entry.endpoint)?;
            }
            Ok(report.finish())
        })
    }

    // ─── PDFs ──────────────────────────────────────────────

    /// Retrieves PDFs for prescreen-included records. Records without a PDF
    /// go to manual retrieval, or straight to `pdf_prepared` when PDFs are
    /// not required.
    pub fn pdf_get(&self) -> Result<StageReport> {
        let op = self.operation(Stage::PdfGet)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::PdfGet);
            let entries = op.settings().stage_endpoints(Stage::PdfGet);
            let endpoints = self.activate(&mut report, &entries, |id, params| self.registry.pdf_get(id, params))?;
            let required = op.settings().pdf_get.pdf_required_for_screen_and_synthesis;
            let root = self.dataset.project().root().to_path_buf();

            let mut records = self.dataset.load_records_dict()?;
            self.fan_out(
                op,
                &mut report,
                &mut records,
                &endpoints,
                |active, record| {
                    if pdf_path(&root, record).is_some() {
                        return Ok(());
                    }
                    active.endpoint.get_pdf(op, record)
                },
                |record| {
                    if pdf_path(&root, record).is_some() {
                        record.set_status(RecordState::PdfImported)
                    } else if required {
                        record.set_status(RecordState::PdfNeedsManualRetrieval)
                    } else {
                        record.advance_through(&PDF_NOT_REQUIRED)
                    }
                },
            )?;
            self.dataset.add_changes(&self.dataset.project().pdf_dir())?;
            report.committed = op.save_and_commit(&records, &endpoint_list(&endpoints))?;
            Ok(report.finish())
        })
    }

    pub fn pdf_get_man(&self) -> Result<StageReport> {
        self.batch_stage(Stage::PdfGetMan, |registry, entry, op, records| {
            registry
                .pdf_get_man(&entry.endpoint, &entry.params)
                .and_then(|ep| ep.pdf_get_man(op, records))
        })
    }

    /// Checks imported PDFs; records the endpoints leave untouched become
    /// `pdf_prepared`.
    pub fn pdf_prep(&self) -> Result<StageReport> {
        let op = self.operation(Stage::PdfPrep)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::PdfPrep);
            let entries = op.settings().stage_endpoints(Stage::PdfPrep);
            let endpoints = self.activate(&mut report, &entries, |id, params| self.registry.pdf_prep(id, params))?;
            let mut records = self.dataset.load_records_dict()?;
            let pad = records.keys().map(String::len).max().unwrap_or(0);

            self.fan_out(
                op,
                &mut report,
                &mut records,
                &endpoints,
                |active, record| {
                    if record.status() != RecordState::PdfImported {
                        return Ok(());
                    }
                    active.endpoint.prep_pdf(op, record, pad)
                },
                |record| {
                    if record.status() == RecordState::PdfImported {
                        record.set_status(RecordState::PdfPrepared)?;
                    }
                    Ok(())
                },
            )?;
            report.committed = op.save_and_commit(&records, &endpoint_list(&endpoints))?;
            Ok(report.finish())
        })
    }

    pub fn pdf_prep_man(&self) -> Result<StageReport> {
        self.batch_stage(Stage::PdfPrepMan, |registry, entry, op, records| {
            registry
                .pdf_prep_man(&entry.endpoint, &entry.params)
                .and_then(|ep| ep.pdf_prep_man(op, records))
        })
    }

    /// Stages whose endpoints take the whole record set at once.
    fn batch_stage<F>(&self, stage: Stage, run: F) -> Result<StageReport>
    where
        F: Fn(&EndpointRegistry, &PackageEndpoint, &Operation<'_>, &mut RecordMap) -> Result<()>,
    {
        let op = self.operation(stage)?;
        op.decorate(|op| {
            let mut report = StageReport::new(stage);
            let registry: &EndpointRegistry = &self.registry;
            let mut records = self.dataset.load_records_dict()?;
            for entry in op.settings().stage_endpoints(stage) {
                let before = records.clone();
                let result = match run(registry, entry, op, &mut records) {
                    Err(e @ LitscopeError::MissingDependency { .. }) => {
                        report.fail(&entry.endpoint, &e);
                        None
                    }
                    other => report.absorb(&entry.endpoint, other)?,
                };
                if result.is_none() {
                    records = before;
                    continue;
                }
                Self::check_transitions(stage, &before, &records)?;
                report.processed += changed_count(&before, &records);
                if matches!(stage, Stage::PdfGetMan) {
                    self.dataset.add_changes(&self.dataset.project().pdf_dir())?;
                }
                report.committed |= op.save_and_commit(&records, &entry.endpoint)?;
            }
            Ok(report.finish())
        })
    }

    // ─── Data ──────────────────────────────────────────────

    /// Updates every data endpoint; an included record becomes
    /// `rev_synthesized` once all of them mark it synthesized.
    pub fn data(&self) -> Result<StageReport> {
        let op = self.operation(Stage::Data)?;
        op.decorate(|op| {
            let mut report = StageReport::new(Stage::Data);
            let entries = op.settings().stage_endpoints(Stage::Data);
            let endpoints = self.activate(&mut report, &entries, |id, params| self.registry.data(id, params))?;
            let mut records = self.dataset.load_records_dict()?;

            let eligible: Vec<String> = records
                .values()
                .filter(|r| matches!(r.status(), RecordState::RevIncluded | RecordState::RevSynthesized))
                .map(|r| r.id.clone())
                .collect();

            let mut matrix: Vec<SynthesisColumn> = Vec::new();
            for active in &endpoints {
                let mut column: SynthesisColumn = eligible.iter().map(|id| (id.clone(), false)).collect();
                active
                    .endpoint
                    .update_record_status_matrix(op, &records, &mut column);
                let silent = op.options().ci;
                if report
                    .absorb(&active.id, active.endpoint.update_data(op, &records, &column, silent))?
                    .is_some()
                {
                    matrix.push(column);
                }
            }

            if !endpoints.is_empty() && matrix.len() == endpoints.len() {
                for id in &eligible {
                    let synthesized = matrix
                        .iter()
                        .all(|column| column.get(id).copied().unwrap_or(false));
                    if let Some(record) = records.get_mut(id) {
                        if synthesized && record.status() == RecordState::RevIncluded {
                            record.set_status(RecordState::RevSynthesized)?;
                            report.processed += 1;
                        }
                    }
                }
            }
            self.dataset.add_changes(&self.dataset.project().output_dir())?;
            report.committed = op.save_and_commit(&records, &endpoint_list(&endpoints))?;
            Ok(report.finish())
        })
    }

    // ─── Status ────────────────────────────────────────────

    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport::from_records(&self.dataset.load_records_dict()?))
    }

    /// Guidance of every data endpoint.
    pub fn advice(&self) -> Result<Vec<(String, Advice)>> {
        let options = OperationOptions {
            force: true,
            notify_state_transition: false,
            ..self.options.clone()
        };
        let op = Operation::new(Stage::Data, &self.dataset, options)?;
        let mut advice = Vec::new();
        for entry in op.settings().stage_endpoints(Stage::Data) {
            match self.registry.data(&entry.endpoint, &entry.params) {
                Ok(endpoint) => advice.push((entry.endpoint.clone(), endpoint.get_advice(&op))),
                Err(e) => warn!(endpoint = %entry.endpoint, "{e}"),
            }
        }
        Ok(advice)
    }
}

// ─── Helpers ───────────────────────────────────────────────

fn introduces_fatal_defects(quality: &QualityModel, before: &Record, after: &Record) -> bool {
    let fatal = |record: &Record| {
        let mut checked = record.clone();
        quality.run(&mut checked);
        quality.has_fatal_defects(&checked)
    };
    fatal(after) && !fatal(before)
}

/// Merges one duplicate group into its anchor: the record whose origins
/// match the earliest preferred masterdata source, else the first id.
/// Returns the number of records merged away.
fn merge_group(
    records: &mut RecordMap,
    group: &[String],
    preferred: &[String],
    skipped: &mut SkipSummary,
) -> usize {
    let members: Vec<&String> = group.iter().filter(|id| records.contains_key(*id)).collect();
    if members.len() < 2 {
        return 0;
    }
    let Some(anchor_id) = members
        .iter()
        .min_by_key(|id| {
            let rank = records
                .get(id.as_str())
                .map(|r| preference_rank(r, preferred))
                .unwrap_or(usize::MAX);
            (rank, id.as_str().to_string())
        })
        .map(|id| id.to_string())
    else {
        return 0;
    };
    let Some(mut anchor) = records.remove(&anchor_id) else {
        return 0;
    };

    let opts = MergeOptions {
        default_source: "",
        preferred_sources: preferred,
    };
    let mut merged = 0;
    for id in members.into_iter().filter(|id| **id != anchor_id) {
        let Some(other) = records.get(id.as_str()) else { continue };
        let mut candidate = anchor.clone();
        match candidate.merge(other, &opts) {
            Ok(()) => {
                anchor = candidate;
                records.remove(id.as_str());
                merged += 1;
            }
            Err(e) => {
                warn!(record = %anchor_id, other = %id, "{e}");
                skipped.record(&e);
            }
        }
    }
    if merged > 0 {
        info!(record = %anchor_id, merged, "merged duplicates");
    }
    records.insert(anchor_id, anchor);
    merged
}

/// The existing PDF a record points at, if any.
fn pdf_path(root: &Path, record: &Record) -> Option<PathBuf> {
    let file = record.value(fields::FILE)?.split(';').next()?.trim();
    let path = root.join(file);
    path.is_file().then_some(path)
}

fn changed_count(before: &RecordMap, after: &RecordMap) -> usize {
    after
        .iter()
        .filter(|(id, record)| before.get(*id) != Some(*record))
        .count()
}

fn endpoint_list<T: ?Sized>(endpoints: &[Active<T>]) -> String {
    endpoints
        .iter()
        .map(|a| a.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record::FieldEdit;

    fn record(id: &str, origin: &str, status: RecordState) -> Record {
        let mut r = Record::new(id, "article");
        r.add_origin(origin);
        r.update_field_with(fields::TITLE, "A study", origin, FieldEdit::replace());
        r.update_field_with(fields::DOI, "10.1/X", origin, FieldEdit::replace());
        r.force_status(status);
        r
    }

    #[test]
    fn merge_group_prefers_listed_source_and_min_status() {
        let mut records = RecordMap::new();
        records.insert("A2020".into(), record("A2020", "feed-1/000001", RecordState::MdProcessed));
        records.insert("B2020".into(), record("B2020", "crossref/000007", RecordState::MdPrepared));
        let mut skipped = SkipSummary::default();

        let merged = merge_group(
            &mut records,
            &["A2020".into(), "B2020".into()],
            &["crossref".to_string()],
            &mut skipped,
        );
        assert_eq!(merged, 1);
        assert_eq!(records.len(), 1);
        let survivor = &records["B2020"];
        assert_eq!(survivor.origins().len(), 2);
        assert_eq!(survivor.status(), RecordState::MdPrepared);
    }

    #[test]
    fn merge_group_ignores_vanished_members() {
        let mut records = RecordMap::new();
        records.insert("A2020".into(), record("A2020", "feed-1/1", RecordState::MdPrepared));
        let mut skipped = SkipSummary::default();
        let merged = merge_group(&mut records, &["A2020".into(), "Gone".into()], &[], &mut skipped);
        assert_eq!(merged, 0);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let before: RecordMap = [("A".to_string(), record("A", "f/1", RecordState::MdProcessed))].into();
        let mut after = before.clone();
        if let Some(r) = after.get_mut("A") {
            r.force_status(RecordState::RevIncluded);
        }
        let err = PipelineDriver::check_transitions(Stage::Prescreen, &before, &after).unwrap_err();
        assert!(matches!(err, LitscopeError::InvalidTransition { .. }));

        if let Some(r) = after.get_mut("A") {
            r.force_status(RecordState::RevPrescreenIncluded);
        }
        assert!(PipelineDriver::check_transitions(Stage::Prescreen, &before, &after).is_ok());

        // Several edges in one stage are refused, even toward its targets.
        let before: RecordMap = [("A".to_string(), record("A", "f/1", RecordState::PdfNeedsManualRetrieval))].into();
        let mut after = before.clone();
        if let Some(r) = after.get_mut("A") {
            r.force_status(RecordState::PdfPrepared);
        }
        assert!(PipelineDriver::check_transitions(Stage::PdfGetMan, &before, &after).is_err());
        assert!(PipelineDriver::check_transitions(Stage::PdfPrepMan, &before, &after).is_err());
    }

    #[test]
    fn skip_summary_counts_by_kind() {
        let mut summary = SkipSummary::default();
        summary.record(&LitscopeError::RecordNotParsable("x".into()));
        summary.record(&LitscopeError::RecordNotParsable("y".into()));
        summary.add("upstream-record", 0);
        assert_eq!(summary.count("record-not-parsable"), 2);
        assert_eq!(summary.total(), 2);
        assert!(!summary.is_empty());
    }
}
