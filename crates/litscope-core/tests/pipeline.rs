//! End-to-end runs of the driver against a small in-memory endpoint package.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use litscope_core::endpoints::{DedupeEndpoint, PrepContext, PrepEndpoint, PrescreenEndpoint, SearchContext, SearchSourceEndpoint};
use litscope_core::error::PreconditionViolation;
use litscope_core::models::fields;
use litscope_core::settings::{PackageEndpoint, PrepRound};
use litscope_core::storage::project_root::ProjectRoot;
use litscope_core::{
    init_project, Capability, EndpointDescriptor, EndpointFactory, EndpointRegistry, GitRepo, InitOptions,
    LitscopeError, Operation, OperationOptions, PackageManifest, PipelineDriver, Record, RecordMap, RecordState,
    Result, SearchSourceSettings, SearchSummary, SearchType, Settings, UserConfig, ENDPOINT_GROUP,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

// ─── Test endpoints ────────────────────────────────────────

/// Reads `{ local_id: { field: value } }` JSON files.
struct JsonSource;

impl SearchSourceEndpoint for JsonSource {
    fn source_identifier(&self) -> &str {
        fields::ID
    }

    fn heuristic(&self, filename: &Path, _content: &str) -> f64 {
        if filename.extension().is_some_and(|e| e == "json") { 0.5 } else { 0.0 }
    }

    fn add_endpoint(&self, params: &toml::Table, _project: &ProjectRoot) -> Result<SearchSourceSettings> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LitscopeError::PackageParameter {
                endpoint: "test.json".into(),
                message: "name is required".into(),
            })?;
        Ok(SearchSourceSettings {
            endpoint: "test.json".into(),
            filename: PathBuf::from(format!("data/search/{name}.json")),
            search_type: SearchType::Db,
            search_parameters: toml::Table::new(),
            comment: None,
        })
    }

    fn search(&self, _ctx: &SearchContext<'_>) -> Result<SearchSummary> {
        Ok(SearchSummary::default())
    }

    fn load(&self, op: &Operation<'_>, source: &SearchSourceSettings) -> Result<RecordMap> {
        let path = op.dataset().project().root().join(&source.filename);
        let raw: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        raw.into_iter()
            .map(|(local_id, mut map)| {
                map.insert(fields::ID.into(), local_id.clone());
                map.entry(fields::ENTRYTYPE.into()).or_insert_with(|| "article".into());
                Ok((local_id, Record::from_map(map)?))
            })
            .collect()
    }

    fn prepare(&self, _record: &mut Record, _source: &SearchSourceSettings) -> Result<()> {
        Ok(())
    }
}

/// Expands the `MISQ` abbreviation.
struct Polish;

impl PrepEndpoint for Polish {
    fn prepare(&self, _ctx: &PrepContext<'_>, record: &mut Record) -> Result<()> {
        if record.get(fields::JOURNAL) == Some("MISQ") {
            record.update_field(fields::JOURNAL, "MIS Quarterly", "test.polish");
        }
        Ok(())
    }
}

/// Groups records sharing a DOI.
struct DoiDedupe;

impl DedupeEndpoint for DoiDedupe {
    fn run_dedupe(&self, _op: &Operation<'_>, records: &RecordMap) -> Result<Vec<Vec<String>>> {
        let mut by_doi: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records.values() {
            if let Some(doi) = record.value(fields::DOI) {
                by_doi.entry(doi.to_uppercase()).or_default().push(record.id.clone());
            }
        }
        Ok(by_doi.into_values().filter(|g| g.len() > 1).collect())
    }
}

/// Excludes records whose title mentions "survey".
struct ExcludeSurveys;

impl PrescreenEndpoint for ExcludeSurveys {
    fn run_prescreen(&self, _op: &Operation<'_>, records: &mut RecordMap, split: &[String]) -> Result<()> {
        for record in records.values_mut() {
            if record.status() != RecordState::MdProcessed || (!split.is_empty() && !split.contains(&record.id)) {
                continue;
            }
            if record.get(fields::TITLE).is_some_and(|t| t.contains("survey")) {
                record.prescreen_exclude("not in scope")?;
            } else {
                record.prescreen_include()?;
            }
        }
        Ok(())
    }
}

/// Pushes records straight to `rev_included`.
struct Cheater;

impl PrescreenEndpoint for Cheater {
    fn run_prescreen(&self, _op: &Operation<'_>, records: &mut RecordMap, _split: &[String]) -> Result<()> {
        for record in records.values_mut() {
            record.force_status(RecordState::RevIncluded);
        }
        Ok(())
    }
}

fn json_source(_: &toml::Table) -> Result<Arc<dyn SearchSourceEndpoint>> {
    Ok(Arc::new(JsonSource))
}

fn polish(_: &toml::Table) -> Result<Box<dyn PrepEndpoint>> {
    Ok(Box::new(Polish))
}

fn doi_dedupe(_: &toml::Table) -> Result<Box<dyn DedupeEndpoint>> {
    Ok(Box::new(DoiDedupe))
}

fn exclude_surveys(_: &toml::Table) -> Result<Box<dyn PrescreenEndpoint>> {
    Ok(Box::new(ExcludeSurveys))
}

fn cheater(_: &toml::Table) -> Result<Box<dyn PrescreenEndpoint>> {
    Ok(Box::new(Cheater))
}

fn descriptor(identifier: &'static str, capability: Capability, factory: EndpointFactory) -> EndpointDescriptor {
    EndpointDescriptor {
        identifier,
        capability,
        description: "",
        ci_supported: true,
        search_types: &[],
        requirements: Vec::new(),
        factory,
    }
}

fn registry() -> Arc<EndpointRegistry> {
    Arc::new(EndpointRegistry::discover(vec![PackageManifest {
        name: "test",
        group: ENDPOINT_GROUP,
        endpoints: vec![
            descriptor("test.json", Capability::SearchSource, EndpointFactory::SearchSource(json_source)),
            descriptor("test.polish", Capability::Prep, EndpointFactory::Prep(polish)),
            descriptor("test.doi_dedupe", Capability::Dedupe, EndpointFactory::Dedupe(doi_dedupe)),
            descriptor("test.exclude_surveys", Capability::Prescreen, EndpointFactory::Prescreen(exclude_surveys)),
            descriptor("test.cheater", Capability::Prescreen, EndpointFactory::Prescreen(cheater)),
        ],
    }]))
}

// ─── Fixtures ──────────────────────────────────────────────

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.sources.push(SearchSourceSettings {
        endpoint: "test.json".into(),
        filename: PathBuf::from("data/search/feed-1.json"),
        search_type: SearchType::Db,
        search_parameters: toml::Table::new(),
        comment: None,
    });
    settings.prep.prep_rounds.push(PrepRound {
        name: "polish".into(),
        prep_package_endpoints: vec![PackageEndpoint::new("test.polish")],
    });
    settings.dedupe.dedupe_package_endpoints.push(PackageEndpoint::new("test.doi_dedupe"));
    settings
        .prescreen
        .prescreen_package_endpoints
        .push(PackageEndpoint::new("test.exclude_surveys"));
    settings
}

fn article(author: &str, title: &str, year: &str, doi: &str) -> serde_json::Value {
    serde_json::json!({
        "author": author,
        "title": title,
        "year": year,
        "journal": "MISQ",
        "volume": "12",
        "number": "3",
        "doi": doi,
    })
}

fn write_feed(root: &Path, entries: serde_json::Value) {
    let path = root.join("data/search/feed-1.json");
    std::fs::write(path, serde_json::to_string_pretty(&entries).unwrap()).unwrap();
}

fn setup(settings: Settings) -> Option<(TempDir, PipelineDriver)> {
    if !GitRepo::is_available() {
        eprintln!("skipping: git not available");
        return None;
    }
    let tmp = TempDir::new().unwrap();
    let mut user = UserConfig::default();
    user.user.name = "Tester".into();
    let dataset = init_project(
        tmp.path(),
        InitOptions {
            settings: Some(settings),
            create_dir: false,
        },
        &user,
    )
    .unwrap();
    let options = OperationOptions {
        ci: false,
        cpus: 2,
        ..OperationOptions::default()
    };
    Some((tmp, PipelineDriver::new(dataset, registry(), options)))
}

// ─── Scenarios ─────────────────────────────────────────────

#[test]
fn load_two_records_into_empty_project() {
    let Some((tmp, driver)) = setup(settings()) else { return };
    write_feed(
        tmp.path(),
        serde_json::json!({
            "A2020": article("Smith, Ann", "Digital platforms", "2020", "10.1234/a"),
            "B2021": article("Jones, Bob", "Platform governance", "2021", "10.1234/b"),
        }),
    );

    let report = driver.load().unwrap();
    assert!(report.committed);
    assert_eq!(report.processed, 2);

    let records = driver.dataset().load_records_dict().unwrap();
    assert_eq!(records.len(), 2);
    let origins: Vec<String> = records.values().flat_map(|r| r.origins().iter().cloned()).collect();
    assert_eq!(origins.len(), 2);
    assert!(origins.contains(&"feed-1/A2020".to_string()));
    assert!(origins.contains(&"feed-1/B2021".to_string()));
    assert!(records.values().all(|r| r.status() == RecordState::MdImported));
    assert!(records.contains_key("Smith2020"));
    assert!(driver.dataset().git().last_commit_message().unwrap().starts_with("Load"));

    // Loading again adds nothing.
    let again = driver.load().unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(driver.dataset().load_records_dict().unwrap().len(), 2);
}

#[test]
fn full_metadata_pipeline_to_prescreen() {
    let Some((tmp, driver)) = setup(settings()) else { return };
    write_feed(
        tmp.path(),
        serde_json::json!({
            "A2020": article("Smith, Ann", "Digital platforms", "2020", "10.1234/X"),
            "A2020dup": article("Smith, Ann", "Digital platforms", "2020", "10.1234/x"),
            "C2019": article("Lee, Chen", "A survey of platforms", "2019", "10.1234/c"),
        }),
    );

    driver.load().unwrap();
    let prep = driver.prep().unwrap();
    assert_eq!(prep.processed, 3);
    let records = driver.dataset().load_records_dict().unwrap();
    for record in records.values() {
        assert_eq!(record.status(), RecordState::MdPrepared);
        assert_eq!(record.get(fields::JOURNAL), Some("MIS Quarterly"));
        assert!(record
            .get_field_provenance(fields::JOURNAL)
            .is_some_and(|p| p.source.contains("test.polish")));
    }

    let dedupe = driver.dedupe().unwrap();
    assert_eq!(dedupe.processed, 1);
    let records = driver.dataset().load_records_dict().unwrap();
    assert_eq!(records.len(), 2);
    let merged = records
        .values()
        .find(|r| r.origins().len() == 2)
        .expect("merged record");
    assert!(merged.origins().contains("feed-1/A2020"));
    assert!(merged.origins().contains("feed-1/A2020dup"));
    assert!(records.values().all(|r| r.status() == RecordState::MdProcessed));

    driver.prescreen(&[]).unwrap();
    let records = driver.dataset().load_records_dict().unwrap();
    let survey = records.values().find(|r| r.origins().contains("feed-1/C2019")).unwrap();
    assert_eq!(survey.status(), RecordState::RevPrescreenExcluded);
    assert_eq!(survey.get(fields::PRESCREEN_EXCLUSION), Some("not in scope"));
    assert!(survey
        .data_provenance()
        .get(fields::PRESCREEN_EXCLUSION)
        .is_some_and(|p| p.has_note("not in scope")));
    assert_eq!(merged.id, records.values().find(|r| r.origins().len() == 2).unwrap().id);

    // Every record followed a legal path through history.
    for id in records.keys() {
        let path: Vec<RecordState> = driver
            .dataset()
            .trace_record(id)
            .unwrap()
            .into_iter()
            .map(|(_, state)| state)
            .collect();
        assert!(litscope_core::state::state_path_is_valid(&path), "{id}: {path:?}");
    }
    assert!(driver.dataset().validate().unwrap().is_empty());
}

#[test]
fn prescreen_is_blocked_by_unloaded_records() {
    let Some((_tmp, driver)) = setup(settings()) else { return };
    let mut records = RecordMap::new();
    let mut record = Record::new("Smith2020", "article");
    record.add_origin("feed-1/A2020");
    record.update_field(fields::TITLE, "Digital platforms", "feed-1/A2020");
    records.insert(record.id.clone(), record);
    driver.dataset().save_records_dict(&records).unwrap();
    driver.dataset().create_commit("Seed", false, Some("test")).unwrap();
    let commits_before = driver.dataset().git().commit_count().unwrap();

    let err = driver.prescreen(&[]).unwrap_err();
    match err {
        LitscopeError::PreconditionViolation(PreconditionViolation::ProcessOrder { blocking_states, .. }) => {
            assert_eq!(blocking_states, vec![RecordState::MdRetrieved]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(driver.dataset().git().commit_count().unwrap(), commits_before);
}

#[test]
fn endpoint_skipping_stages_is_rejected_without_commit() {
    let mut settings = settings();
    settings.prescreen.prescreen_package_endpoints = vec![PackageEndpoint::new("test.cheater")];
    let Some((tmp, driver)) = setup(settings) else { return };
    write_feed(
        tmp.path(),
        serde_json::json!({ "A2020": article("Smith, Ann", "Digital platforms", "2020", "10.1234/a") }),
    );
    driver.load().unwrap();
    driver.prep().unwrap();
    driver.dedupe().unwrap();
    let commits_before = driver.dataset().git().commit_count().unwrap();

    let err = driver.prescreen(&[]).unwrap_err();
    assert!(matches!(err, LitscopeError::InvalidTransition { .. }));
    assert_eq!(driver.dataset().git().commit_count().unwrap(), commits_before);
    let records = driver.dataset().load_records_dict().unwrap();
    assert!(records.values().all(|r| r.status() == RecordState::MdProcessed));
}

#[test]
fn records_pass_pdf_stages_edge_by_edge_when_pdfs_are_optional() {
    let mut settings = settings();
    settings.pdf_get.pdf_required_for_screen_and_synthesis = false;
    let Some((tmp, driver)) = setup(settings) else { return };
    write_feed(
        tmp.path(),
        serde_json::json!({ "A2020": article("Smith, Ann", "Digital platforms", "2020", "10.1234/a") }),
    );
    driver.load().unwrap();
    driver.prep().unwrap();
    driver.dedupe().unwrap();
    driver.prescreen(&[]).unwrap();

    let report = driver.pdf_get().unwrap();
    assert_eq!(report.processed, 1);
    let records = driver.dataset().load_records_dict().unwrap();
    let record = records.values().next().unwrap();
    assert_eq!(record.status(), RecordState::PdfPrepared);
    assert!(!record.contains(fields::FILE));
    assert!(driver.dataset().validate().unwrap().is_empty());
}

#[test]
fn add_search_source_updates_settings() {
    let mut settings = settings();
    settings.sources.clear();
    let Some((_tmp, driver)) = setup(settings) else { return };

    let params = toml::Table::from_iter([("name".to_string(), toml::Value::from("feed-2"))]);
    let source = driver.add_search_source("test.json", &params).unwrap();
    assert_eq!(source.feed_name(), "feed-2");

    let stored = driver.dataset().load_settings().unwrap();
    assert_eq!(stored.sources, vec![source]);
    assert!(!driver.dataset().has_changes().unwrap());

    let err = driver.add_search_source("test.json", &params).unwrap_err();
    assert!(matches!(err, LitscopeError::PackageParameter { .. }));
    let err = driver.add_search_source("test.json", &toml::Table::new()).unwrap_err();
    assert!(matches!(err, LitscopeError::PackageParameter { .. }));
}

#[test]
fn cancelled_load_leaves_dataset_on_previous_commit() {
    let Some((tmp, driver)) = setup(settings()) else { return };
    write_feed(
        tmp.path(),
        serde_json::json!({ "A2020": article("Smith, Ann", "Digital platforms", "2020", "10.1234/a") }),
    );
    let head = driver.dataset().git().head();
    driver.options().cancel.cancel();

    let err = driver.load().unwrap_err();
    assert!(matches!(err, LitscopeError::Cancelled));
    assert_eq!(driver.dataset().git().head(), head);
    assert!(!driver.dataset().project().records_path().exists());
}
