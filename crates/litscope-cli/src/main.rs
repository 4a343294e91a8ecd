use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use litscope_core::{
    init_project, logging, CancellationFlag, Dataset, ExitCode, InitOptions, LitscopeError,
    OperationOptions, PipelineDriver, ProjectRoot, Settings, StageReport, UserConfig,
};

// ─── CLI Definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "litscope",
    about = "Git-backed literature reviews, one stage at a time",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format (for scripts).
    /// Also enabled by setting LITSCOPE_JSON=1.
    #[arg(long, global = true)]
    json: bool,

    /// Skip precondition checks (clean tree, process order).
    #[arg(long, global = true)]
    force: bool,

    /// Worker pool size (overrides config and LITSCOPE_CPUS).
    #[arg(long, global = true)]
    cpus: Option<usize>,

    /// Quiet endpoint logging, as on a CI runner.
    #[arg(long, global = true)]
    ci: bool,

    /// Log filter when RUST_LOG is unset (e.g. `debug`, `litscope_core=trace`).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project in a directory.
    Init {
        #[arg(default_value = ".")]
        path: PathBuf,
        #[arg(long, default_value = "colrev.literature_review")]
        review_type: String,
        /// Review type parameter as key=value.
        #[arg(long = "param", action = clap::ArgAction::Append)]
        params: Vec<String>,
    },

    /// Retrieve records from the search sources, or register a new source.
    Search {
        /// Endpoint of a source to add (e.g. colrev.crossref).
        #[arg(long)]
        add: Option<String>,
        /// Source parameter as key=value (with --add).
        #[arg(long = "param", action = clap::ArgAction::Append)]
        params: Vec<String>,
        /// Fetch everything again instead of only new records.
        #[arg(long)]
        rerun: bool,
        /// Restrict the run to these feed files.
        #[arg(long, action = clap::ArgAction::Append)]
        selected: Vec<String>,
    },

    /// Import feed records into the records file.
    Load,
    /// Clean and complete metadata.
    Prep,
    /// Export and re-import records that need manual preparation.
    PrepMan,
    /// Merge duplicate records.
    Dedupe,
    /// Decide on titles and abstracts.
    Prescreen {
        /// Record ids to decide on (all pending when empty).
        split: Vec<String>,
    },
    /// Retrieve full texts.
    PdfGet,
    /// Pick up full texts placed by hand.
    PdfGetMan,
    /// Check full texts.
    PdfPrep,
    /// Accept repaired full texts.
    PdfPrepMan,
    /// Decide on full texts.
    Screen {
        split: Vec<String>,
    },
    /// Synthesize the included records.
    Data,

    /// Show record counts per state.
    Status,
    /// Check the records file and its history.
    Validate,
    /// Show the states a record went through.
    Trace { id: String },
    /// Pull from the remote (fast-forward only).
    Pull,
}

// ─── Main ────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let start = Instant::now();
    let cli = Cli::parse();
    let json_output = cli.json || std::env::var("LITSCOPE_JSON").as_deref() == Ok("1");

    let config = UserConfig::load()?;
    let log_level = cli.log_level.clone().unwrap_or_else(|| config.runtime.log_level.clone());
    logging::init(&log_level);

    match run(cli, &config, json_output, start) {
        Ok(ExitCode::Success) => Ok(()),
        Ok(code) => std::process::exit(code as i32),
        Err(err) => {
            let code = err
                .downcast_ref::<LitscopeError>()
                .map(ExitCode::from)
                .unwrap_or(ExitCode::GeneralError);
            let kind = err.downcast_ref::<LitscopeError>().map(|e| e.kind()).unwrap_or("error");
            if json_output {
                print_json(&serde_json::json!({
                    "status": "error",
                    "error": kind,
                    "message": format!("{err:#}"),
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                eprintln!("Error: {err:#}");
            }
            std::process::exit(code as i32);
        }
    }
}

fn run(cli: Cli, config: &UserConfig, json_output: bool, start: Instant) -> Result<ExitCode> {
    let registry = litscope_science::builtin_registry();
    for err in registry.discovery_errors() {
        warn!("endpoint not registered: {err}");
    }

    if let Commands::Init { path, review_type, params } = &cli.command {
        let params = parse_params(params)?;
        let mut settings = Settings::default();
        registry.review_type(review_type, &params)?.initialize(&mut settings)?;
        let dataset = init_project(
            path,
            InitOptions {
                settings: Some(settings),
                create_dir: true,
            },
            config,
        )?;
        let root = dataset.project().root().display().to_string();
        if json_output {
            print_json(&serde_json::json!({
                "status": "ok",
                "data": { "root": root, "review_type": review_type },
                "meta": { "duration_ms": start.elapsed().as_millis() }
            }))?;
        } else {
            println!("Initialized {review_type} in {root}");
        }
        return Ok(ExitCode::Success);
    }

    let cwd = std::env::current_dir().context("current directory")?;
    let project = ProjectRoot::discover_with_env(&cwd)?;
    debug!(root = %project.root().display(), "project found");
    let dataset = Dataset::open(project, config)?;

    let cancel = CancellationFlag::new();
    watch_ctrl_c(cancel.clone());
    let options = OperationOptions {
        force: cli.force,
        cpus: cli.cpus.unwrap_or_else(|| config.cpus()).max(1),
        ci: cli.ci || logging::in_ci(),
        timeout: config.timeout(),
        cancel,
        ..OperationOptions::default()
    };
    let driver = PipelineDriver::new(dataset, registry, options);

    let report = match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::Search { add: Some(endpoint), params, .. } => {
            let params = parse_params(&params)?;
            let source = driver.add_search_source(&endpoint, &params)?;
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": source,
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!("Added {} as {}", endpoint, source.filename.display());
            }
            return Ok(ExitCode::Success);
        }
        Commands::Search { add: None, rerun, selected, .. } => driver.search(rerun, &selected)?,
        Commands::Load => driver.load()?,
        Commands::Prep => driver.prep()?,
        Commands::PrepMan => driver.prep_man()?,
        Commands::Dedupe => driver.dedupe()?,
        Commands::Prescreen { split } => driver.prescreen(&split)?,
        Commands::PdfGet => driver.pdf_get()?,
        Commands::PdfGetMan => driver.pdf_get_man()?,
        Commands::PdfPrep => driver.pdf_prep()?,
        Commands::PdfPrepMan => driver.pdf_prep_man()?,
        Commands::Screen { split } => driver.screen(&split)?,
        Commands::Data => driver.data()?,

        Commands::Status => {
            let status = driver.status()?;
            let advice = driver.advice()?;
            if json_output {
                let advice: Vec<serde_json::Value> = advice
                    .iter()
                    .map(|(endpoint, a)| serde_json::json!({"endpoint": endpoint, "msg": a.msg}))
                    .collect();
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "records": status, "advice": advice },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else if status.total == 0 {
                println!("No records yet. Add a source with `litscope search --add <endpoint>`.");
            } else {
                println!("{} records", status.total);
                print!("{}", status.summary_lines());
                for (endpoint, a) in &advice {
                    println!("  {endpoint}: {}", a.msg);
                }
            }
            return Ok(ExitCode::Success);
        }

        Commands::Validate => {
            let issues = driver.dataset().validate()?;
            if json_output {
                print_json(&serde_json::json!({
                    "status": if issues.is_empty() { "ok" } else { "error" },
                    "data": { "issues": issues },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else if issues.is_empty() {
                println!("No issues found");
            } else {
                for issue in &issues {
                    println!("  {issue}");
                }
                println!("\n{} issues found", issues.len());
            }
            return Ok(if issues.is_empty() { ExitCode::Success } else { ExitCode::GeneralError });
        }

        Commands::Trace { id } => {
            let trace = driver.dataset().trace_record(&id)?;
            if json_output {
                let items: Vec<serde_json::Value> = trace
                    .iter()
                    .map(|(commit, state)| serde_json::json!({"commit": commit, "status": state}))
                    .collect();
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "id": id, "trace": items },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                for (commit, state) in &trace {
                    println!("{}  {state}", short_hash(commit));
                }
            }
            return Ok(ExitCode::Success);
        }

        Commands::Pull => {
            let pulled = driver.dataset().pull()?;
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "pulled": pulled },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else if pulled {
                println!("Pulled");
            } else {
                println!("No remote configured");
            }
            return Ok(ExitCode::Success);
        }
    };

    print_report(&report, json_output, start)?;
    Ok(if report.has_failures() {
        ExitCode::ServiceUnavailable
    } else {
        ExitCode::Success
    })
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn print_json(val: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(val)?);
    Ok(())
}

fn print_report(report: &StageReport, json_output: bool, start: Instant) -> Result<()> {
    if json_output {
        return print_json(&serde_json::json!({
            "status": if report.has_failures() { "partial" } else { "ok" },
            "data": report,
            "meta": { "duration_ms": start.elapsed().as_millis() }
        }));
    }

    let committed = if report.committed { "committed" } else { "nothing to commit" };
    println!("{}: {} processed, {committed}", report.stage, report.processed);
    if !report.skipped.is_empty() {
        println!("  {} skipped", report.skipped.total());
    }
    for failure in &report.endpoint_failures {
        println!("  {} failed ({}): {}", failure.endpoint, failure.kind, failure.message);
        println!("    hint: {}", failure.hint);
    }
    Ok(())
}

/// `key=value` pairs as a TOML table. Values that parse as TOML scalars
/// (numbers, booleans) keep their type; the rest are strings.
fn parse_params(pairs: &[String]) -> Result<toml::Table> {
    let mut table = toml::Table::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| LitscopeError::InvalidQuery(format!("expected key=value, got '{pair}'")))?;
        let value = value.trim();
        let parsed = format!("v = {value}")
            .parse::<toml::Table>()
            .ok()
            .and_then(|mut t| t.remove("v"))
            .filter(|v| !v.is_table())
            .unwrap_or_else(|| toml::Value::String(value.to_string()));
        table.insert(key.trim().to_string(), parsed);
    }
    Ok(table)
}

fn short_hash(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}

/// Cancels the running stage on ctrl-c. The stage stops between records
/// and reverts its uncommitted changes.
fn watch_ctrl_c(cancel: CancellationFlag) {
    std::thread::spawn(move || {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
            return;
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping after the current record");
                cancel.cancel();
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    });
}
