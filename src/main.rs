mod cli;
mod config;
mod launcher;
mod metadata;
mod platform;
mod registry;
mod report;
mod stats;
mod terminator;

use clap::{CommandFactory, Parser};
use cli::{Cli, CommandRequest};
use config::{LightsConfig, DEFAULT_CONFIG_FILE};
use launcher::{LaunchError, LaunchRequest, Launcher};
use metadata::MetadataStore;
use platform::OsProcessControl;
use report::{GroupFilter, StatsReporter};
use std::path::PathBuf;
use std::process::ExitCode;
use terminator::{TerminatePolicy, Terminator};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let config = match LightsConfig::load(&config_path, explicit) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cpus = std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
        .unwrap_or(1);
    let request = match cli.command.resolve(&config, cpus) {
        Ok(r) => r,
        Err(e) => Cli::command()
            .error(clap::error::ErrorKind::ValueValidation, e)
            .exit(),
    };

    let store = MetadataStore::new(cli.meta.unwrap_or_else(|| config.metadata.path.clone()));
    tracing::debug!(path = %store.path().display(), "using metadata file");
    let result = match request {
        CommandRequest::Launch(req) => run_on(&store, &req),
        CommandRequest::Terminate { name, policy } => run_off(&store, &name, &policy),
        CommandRequest::List { filter, json } => run_list(&store, &config, &filter, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "lights=debug"
    } else if quiet {
        "lights=error"
    } else {
        "lights=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

type CommandResult = Result<(), Box<dyn std::error::Error>>;

fn run_on(store: &MetadataStore, request: &LaunchRequest) -> CommandResult {
    if request.binary.is_none() {
        println!("No binary provided, {} must be an executable", request.process);
    }
    let mut control = OsProcessControl;
    let outcome = match Launcher::new(store, &mut control).launch(request) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let LaunchError::Persist { name, started, .. } = &e {
                for (instance, pid) in started {
                    println!("[{instance}] {name} process started with PID {pid} (not recorded)");
                }
            }
            return Err(e.into());
        }
    };

    for (instance, pid) in &outcome.started {
        println!("[{instance}] {} process started with PID {pid}", request.name);
    }
    for instance in &outcome.failed {
        println!("[{instance}] {} process failed to start", request.name);
    }
    let started_at = chrono::DateTime::<chrono::Utc>::from_timestamp(outcome.group.start_time, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    println!(
        "{}: {} of {} instances running since {started_at}",
        outcome.group.name,
        outcome.group.pids.len(),
        request.instances
    );
    println!("[ON] Process took {} ms", outcome.elapsed.as_millis());
    Ok(())
}

fn run_off(store: &MetadataStore, name: &str, policy: &TerminatePolicy) -> CommandResult {
    let mut control = OsProcessControl;
    let outcome = Terminator::new(store, &mut control).terminate(name, policy)?;

    for pid in &outcome.signaled {
        println!("[{pid}] {name} process killed");
    }
    println!(
        "{}: signaled {} of {} processes",
        outcome.group.name,
        outcome.signaled.len(),
        outcome.group.pids.len()
    );
    for pid in &outcome.failed {
        println!("[{pid}] {name} process could not be signaled");
    }
    for pid in &outcome.survivors {
        if outcome.killed.contains(pid) {
            println!("[{pid}] {name} process killed with SIGKILL");
        } else {
            println!("[{pid}] {name} process still running after grace period");
        }
    }
    println!("[OFF] Process took {} ms", outcome.elapsed.as_millis());
    Ok(())
}

fn run_list(
    store: &MetadataStore,
    config: &LightsConfig,
    filter: &GroupFilter,
    json: bool,
) -> CommandResult {
    let mut provider = stats::select_provider(config.stats.backend);
    let now = chrono::Utc::now().timestamp();
    let rows = StatsReporter::new(provider.as_mut()).list(store, filter, now)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("No running processes");
    } else {
        println!("{}", report::render_table(&rows));
    }
    Ok(())
}
