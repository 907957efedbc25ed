//! Command-line trigger surface for the momentum engine.
//!
//! # Responsibility
//! - Wire store, document tree, config and logging into a `SyncEngine`.
//! - Print every report as JSON on stdout; errors go to stderr.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use log::info;
use momentum_core::db;
use momentum_core::sync::scheduler::SchedulerEvent;
use momentum_core::{
    default_log_level, init_logging, open_db, EngineConfig, FsDocumentSource, SyncEngine,
    SyncScheduler, SystemClock,
};
use serde::Serialize;
use std::error::Error;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

type CliResult<T> = Result<T, Box<dyn Error>>;

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult<()> {
    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or_else(|| default_log_level());
        init_logging(level, &absolute(log_dir)?)?;
    }

    let config = EngineConfig::load_from(&cli.config)?;
    let store = db::share(open_db(&cli.db)?);
    let source = Arc::new(FsDocumentSource::new(cli.docs.clone(), &config.scan.extensions));
    let engine = SyncEngine::new(store, source, config, Arc::new(SystemClock));
    info!(
        "event=cli_start module=cli status=ok version={}",
        momentum_core::core_version()
    );

    match cli.cmd {
        Command::Scan => print_json(&engine.scan()),
        Command::Reconcile => {
            let report = engine.reconcile();
            print_json(&report)?;
            match report.aborted {
                Some(reason) => Err(format!("cycle aborted: {reason}").into()),
                None => Ok(()),
            }
        }
        Command::Momentum { project } => {
            let project = project.as_deref().map(Uuid::parse_str).transpose()?;
            print_json(&engine.recompute_momentum(project)?)
        }
        Command::Documents => print_json(&engine.list_managed_documents()?),
        Command::Export { project, path } => {
            let record = engine.export_project_document(Uuid::parse_str(&project)?, &path)?;
            print_json(&record)
        }
        Command::Watch => watch(engine),
    }
}

fn watch(engine: SyncEngine) -> CliResult<()> {
    let scheduler = SyncScheduler::start(Arc::new(engine), |event| match event {
        SchedulerEvent::Sync { report, .. } => {
            let _ = print_json(&report);
        }
        SchedulerEvent::Momentum { result, .. } => match result {
            Ok(report) => {
                let _ = print_json(&report);
            }
            Err(message) => eprintln!("momentum recompute failed: {message}"),
        },
    })?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line?.trim() {
            "sync" => scheduler.sync_now(),
            "momentum" => scheduler.recompute_now(None),
            "quit" | "exit" => break,
            "" => {}
            other => eprintln!("unknown command `{other}`; expected sync, momentum or quit"),
        }
    }
    scheduler.stop();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn absolute(path: &Path) -> CliResult<String> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(path.to_string_lossy().into_owned())
}
