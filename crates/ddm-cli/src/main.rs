use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ddm_core::config;
use ddm_core::extractor::NullExtractor;
use ddm_core::logging;
use ddm_core::registry::TaskRegistry;
use ddm_core::retry::RetryPolicy;
use ddm_core::scheduler::Scheduler;

/// Command-line interface for the DDM segmented download manager.
///
/// Each invocation discovers tasks already on disk under the configured
/// download directory, applies the requested command, then lets the
/// scheduler admit whatever it can. There is no long-running daemon here
/// (the REST surface that would normally own that job is out of scope);
/// `add`/`resume`/`run` block until the tasks they admit reach a terminal
/// status.
#[derive(Parser)]
#[command(name = "ddm", about = "Segmented, resumable download manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a single-URL download and run it to completion.
    Add {
        url: String,
        #[arg(long)]
        filename: Option<String>,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        connections: Option<usize>,
        #[arg(long, default_value_t = 0)]
        speed_limit_kbps: u32,
        #[arg(long)]
        auto_extract: bool,
    },
    /// Add a recursive remote-folder download. Requires a `MetadataProvider`
    /// this CLI does not bundle (OAuth/cloud-drive integration is out of
    /// scope for the engine); always reports an error.
    AddFolder {
        folder_id: String,
        name: String,
    },
    /// Discover on-disk tasks and drive the scheduler until every task
    /// reaches a terminal status.
    Run,
    /// Print the status of one task, or every known task.
    Status { id: Option<i64> },
    Pause { id: i64 },
    Resume { id: i64 },
    #[command(name = "remove")]
    Remove {
        id: i64,
        #[arg(long)]
        keep_files: bool,
    },
    Rename { id: i64, new_name: String },
}

#[tokio::main]
async fn main() {
    logging::init_logging().expect("failed to initialize logging");

    if let Err(err) = run().await {
        eprintln!("ddm error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_or_init().context("loading configuration")?;
    let retry_policy = RetryPolicy {
        max_attempts: cfg.retry.max_attempts,
        max_delay: Duration::from_secs(cfg.retry.max_delay_secs),
    };

    let registry = Arc::new(TaskRegistry::new(retry_policy));
    let loaded = registry
        .discover(&cfg.download_dir)
        .context("discovering existing tasks")?;
    tracing::info!(loaded, "recovered tasks from disk");

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&registry),
        Arc::new(NullExtractor),
        None,
        cfg.clone(),
    ));

    match cli.command {
        Command::Add {
            url,
            filename,
            dir,
            connections,
            speed_limit_kbps,
            auto_extract,
        } => {
            let task = registry.add_file(
                url,
                filename,
                dir.unwrap_or_else(|| cfg.download_dir.clone()),
                Default::default(),
                connections.unwrap_or(cfg.max_connections_per_task),
                auto_extract,
                speed_limit_kbps,
            );
            println!("added task {} ({})", task.id.0, task.snapshot().filename);
            scheduler.process_queue();
            wait_for_terminal(&registry, task.id.0).await;
            print_status(&registry, Some(task.id.0));
        }
        Command::AddFolder { .. } => {
            anyhow::bail!(
                "add-folder requires a MetadataProvider for the target cloud drive; \
                 this CLI ships no provider (OAuth integration is out of scope). \
                 Host applications should link ddm-core directly and supply one."
            );
        }
        Command::Run => {
            scheduler.process_queue();
            wait_for_all_terminal(&registry).await;
            print_status(&registry, None);
        }
        Command::Status { id } => {
            print_status(&registry, id);
        }
        Command::Pause { id } => {
            let task = get_task(&registry, id)?;
            task.pause();
            println!("task {id} paused");
        }
        Command::Resume { id } => {
            let task = get_task(&registry, id)?;
            task.resume();
            scheduler.process_queue();
            wait_for_terminal(&registry, id).await;
            print_status(&registry, Some(id));
        }
        Command::Remove { id, keep_files } => {
            registry.delete(ddm_core::task::TaskId(id), !keep_files)?;
            println!("removed task {id}");
        }
        Command::Rename { id, new_name } => {
            registry.rename(ddm_core::task::TaskId(id), &new_name)?;
            println!("renamed task {id} to {new_name}");
        }
    }

    Ok(())
}

fn get_task(registry: &TaskRegistry, id: i64) -> Result<ddm_core::registry::Task> {
    registry
        .get(ddm_core::task::TaskId(id))
        .ok_or_else(|| anyhow::anyhow!("no such task: {id}"))
}

async fn wait_for_terminal(registry: &TaskRegistry, id: i64) {
    loop {
        match registry.get(ddm_core::task::TaskId(id)) {
            Some(task) if task.status().is_terminal() => return,
            Some(_) => tokio::time::sleep(Duration::from_millis(300)).await,
            None => return,
        }
    }
}

async fn wait_for_all_terminal(registry: &TaskRegistry) {
    loop {
        let pending = registry
            .list()
            .iter()
            .filter(|t| !t.status().is_terminal())
            .count();
        if pending == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

fn print_status(registry: &TaskRegistry, id: Option<i64>) {
    let tasks = registry.list();
    for task in tasks {
        if let Some(id) = id {
            if task.id().0 != id {
                continue;
            }
        }
        println!("{:>14}  {:?}", task.id().0, task.status());
    }
}
