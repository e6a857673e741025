use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ida_freeze::Service;
use ida_freeze_api::{start_retry_supervisor, Actor, ApiConfig, ApiServer};
use ida_freeze_config::{ActionKind, ActionRecord, ActionStatus, AppConfig};
use ida_freeze_core::{RunOutcome, StartRequest};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ida-freeze", version, about = "Freeze, unfreeze and delete research data")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User the operation is performed as
    #[arg(long, global = true, default_value = "admin")]
    user: String,

    /// Projects the user belongs to, comma separated
    #[arg(long, global = true, value_delimiter = ',')]
    projects: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the retry supervisor
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Do not start the retry supervisor
        #[arg(long)]
        no_supervisor: bool,
    },
    /// Run one supervisor sweep and exit
    Sweep,
    /// Freeze staged files
    Freeze(ActionArgs),
    /// Move frozen files back to staging
    Unfreeze(ActionArgs),
    /// Delete frozen files
    Delete(ActionArgs),
    /// Retry a failed action
    Retry { pid: String },
    /// Clear a completed or failed action
    Clear { pid: String },
    /// Show one action, or list actions
    Status {
        pid: Option<String>,
        #[arg(long)]
        status: Option<ActionStatus>,
    },
    /// Suspend a project
    Suspend { project: String },
    /// Lift the suspension of a project
    Unsuspend { project: String },
    /// Take the service offline
    Offline,
    /// Bring the service back online
    Online,
}

#[derive(Args, Debug)]
struct ActionArgs {
    project: String,
    pathname: String,
    /// Allow more files than the per-action limit (service identity only)
    #[arg(long)]
    batch: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report(outcome: RunOutcome) -> Result<()> {
    if let Some(reason) = outcome.halt_reason() {
        tracing::warn!(pid = %outcome.action().pid, ?reason, "Action halted");
    }
    let action: ActionRecord = outcome.into_action();
    print_json(&action)?;
    if action.failed.is_some() {
        bail!(
            "Action {} failed: {}",
            action.pid,
            action.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging.level);

    let actor = Actor::new(cli.user.clone(), cli.projects.clone());
    let service = Service::open(config)?;
    let controller = &service.controller;

    let start = |kind: ActionKind, args: ActionArgs| StartRequest {
        project: args.project,
        pathname: args.pathname,
        kind,
        user: cli.user.clone(),
        batch: args.batch,
    };

    match cli.command {
        Command::Serve {
            host,
            port,
            no_supervisor,
        } => {
            let mut api = ApiConfig::from(&service.config.http);
            if let Some(host) = host {
                api = api.with_host(host);
            }
            if let Some(port) = port {
                api = api.with_port(port);
            }
            if service.config.supervisor.enabled && !no_supervisor {
                start_retry_supervisor(service.supervisor());
            }
            ApiServer::new(api, controller.clone()).run().await
        }
        Command::Sweep => print_json(&service.supervisor().run_sweep().await?),
        Command::Freeze(args) => {
            report(controller.execute(&actor, start(ActionKind::Freeze, args)).await?)
        }
        Command::Unfreeze(args) => {
            report(controller.execute(&actor, start(ActionKind::Unfreeze, args)).await?)
        }
        Command::Delete(args) => {
            report(controller.execute(&actor, start(ActionKind::Delete, args)).await?)
        }
        Command::Retry { pid } => report(controller.execute_retry(&actor, &pid).await?),
        Command::Clear { pid } => print_json(&controller.clear(&actor, &pid)?),
        Command::Status { pid: Some(pid), .. } => print_json(&controller.status(&actor, &pid)?),
        Command::Status { pid: None, status } => {
            print_json(&controller.list(&actor, status, &cli.projects)?)
        }
        Command::Suspend { project } => Ok(controller.suspend(&actor, &project)?),
        Command::Unsuspend { project } => Ok(controller.unsuspend(&actor, &project)?),
        Command::Offline => Ok(controller.set_offline(&actor, true)?),
        Command::Online => Ok(controller.set_offline(&actor, false)?),
    }
}
