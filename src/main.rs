//! Sandbox Allocator CLI
//!
//! Drives the sandbox service against a JSON state file. The state file is
//! owned by one process at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use sandbox_allocator::{
    Backends, Config, Error, MemoryStore, PoolId, RequestId, RequestStatus, Result,
    SandboxService, StackDefinition, Store, UnitId, Validate,
};

#[derive(Parser)]
#[command(name = "sandbox-allocator", version, about = "Provision and tear down pooled sandboxes")]
struct Cli {
    /// Configuration file (TOML). Defaults apply if it does not exist.
    #[arg(long, global = true, default_value = "sandbox-allocator.toml")]
    config: PathBuf,

    /// State file holding pools, units, requests and locks.
    #[arg(long, global = true, default_value = "sandbox-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct WaitArgs {
    /// Seconds to wait for the request to finish.
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Create a pool.
    CreatePool {
        #[arg(long)]
        name: String,
        #[arg(long)]
        max_size: usize,
        /// Location of the stack definition.
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "main")]
        revision: String,
        /// Extra provisioner variable, as KEY=VALUE. Repeatable.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Change the capacity of a pool.
    ResizePool { pool: PoolId, max_size: usize },
    /// Delete an empty pool.
    DeletePool { pool: PoolId },
    /// Reserve a pool so no unit in it can start a request.
    ReservePool {
        pool: PoolId,
        #[arg(long)]
        principal: String,
    },
    /// Release a pool reservation.
    ReleasePool { pool: PoolId },
    /// Add units to a pool.
    CreateUnits {
        pool: PoolId,
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Also request allocation of every new unit.
        #[arg(long)]
        allocate: bool,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Delete a unit without a sandbox.
    DeleteUnit { unit: UnitId },
    /// List pools and their units.
    List,
    /// Allocate a sandbox for a unit.
    Allocate {
        unit: UnitId,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Tear down the sandbox of a unit.
    Cleanup {
        unit: UnitId,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Show the status of a request.
    Status { request: RequestId },
    /// Cancel a request.
    Cancel { request: RequestId },
    /// List the requests of a unit.
    Requests { unit: UnitId },
    /// List the images available to stacks.
    Images {
        /// Bypass the cache and refresh it.
        #[arg(long)]
        refresh: bool,
    },
    /// Suspend, resume or reboot a node of a unit's sandbox.
    NodeAction {
        unit: UnitId,
        node: String,
        action: String,
    },
    /// Run the recovery sweep and finish interrupted requests.
    Recover {
        #[command(flatten)]
        wait: WaitArgs,
    },
}

impl Command {
    /// Commands that need stage workers running.
    fn runs_pipeline(&self) -> bool {
        matches!(
            self,
            Command::Allocate { .. }
                | Command::Cleanup { .. }
                | Command::Recover { .. }
                | Command::CreateUnits { allocate: true, .. }
        )
    }
}

fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn wait_and_report(service: &SandboxService, request: RequestId, wait: &WaitArgs) -> Result<()> {
    let report = service
        .wait_for_request(request, Duration::from_secs(wait.timeout_secs))
        .await?;
    print_json(&report)?;
    if report.status == RequestStatus::Failed {
        return Err(Error::InvalidState(format!("request {} failed", request)));
    }
    Ok(())
}

async fn execute(service: &SandboxService, store: &MemoryStore, command: Command) -> Result<()> {
    match command {
        Command::CreatePool {
            name,
            max_size,
            source,
            revision,
            vars,
        } => {
            let mut definition = StackDefinition::new(&name, source, revision);
            definition.variables.extend(vars);
            print_json(&service.create_pool(&name, max_size, definition).await?)
        }
        Command::ResizePool { pool, max_size } => print_json(&service.resize_pool(pool, max_size).await?),
        Command::DeletePool { pool } => {
            service.delete_pool(pool).await?;
            println!("Deleted pool {}", pool);
            Ok(())
        }
        Command::ReservePool { pool, principal } => print_json(&service.lock_pool(pool, &principal).await?),
        Command::ReleasePool { pool } => {
            service.unlock_pool(pool).await?;
            println!("Released pool {}", pool);
            Ok(())
        }
        Command::CreateUnits {
            pool,
            count,
            allocate,
            wait,
        } => {
            if !allocate {
                return print_json(&service.create_units(pool, count).await?);
            }
            let requests = service.create_and_allocate(pool, count).await?;
            let mut failed = 0;
            for (_, request) in requests {
                if wait_and_report(service, request, &wait).await.is_err() {
                    failed += 1;
                }
            }
            if failed > 0 {
                return Err(Error::InvalidState(format!("{} allocations failed", failed)));
            }
            Ok(())
        }
        Command::DeleteUnit { unit } => {
            service.delete_unit(unit).await?;
            println!("Deleted unit {}", unit);
            Ok(())
        }
        Command::List => {
            let mut pools = Vec::new();
            for pool in service.list_pools().await? {
                let units = service.list_units(pool.id).await?;
                pools.push(serde_json::json!({ "pool": pool, "units": units }));
            }
            print_json(&pools)
        }
        Command::Allocate { unit, wait } => {
            let request = service.request_allocation(unit).await?;
            tracing::info!(request_id = %request, "allocation requested");
            wait_and_report(service, request, &wait).await
        }
        Command::Cleanup { unit, wait } => {
            let request = service.request_cleanup(unit).await?;
            tracing::info!(request_id = %request, "cleanup requested");
            wait_and_report(service, request, &wait).await
        }
        Command::Status { request } => print_json(&service.get_request_status(request).await?),
        Command::Cancel { request } => print_json(&service.cancel_request(request).await?),
        Command::Requests { unit } => print_json(&service.list_unit_requests(unit).await?),
        Command::Images { refresh } => print_json(&service.list_images(!refresh).await?),
        Command::NodeAction { unit, node, action } => {
            service.node_action(unit, &node, &action).await?;
            println!("{} {} on unit {}", action, node, unit);
            Ok(())
        }
        Command::Recover { wait } => {
            for request in store.list_requests().await? {
                if request.finished_at.is_none() {
                    if let Err(e) = wait_and_report(service, request.id, &wait).await {
                        tracing::warn!(request_id = %request.id, error = %e, "recovered request did not finish");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "configuration warning");
    }

    let store = Arc::new(MemoryStore::open(&cli.state)?);
    let service = SandboxService::new(&config, store.clone(), Backends::from_config(&config));

    let runs_pipeline = cli.command.runs_pipeline();
    if runs_pipeline {
        let report = service.start().await?;
        tracing::info!(?report, "recovered state");
    }

    let result = execute(&service, &store, cli.command).await;

    if runs_pipeline {
        service.shutdown().await;
    }
    store.save(&cli.state).await?;
    result
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        if e.is_retryable() {
            eprintln!("Another operation holds the lock; retry once it has finished.");
        }
        std::process::exit(1);
    }
}
