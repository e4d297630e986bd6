use std::sync::Arc;

use anyhow::{Context, Result};
use banksync_storage::PgStore;
use banksync_sync::{build_engine, maybe_build_scheduler, run_due_syncs, SyncConfig, SyncOptions};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "banksync-cli")]
#[command(about = "Banking sync orchestration engine")]
struct Cli {
    /// Emit logs as JSON lines (also enabled by BANKSYNC_LOG_FORMAT=json).
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync job for a connection and print its result.
    Sync {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        connection: Uuid,
        /// Fetch transactions even if the account synced within the last hour.
        #[arg(long)]
        force: bool,
        /// Skip the account listing and sync transactions for stored accounts only.
        #[arg(long, conflicts_with = "accounts_only")]
        transactions_only: bool,
        #[arg(long)]
        accounts_only: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API (and the scheduler when enabled).
    Serve,
    Health {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        connection: Uuid,
    },
    Jobs {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        connection: Uuid,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Sync due connections, once or on the configured cron until interrupted.
    Schedule {
        #[arg(long)]
        once: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_json = cli.log_json
        || std::env::var("BANKSYNC_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
    init_tracing(log_json);

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, 2).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Sync {
            tenant,
            connection,
            force,
            transactions_only,
            accounts_only,
        } => {
            let engine = build_engine(&config).await?;
            let options = SyncOptions {
                sync_accounts: !transactions_only,
                sync_transactions: !accounts_only,
                force,
                ..SyncOptions::default()
            };
            let result = engine.trigger_sync(tenant, connection, options).await?;
            print_json(&result)?;
        }
        Commands::Health { tenant, connection } => {
            let engine = build_engine(&config).await?;
            print_json(&engine.get_connection_health(tenant, connection).await?)?;
        }
        Commands::Jobs {
            tenant,
            connection,
            limit,
        } => {
            let engine = build_engine(&config).await?;
            print_json(&engine.list_jobs(tenant, connection, limit).await?)?;
        }
        Commands::Schedule { once } => {
            let engine = Arc::new(build_engine(&config).await?);
            if once {
                let summary = run_due_syncs(
                    &engine,
                    chrono::Utc::now(),
                    config.scheduler_batch,
                    config.connection_concurrency,
                )
                .await?;
                print_json(&summary)?;
            } else {
                let scheduling = SyncConfig {
                    scheduler_enabled: true,
                    ..config.clone()
                };
                let Some(mut sched) = maybe_build_scheduler(engine, &scheduling).await? else {
                    return Ok(());
                };
                sched.start().await.context("starting scheduler")?;
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                info!("shutting down scheduler");
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Serve => {
            let engine = Arc::new(build_engine(&config).await?);
            let scheduler = maybe_build_scheduler(engine.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            banksync_web::serve(engine, &config.bind).await?;
        }
    }

    Ok(())
}
