use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use update_check::config::{self, UpdateCheckConfig};
use update_check::update::coordinator::CheckCoordinator;
use update_check::update::fetcher::{FakeUpdateFetcher, HttpUpdateFetcher, UpdateFetcher};
use update_check::update::status::{dismiss_warning, get_status};
use update_check::update::store::ReleaseStore;
use update_check::update::version::RuntimeVersion;
use update_check::update::warning::{WarningEngine, WarningKind};

#[derive(Parser)]
#[command(name = "update-check")]
#[command(version, about = "Background update checker for the platform runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic update-check loop (the default)
    Run,
    /// Create the database tables; run once before the first `run`
    InitDb,
    /// Print the current version status and any active warning as JSON
    Status,
    /// Dismiss the EOM or EOBS warning for the running version
    Dismiss {
        #[arg(value_parser = ["eom", "eobs"])]
        kind: String,
    },
    /// Clear the last-checked timestamp so the next cycle runs immediately
    ResetCheck,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli.command.unwrap_or(Command::Run)))
}

async fn run(command: Command) -> anyhow::Result<()> {
    let config = UpdateCheckConfig::from_env();
    let db_path = config::db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(ReleaseStore::open(&db_path)?);

    match command {
        Command::InitDb => {
            store.create_schema().await?;
            info!("created update-check tables at {}", db_path.display());
            Ok(())
        }
        Command::Run => run_loop(store, config).await,
        Command::Status => {
            ensure_tables(&store).await?;
            let engine = WarningEngine::new(store, config);
            let version = config::runtime_version();
            let status = get_status(&engine, version.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Dismiss { kind } => {
            ensure_tables(&store).await?;
            let kind = match kind.as_str() {
                "eobs" => WarningKind::Eobs,
                _ => WarningKind::Eom,
            };
            let engine = WarningEngine::new(store, config);
            let version = config::runtime_version();
            let response = dismiss_warning(&engine, kind, version.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Command::ResetCheck => {
            ensure_tables(&store).await?;
            store.reset_last_checked().await?;
            info!("cleared last_checked; the next cycle will run immediately");
            Ok(())
        }
    }
}

async fn ensure_tables(store: &ReleaseStore) -> anyhow::Result<()> {
    if !store.tables_present().await? {
        anyhow::bail!("update-check tables are missing; run `update-check init-db` first");
    }
    Ok(())
}

async fn run_loop(store: Arc<ReleaseStore>, config: UpdateCheckConfig) -> anyhow::Result<()> {
    ensure_tables(&store).await?;

    let running_raw = config::runtime_version().context("RUNTIME_VERSION is not set")?;
    let running = RuntimeVersion::parse(&running_raw)?;

    store.ensure_singleton().await?;

    let fetcher: Box<dyn UpdateFetcher> = if config.fake_check {
        Box::new(FakeUpdateFetcher::new(running.clone()))
    } else {
        Box::new(HttpUpdateFetcher::new(&config, &running))
    };

    CheckCoordinator::new(store, fetcher, config, running)
        .run()
        .await;
    Ok(())
}
