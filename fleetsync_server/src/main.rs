use clap::Parser;
use fleetsync_core::config::SyncConfig;
use fleetsync_core::environment::{EnvironmentIdentity, validate_machine_name, validate_version};
use fleetsync_core::store::SqliteSyncStore;
use fleetsync_core::traits::{LivenessProbe, ServiceTracker};
use fleetsync_server::cli::{Cli, Commands};
use fleetsync_server::dev_backends::SimulatedFleet;
use fleetsync_server::runner;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    fleetsync_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Run {
        database_url: None,
        simulate: false,
        fleet_size: 5,
        tick_seconds: 2,
    });

    match cmd {
        Commands::Run {
            database_url,
            simulate,
            fleet_size,
            tick_seconds,
        } => {
            let config = load_config(database_url)?;
            if !simulate {
                anyhow::bail!(
                    "no upstream connector is configured in this build; pass --simulate to sync from the built-in fleet simulator"
                );
            }
            let identity = EnvironmentIdentity::detect()?;
            let store = Arc::new(SqliteSyncStore::new(&config.database_url).await?);

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("interrupt received; shutting down");
                    }
                    cancel.cancel();
                });
            }

            let fleet = Arc::new(SimulatedFleet::new(fleet_size, chrono::Utc::now()));
            let generator = {
                let fleet = fleet.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    fleet
                        .run_generator(Duration::from_secs(tick_seconds.max(1)), cancel)
                        .await
                })
            };

            let result =
                runner::run(config, store, fleet.upstream(), identity, cancel.clone()).await;
            cancel.cancel();
            generator.await?;
            result?;
        }
        Commands::Validate { database_url } => {
            let config = load_config(database_url)?;
            let identity = EnvironmentIdentity::detect()?;
            let store = SqliteSyncStore::new(&config.database_url).await?;
            store.probe().await?;
            println!("database: ok");

            let records = store.tracking_records().await?;
            let mut failed = false;
            for record in &records {
                let outcome = validate_version(&identity, &records, record.service).and_then(|_| {
                    validate_machine_name(
                        &identity,
                        &records,
                        record.service,
                        config.disable_machine_name_validation,
                    )
                });
                match outcome {
                    Ok(()) => println!("{}: ok", record.service),
                    Err(e) => {
                        failed = true;
                        println!("{}: {e}", record.service);
                    }
                }
            }
            if records.is_empty() {
                println!("no services tracked yet");
            }
            if failed {
                anyhow::bail!("environment validation failed");
            }
        }
        Commands::Config => {
            fn redact(s: &str) -> String {
                match s.split_once("://") {
                    Some((scheme, _)) => format!("{scheme}://***"),
                    None => "***".to_string(),
                }
            }

            let mut config = load_config(None)?;
            config.database_url = redact(&config.database_url);
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(database_url: Option<String>) -> anyhow::Result<SyncConfig> {
    let mut config = SyncConfig::from_env()?;
    if let Some(url) = database_url {
        config.database_url = url;
    }
    config.validate()?;
    Ok(config)
}
