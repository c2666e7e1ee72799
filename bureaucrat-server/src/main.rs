use anyhow::{Context as _, Result};
use bureaucrat_core::bus_memory::MemoryBus;
use bureaucrat_core::config::Config;
use bureaucrat_core::engine::Engine;
use bureaucrat_core::storage::Storage;
use bureaucrat_core::storage_fs::FsStorage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = parse_args();
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    let config = Arc::new(config);

    let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(
        &config.bureaucrat.storage_dir,
        &config.bureaucrat.lock_file,
    )?);
    tracing::info!(
        storage_dir = %config.bureaucrat.storage_dir.display(),
        "using file storage"
    );

    // An AMQP client implementing MessageBus plugs in here; until one is
    // wired up, queues live in-process.
    let bus = Arc::new(MemoryBus::new());
    tracing::warn!(
        amqp_host = %config.amqp.host,
        "no AMQP bus wired up, using the in-process bus"
    );

    let engine = Engine::new(bus, storage, config.clone());

    if let Some(path) = &args.pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;
    }
    tracing::info!("bureaucrat daemon running");

    let mut alarm = tokio::time::interval(Duration::from_secs(60));
    alarm.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            _ = alarm.tick() => {
                if let Err(err) = engine.handle_alarm().await {
                    tracing::error!(error = %format!("{err:#}"), "alarm handling failed");
                }
            }
            result = engine.step() => {
                match result {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(Duration::from_millis(100)).await,
                    Err(err) => {
                        // The message stays queued for redelivery; back off
                        // instead of spinning on a poisoned delivery.
                        tracing::error!(error = %format!("{err:#}"), "message handling failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    if let Some(path) = &args.pid_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

struct Args {
    config: Option<PathBuf>,
    pid_file: Option<PathBuf>,
}

/// Parse `--config <path>` and `--pid-file <path>`.
fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let get = |flag: &str| {
        args.windows(2)
            .find(|w| w[0] == flag)
            .map(|w| PathBuf::from(&w[1]))
    };
    Args {
        config: get("--config"),
        pid_file: get("--pid-file"),
    }
}
