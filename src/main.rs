use color_eyre::{eyre::eyre, Result};
use factory_link::config::FactoryConfig;
use factory_link::link::{FactoryLink, FactoryLinkHandle};
use factory_link::session::MqttSession;
use factory_link::supervisor::LinkPhase;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => FactoryConfig::default_path()?,
    };
    info!("Loading configuration from {}", path.display());
    let config = FactoryConfig::load(&path).await?;
    let credentials = config.load_credentials().await?;

    info!(
        "Client {} connecting to {}:{} for line {}",
        config.mqtt.client_id, config.mqtt.endpoint, config.mqtt.port, config.factory.assigned_line
    );

    let session = MqttSession::new(config.session_settings());
    let mut link = FactoryLink::new(&config)?
        .with_narration(true)
        .spawn(Box::new(session), credentials);

    let _status_handle = spawn_status_logger(&link);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
    info!("Interrupt received");

    let result = link.shutdown().await;
    log_final_snapshots(&link).await;
    result?;
    Ok(())
}

fn spawn_status_logger(link: &FactoryLinkHandle) -> tokio::task::JoinHandle<()> {
    let mut status = link.watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match current.phase {
                LinkPhase::Backoff => warn!(
                    "Link down (attempt {}), retrying in {:?}: {}",
                    current.attempt,
                    current.retry_in.unwrap_or_default(),
                    current.last_error.as_deref().unwrap_or("unknown")
                ),
                LinkPhase::Connected => info!(
                    "Link up with {} subscriptions",
                    current.subscriptions
                ),
                phase => info!("Link phase: {:?}", phase),
            }
        }
    })
}

async fn log_final_snapshots(link: &FactoryLinkHandle) {
    let snapshots = link.assigned_line_snapshots().await;
    if snapshots.is_empty() {
        info!("No machine on line {} reported", link.assigned_line());
        return;
    }
    for snapshot in snapshots {
        let state = snapshot
            .state
            .as_ref()
            .map(|reading| reading.state.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "{}: state {}, {} metrics",
            snapshot.machine,
            state,
            snapshot.metrics.len()
        );
        for (name, reading) in &snapshot.metrics {
            if reading.stale {
                warn!(
                    "{} {} = {} {} (out-of-order readings seen)",
                    snapshot.machine, name, reading.value, reading.unit
                );
            } else {
                info!("{} {} = {} {}", snapshot.machine, name, reading.value, reading.unit);
            }
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
