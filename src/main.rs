use color_eyre::Result;
use std::str::FromStr;
use takt_relay::config::AgentConfig;
use takt_relay::events::EventSink;
use takt_relay::link::LinkSession;
use takt_relay::supervisor::Supervisor;
use takt_relay::takt::{Label, LineClassifier};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, Registry};

type LevelHandle = reload::Handle<LevelFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = setup()?;

    let config = AgentConfig::load(&AgentConfig::path()).await?;
    apply_log_level(&log_level, &config.logging.level);
    info!(
        "takt-relay for device {} via {}",
        config.device.id,
        config.broker.address()
    );

    let (events, mut event_rx) = EventSink::channel(config.events.channel_capacity);
    let _event_logger = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!("event {}", line),
                Err(e) => error!("Could not encode {} event: {}", event.name(), e),
            }
        }
        debug!("Event channel closed");
    });

    let (label_tx, label_rx) = mpsc::channel(32);
    let _stdin_feeder = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match Label::from_str(&line) {
                    Ok(label) => {
                        if label_tx.send(label).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring input: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
        info!("Label input finished");
    });

    let mut supervisor = Supervisor::new(config, events, LinkSession::factory());
    if !supervisor.start(Box::new(LineClassifier::new("stdin", label_rx))) {
        error!("Takt run not started, check the cell configuration");
        return Ok(());
    }

    info!("Type open / complete / none per line; Ctrl-C to stop");
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            info!("Interrupt received, shutting down");
        }
        _ = supervisor.wait() => {
            warn!("Takt run ended, exiting");
        }
    }
    supervisor.shutdown().await;

    Ok(())
}

/// Installs error reporting and logging before anything else runs
///
/// Logging starts at info; the configured level is applied once the config is loaded.
fn setup() -> Result<LevelHandle> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .init();
    Ok(handle)
}

fn apply_log_level(handle: &LevelHandle, level: &str) {
    let Ok(filter) = LevelFilter::from_str(level) else {
        warn!("Unknown log level '{}', staying at info", level);
        return;
    };
    if let Err(e) = handle.reload(filter) {
        error!("Could not apply log level {}: {}", level, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_replaces_the_startup_level() {
        let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
        let _subscriber = tracing_subscriber::registry().with(filter);

        apply_log_level(&handle, "debug");
        assert_eq!(handle.with_current(|f| *f).unwrap(), LevelFilter::DEBUG);

        apply_log_level(&handle, "chatty");
        assert_eq!(handle.with_current(|f| *f).unwrap(), LevelFilter::DEBUG);
    }
}
