mod broker;
mod config;
mod connection;
mod delivery;
mod format;
mod http;
mod queue;
mod sampler;
mod sensor;
mod spool;
#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::delivery::StopSignal;
use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};

fn init_tracing(debug: bool) -> Result<()> {
    let default_filter = if debug {
        "info,sensor_forwarder=debug"
    } else {
        "info,sensor_forwarder=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn wait_for_shutdown(stop: StopSignal) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error=%err, "SIGTERM handler unavailable");
                futures::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    stop.stop();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.debug)?;
    tracing::info!(
        device_id = %config.device_id,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        topic = %config.broker.topic,
        format = %config.payload_format,
        spool_dir = %config.spool_dir.display(),
        "sensor-forwarder starting"
    );

    let stop = StopSignal::new();
    tokio::spawn(wait_for_shutdown(stop.clone()));

    if let Err(err) = delivery::run(config, stop).await {
        tracing::error!(error=?err, "sensor-forwarder exited");
        return Err(err);
    }
    Ok(())
}
