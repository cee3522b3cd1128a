use anyhow::{bail, Context, Result};
use can_bridge::{BridgeConfig, BridgeController, RumqttConnector};
use can_transport::CanDriver;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let (config, source) = BridgeConfig::load().context("failed to load configuration")?;
    info!(%source, ?config, "configuration loaded");

    let driver = select_driver(&config.can_backend)?;
    let bridge = BridgeController::new(&config, driver, Arc::new(RumqttConnector));

    let shutdown = bridge.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        shutdown.cancel();
    });

    bridge.run().await.context("bridge terminated")?;
    info!("bridge exited cleanly");
    Ok(())
}

fn select_driver(backend: &str) -> Result<Arc<dyn CanDriver>> {
    match backend {
        #[cfg(feature = "slcan")]
        "slcan" => Ok(Arc::new(can_transport::SlcanDriver)),
        #[cfg(feature = "mock")]
        "mock" => {
            warn!("using the mock CAN backend; transmitted frames loop back to the receive topic");
            let driver = can_transport::MockDriver::new();
            driver.set_loopback(true);
            Ok(Arc::new(driver))
        }
        other => bail!("CAN backend '{other}' is not available in this build"),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
