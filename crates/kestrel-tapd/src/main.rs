//! kestrel-tapd entry point.
//!
//! Serves the tap helper protocol and supervises the DHCP responder until
//! interrupted.

use kestrel_tapd::{dhcp, serve, AppState, DhcpConfig, IpDevices, TapDevices, TapdConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("kestrel_tapd=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting kestrel-tapd");

    let config = TapdConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();

    let devices: Arc<dyn TapDevices> = Arc::new(IpDevices::new());
    if let Err(e) = devices.check_bridge(&config.bridge).await {
        // Requests will fail with 400 until the bridge exists.
        tracing::warn!(error = %e, "Bridge not available");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut handles = Vec::new();

    if let Some(dhcp_config) = DhcpConfig::from_tapd(&config) {
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = dhcp::supervise(dhcp_config, shutdown_rx).await {
                tracing::error!(error = %e, "DHCP responder stopped");
            }
        }));
    } else {
        tracing::info!("DHCP responder disabled");
    }

    let state = AppState::new(devices, config.bridge.clone());
    let mut shutdown_rx = shutdown_tx.subscribe();
    let addr = config.addr;
    let mut server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        serve(state, addr, shutdown).await
    });

    tracing::info!(addr = %config.addr, bridge = %config.bridge, "Helper ready");

    let server_result = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal, cleaning up...");
            let _ = shutdown_tx.send(());
            server.await
        }
        result = &mut server => {
            tracing::error!("HTTP server exited unexpectedly");
            let _ = shutdown_tx.send(());
            result
        }
    };

    for handle in handles {
        let _ = handle.await;
    }

    server_result??;
    tracing::info!("Helper shutdown complete");
    Ok(())
}
