//! Probe command implementation.

use anyhow::Result;

/// Run the probe command: one forced liveness check, verdict on stdout.
pub async fn run() -> Result<()> {
    let config = super::load_config();
    let connectivity = fieldbook_core::connectivity::ConnectivityMonitor::new(
        config.connectivity.clone(),
        &config.server,
    );

    connectivity.check().await;

    if connectivity.online() {
        println!("online  {}", config.server.health_url());
    } else {
        println!("offline {}", config.server.health_url());
        std::process::exit(1);
    }
    Ok(())
}
