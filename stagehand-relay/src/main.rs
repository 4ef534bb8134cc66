//! Room relay for stagehand parties.
//!
//! ```text
//! STAGEHAND_RELAY_BIND_ADDR=0.0.0.0:9090 RUST_LOG=info stagehand-relay
//! ```

mod config;

use stagehand_sync::SyncServer;

use crate::config::RelayConfig;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::load();
    log::info!(
        "Starting relay on {} (max {} peers/room, heartbeat {}s)",
        config.bind_addr,
        config.max_peers_per_room,
        config.heartbeat_interval_secs
    );

    let server = SyncServer::new(config.server_config());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down relay");
        }
    }
}
