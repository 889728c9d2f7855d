//! rfbridge daemon entry point

use rfbridge::api;
use rfbridge::bridge::Bridge;
use rfbridge::config::BridgeConfig;
use rfbridge::error::{Error, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Parse config path from command line arguments.
///
/// Supports:
/// - `rfbridge <path>` (positional)
/// - `rfbridge --config <path>` (flag-based)
/// - `rfbridge -c <path>` (short flag)
///
/// Defaults to `/etc/rfbridge.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "/etc/rfbridge.toml".to_string()
}

fn setup_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).map_err(|e| Error::Other(format!("signals: {}", e)))?;
    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {:?}, shutting down", sig);
                shutdown.store(true, Ordering::Relaxed);
            }
        })
        .map_err(Error::Io)?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("rfbridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = parse_config_path();
    log::info!("Using config: {}", config_path);
    let config = BridgeConfig::load(&config_path)?;

    log::info!("Node id: {}", config.node.id);
    let bridge = Bridge::new(config)?;
    bridge.start()?;

    api::spawn_http(&bridge)?;
    api::ws::spawn_ws(&bridge)?;

    setup_signal_handler(Arc::clone(&bridge.shutdown))?;

    log::info!(
        "rfbridge running (http {}, ws {}). Press Ctrl-C to stop.",
        bridge.config.http.bind,
        bridge.config.ws.bind
    );
    bridge.run_until_shutdown();

    log::info!("rfbridge stopped");
    Ok(())
}
