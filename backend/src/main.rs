//! Tandem - OTP Rendezvous and Signaling Relay
//!
//! Pairs peers by a short code and relays their signaling over iroh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use iroh::protocol::Router;
use iroh::{Endpoint, SecretKey};
use tracing::{info, warn};

use tandem::{
    Engine, EngineConfig, Hub, Registry, RelayHandler, ALPN, DEFAULT_OUTBOX_CAPACITY,
};

/// Command-line arguments for the relay server.
#[derive(Debug, Parser)]
#[command(name = "tandem")]
#[command(about = "Pair peers by a short code and relay their signaling messages")]
struct Args {
    /// Path to the secret key file. If not specified, a new key is generated.
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    /// Delay in milliseconds before a peer is told its partner disconnected.
    #[arg(long, default_value = "200")]
    grace_period_ms: u64,

    /// Events buffered per connection before further events are dropped.
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    outbox_capacity: usize,
}

/// Load or generate the server's secret key.
fn load_or_generate_key(path: Option<&PathBuf>) -> Result<SecretKey, Box<dyn std::error::Error>> {
    match path {
        Some(path) if path.exists() => {
            let key_bytes = std::fs::read(path)?;
            let key_array: [u8; 32] = key_bytes
                .try_into()
                .map_err(|_| "Invalid key file: expected 32 bytes")?;
            let key = SecretKey::from_bytes(&key_array);
            info!(?path, "Loaded secret key from file");
            Ok(key)
        }
        Some(path) => {
            let key = SecretKey::generate(&mut rand::thread_rng());
            std::fs::write(path, key.to_bytes())?;
            info!(?path, "Generated and saved new secret key");
            Ok(key)
        }
        None => {
            let key = SecretKey::generate(&mut rand::thread_rng());
            warn!("Generated ephemeral secret key (not persisted)");
            Ok(key)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tandem=info".parse()?)
                .add_directive("iroh=warn".parse()?),
        )
        .init();

    let args = Args::parse();

    let secret_key = load_or_generate_key(args.key_file.as_ref())?;

    // Publish our address via n0 DNS so clients can dial by NodeId.
    // The Router registers the ALPN, so none is set here.
    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .discovery_n0()
        .bind()
        .await?;

    info!("Node ID: {}", endpoint.node_id());

    let mut relay_watcher = endpoint.home_relay();
    match tokio::time::timeout(Duration::from_secs(10), relay_watcher.initialized()).await {
        Ok(Ok(relay_url)) => {
            info!("Relay URL: {}", relay_url);
        }
        Ok(Err(_)) => {
            warn!("Relay watcher disconnected - clients will need direct connectivity");
        }
        Err(_) => {
            warn!("Timeout waiting for relay connection - clients will need direct connectivity");
        }
    }

    let config = EngineConfig {
        grace_period: Duration::from_millis(args.grace_period_ms),
    };
    let engine = Arc::new(Engine::new(Arc::new(Registry::new()), config));
    let hub = Hub::new(args.outbox_capacity);

    let handler = RelayHandler::new(engine, hub);

    let router = Router::builder(endpoint.clone())
        .accept(ALPN, handler)
        .spawn()
        .await?;

    info!(
        grace_period_ms = args.grace_period_ms,
        outbox_capacity = args.outbox_capacity,
        "Relay server is running"
    );
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");

    router.shutdown().await?;
    endpoint.close().await;

    info!("Server stopped");

    Ok(())
}
