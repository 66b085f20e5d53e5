//! Broker binary.
//!
//! Listens for requesters and executors and relays fetches between them
//! until Ctrl+C.
//!
//! ```text
//! fetch-relay-broker --port 8080 --heartbeat-interval-ms 30000 --debug
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use fetch_relay::broker::DEFAULT_PORT;
use fetch_relay::{Broker, BrokerConfig, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "fetch-relay-broker", version, about = "Relay HTTP fetches to a browser extension")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Milliseconds between heartbeat pings.
    #[arg(long, default_value_t = 30_000)]
    heartbeat_interval_ms: u64,

    /// Milliseconds to wait for each pong.
    #[arg(long, default_value_t = 10_000)]
    heartbeat_timeout_ms: u64,

    /// Missed pongs before a peer is dropped.
    #[arg(long, default_value_t = 3)]
    heartbeat_max_missed: u32,

    /// Seconds between stats reports (0 disables them).
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,

    /// Milliseconds between executor-selection retries for queued requests.
    #[arg(long, default_value_t = 2_000)]
    queue_retry_delay_ms: u64,

    /// Selection retries before a queued request fails.
    #[arg(long, default_value_t = 3)]
    queue_max_retries: u32,

    /// Milliseconds a new socket has to identify before it is closed.
    #[arg(long, default_value_t = 10_000)]
    handshake_timeout_ms: u64,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn to_config(&self) -> BrokerConfig {
        let stats_interval =
            (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs));

        BrokerConfig::new()
            .with_host(self.host)
            .with_port(self.port)
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .with_heartbeat_timeout(Duration::from_millis(self.heartbeat_timeout_ms))
            .with_heartbeat_max_missed(self.heartbeat_max_missed)
            .with_stats_interval(stats_interval)
            .with_queue_retry_delay(Duration::from_millis(self.queue_retry_delay_ms))
            .with_queue_max_retries(self.queue_max_retries)
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging. `RUST_LOG` wins unless `--debug` is given.
fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("fetch_relay=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fetch_relay=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let broker = Broker::start(args.to_config()).await?;
    if let Some(url) = broker.ws_url() {
        info!(%url, "Waiting for requesters and executors");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    broker.shutdown().await;

    Ok(())
}
