//! strait
//!
//! Transport-level TCP/UDP relay and load balancer.
//!
//! This service:
//! - Accepts TCP connections or UDP datagrams on one listen address
//! - Picks a backend per connection or datagram with the configured strategy
//! - Relays bytes in both directions until either side goes away
//! - Optionally shapes datagram traffic to a global byte rate

use std::sync::Arc;

use anyhow::{Context, Result};
use strait_balancer::build_strategy;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use strait_proxy::config::{Config, Mode};
use strait_proxy::proxy::{
    resolve_transport, DatagramListener, DatagramListenerConfig, GlobalTrafficShaper, Listener,
    ListenerConfig,
};

fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to STRAIT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("strait-worker")
        .enable_all()
        .build()
        .context("Failed to build the async runtime.")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!("Starting strait");
    info!(
        mode = ?config.mode,
        listen_addr = %config.listen_addr,
        backend_count = config.backends.len(),
        strategy = %config.strategy,
        worker_threads = config.worker_threads,
        "Configuration loaded"
    );

    let transport = resolve_transport(config.native_transport);
    let strategy = build_strategy(config.strategy, config.backends.clone());

    let mut relay = match config.mode {
        Mode::Tcp => {
            let mut listener_config = ListenerConfig::new(config.listen_addr);
            listener_config.max_connections = config.max_connections;
            listener_config.idle = config.idle;

            let listener = Listener::bind(listener_config, strategy, transport)
                .await
                .with_context(|| format!("Failed to bind listener on {}", config.listen_addr))?;
            let listener = Arc::new(listener);

            tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    error!(error = %e, "Listener error");
                }
            })
        }
        Mode::Udp => {
            let shaper = GlobalTrafficShaper::from_limits(
                config.traffic_write_limit,
                config.traffic_read_limit,
            );
            let mut listener_config = DatagramListenerConfig::new(config.listen_addr);
            listener_config.reply_timeout = config.udp_reply_timeout;

            let listener = DatagramListener::bind(listener_config, strategy, shaper, transport)
                .await
                .with_context(|| {
                    format!("Failed to bind datagram listener on {}", config.listen_addr)
                })?;

            tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    error!(error = %e, "Datagram listener error");
                }
            })
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal.")?;
            info!("Shutdown signal received");
            relay.abort();
        }
        result = &mut relay => {
            if let Err(e) = result {
                let err = strait_proxy::RelayError::from(e);
                error!(error = %err, "Relay stopped unexpectedly");
                return Err(err.into());
            }
            info!("Relay stopped");
        }
    }

    Ok(())
}
