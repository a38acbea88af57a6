//! Catalog Edge
//!
//! Request-serving optimization layer for a read-heavy catalog API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Catalog Edge                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Admission   │───▶│ Tiered Cache │───▶│   Backing    │       │
//! │  │ (rate limit) │    │ local+remote │    │ (balanced)   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use catalog_edge::config::Args;
use catalog_edge::error::Result;
use catalog_edge::server;
use catalog_edge::service::{Components, EdgeService};

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.to_config()?;
    let addr = config.socket_addr()?;

    info!("Starting Catalog Edge");
    info!("  Listen address: {}", addr);
    info!(
        "  Remote cache: {}",
        config.redis_url.as_deref().unwrap_or("disabled")
    );
    info!("  Upstreams: {}", config.upstreams.len());
    info!("  Strategy: {}", config.balancer.strategy);
    info!(
        "  Rate limit: {} per {}s (enabled: {})",
        config.rate_limit.limit, config.rate_limit.window_secs, config.rate_limit.enabled
    );
    info!("  Default TTL: {}s", config.cache.default_ttl_secs);
    info!("  Stats window: {}s", config.stats_window_secs);

    let components = Components::from_config(&config).await?;
    let service = Arc::new(EdgeService::new(config, components));
    service.start_background_tasks();

    let cancel = service.cancellation_token();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_cancel.cancel();
    });

    let served = server::serve(Arc::clone(&service), addr, cancel).await;
    service.shutdown().await;

    if let Err(e) = &served {
        error!("Server error: {}", e);
    }
    info!("Catalog Edge shutdown complete");
    served
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "redis=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
