//! Tracing subscriber setup for the service binaries.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str =
    "inventory_service=info,register_sale=info,stocksync_runtime=info,stocksync_redpanda=info,stocksync_postgres=info";

/// Install the global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Does nothing if a subscriber is already installed.
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}
