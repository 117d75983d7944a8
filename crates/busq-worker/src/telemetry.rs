//! Tracing setup for processes that embed the bus.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber. `RUST_LOG` wins over `default_filter`; set
/// `json` for line-delimited JSON output.
pub fn init_telemetry(default_filter: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::debug!("Tracing initialized");
    Ok(())
}

/// Subscriber for tests; ignores the error when one is already installed.
pub fn init_test_telemetry() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "busq=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
