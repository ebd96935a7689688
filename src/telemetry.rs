//! Console logging for the command line client.
//!
//! The library only emits `tracing` events; installing a subscriber is left to the application.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,mariadb_wire=debug";

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
/// `verbose` raises the crate's own events to `trace`.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("info,mariadb_wire=trace"),
        Err(_) => EnvFilter::new(DEFAULT_FILTER),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    Ok(())
}

/// Span wrapping one client command in the binary.
#[macro_export]
macro_rules! span_command {
    ($name:expr) => {
        tracing::info_span!("command", operation = $name)
    };
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!("command", operation = $name, $($field)*)
    };
}
