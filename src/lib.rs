pub mod aggregator;
pub mod catalog;
pub mod checkpoint;
pub mod checkpoint_manager;
pub mod config;
pub mod error;
pub mod export;
pub mod job;
pub mod job_store;
pub mod protocol;
pub mod state;

#[cfg(feature = "distributed")]
pub mod client;
#[cfg(feature = "distributed")]
pub mod coordinator;
#[cfg(feature = "distributed")]
pub mod executor;
#[cfg(feature = "distributed")]
pub mod server;
#[cfg(feature = "distributed")]
pub mod shutdown;
#[cfg(feature = "distributed")]
pub mod worker;

pub use error::*;

/// Install the fmt subscriber used by the binaries. `RUST_LOG` overrides the
/// default `info` filter.
#[cfg(feature = "distributed")]
pub fn init_tracing(service: &str) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let initialized = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if initialized.is_ok() {
        tracing::info!(service, "tracing initialized");
    }
}
