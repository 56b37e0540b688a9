//! Spegel - peer-to-peer pull-through mirror for OCI registries
//!
//! Every node advertises the image content already present in its local
//! store over a Kademlia DHT, discovers which peers hold a given digest and
//! transparently serves pull traffic from a peer when possible, falling
//! back to the upstream registry only when no peer can satisfy the request.

pub mod advertiser;
pub mod config;
pub mod error;
pub mod key;
pub mod metrics;
pub mod mirror;
pub mod oci;
pub mod registry;
pub mod routing;
pub mod throttle;

// Re-export commonly used types
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for the library
pub fn init_tracing() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spegel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|_| Error::other("Tracing already initialized"))
}
