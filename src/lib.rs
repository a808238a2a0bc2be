pub mod config;
pub mod models;
pub mod db;
pub mod blob; // Blob storage collaborator (put/get/presign/delete)
pub mod signing; // HMAC-SHA256 webhook signatures
pub mod rules; // Rule store collaborator + RuleVersion validation
pub mod queue; // Durable at-least-once delay queue
pub mod pipeline;
pub mod core_state;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}
