pub mod app;
pub mod domain;
pub mod infra;
pub mod ui;

pub use app::bag::{Bag, BagOptions};
pub use domain::errors::BagError;

/// Install the stderr log subscriber. `BAGSTORE_LOG` takes an `EnvFilter` directive.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("BAGSTORE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
