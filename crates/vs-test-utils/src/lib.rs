// vs-test-utils: shared test utilities for the object model suite.
//
// Provides an in-process mock forwarder speaking the vs-api frame protocol,
// for unit and integration testing of the engine.

pub mod mock_forwarder;

pub use mock_forwarder::MockForwarder;

/// Initialise test logging once; respects RUST_LOG.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
