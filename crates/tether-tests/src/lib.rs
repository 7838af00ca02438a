//! Integration test helpers: an in-process mock sync server and a test
//! account that plays the daemon's side of the encryption.

pub mod harness;

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("tether_client=debug,tether_tests=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
