pub mod account;
pub mod server;

use anyhow::{Context, Result};
use std::time::Duration;
use tether_client::{ClientConfig, ConnectionState, SyncEngine};

use account::TestAccount;
use server::{MockServer, TEST_TOKEN};

/// Client settings pointed at `server`, with short timers.
pub fn client_config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        endpoint: server.endpoint(),
        token: Some(TEST_TOKEN.to_string()),
        reconnect_base_delay_ms: 50,
        reconnect_max_delay_ms: 200,
        message_load_retry_ms: 50,
        activity_debounce_ms: 100,
        ..ClientConfig::default()
    }
}

/// Build, initialize and wait for the socket to come up.
pub async fn start_engine(server: &MockServer, account: &TestAccount) -> Result<SyncEngine> {
    let engine = SyncEngine::new(client_config(server), account.secret())?;
    engine.initialize().await?;
    wait_connected(&engine, Duration::from_secs(5)).await?;
    Ok(engine)
}

pub async fn wait_connected(engine: &SyncEngine, timeout: Duration) -> Result<()> {
    let mut state = engine.connection();
    tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .context("timed out waiting for the socket")?
        .context("connection state channel closed")?;
    Ok(())
}

/// Poll `check` until it holds or `timeout` passes. Returns the last result.
pub async fn poll_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
