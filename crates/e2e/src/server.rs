//! Server readiness - polling the server under test until it answers

use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};

/// Page that answers once the server has finished starting up
pub const READINESS_PATH: &str = "login/home/login.view";

/// Poll `base_url` until a readiness request succeeds or `timeout` passes
pub async fn wait_until_ready(base_url: &str, timeout: Duration) -> E2eResult<()> {
    wait_until_ready_at(base_url, READINESS_PATH, timeout, Duration::from_millis(500)).await
}

pub async fn wait_until_ready_at(
    base_url: &str,
    path: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> E2eResult<()> {
    let url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;

    let start = Instant::now();
    let mut attempts = 0;

    while attempts == 0 || start.elapsed() < timeout {
        attempts += 1;

        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("Server is ready at {}", base_url);
                return Ok(());
            }
            Ok(resp) => {
                warn!("Readiness check returned {}", resp.status());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for server to start...");
                }
                // Connection refused is expected while the server is starting
                if !e.is_connect() {
                    warn!("Readiness check error: {}", e);
                }
            }
        }

        sleep(poll_interval).await;
    }

    Err(E2eError::ServerHealthCheck(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_server_gives_up_after_timeout() {
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = wait_until_ready_at(
            &format!("http://127.0.0.1:{port}"),
            READINESS_PATH,
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, E2eError::ServerHealthCheck(n) if n >= 1));
    }
}
