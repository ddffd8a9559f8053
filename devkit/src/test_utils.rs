/*!
Helpers pour tests d'intégration

Ports, deadlines and logging shared by every test binary of the workspace.
*/

use std::future::Future;
use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once per test binary (`RUST_LOG` honoured).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Port that was free a moment ago on the loopback interface.
pub fn free_tcp_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

pub fn free_udp_port() -> Result<u16> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(socket.local_addr()?.port())
}

/// Polls `condition` every 20 ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Async flavour of [`wait_until`] for conditions that need to await.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_until_succeeds_and_times_out() {
        let mut calls = 0;
        wait_until(Duration::from_secs(1), || {
            calls += 1;
            calls >= 3
        })
        .await
        .unwrap();
        assert_eq!(calls, 3);

        assert!(wait_until(Duration::from_millis(50), || false).await.is_err());
    }

    #[test]
    fn test_free_ports_are_nonzero() {
        assert_ne!(free_tcp_port().unwrap(), 0);
        assert_ne!(free_udp_port().unwrap(), 0);
    }
}
