//! Readiness Detector: turn the runtime's port-binding notifications into a
//! preview address.
//!
//! The first notification after a server spawn wins. Later ones in the same
//! cycle are ignored by the controller, which only accepts an address while
//! none is set.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::models::{DeviceMode, PreviewAddress};
use super::runtime::ServerReady;

/// Wait for the next readiness notification.
///
/// Returns `None` once the environment stops publishing. A receiver that
/// fell behind skips ahead instead of failing.
pub async fn first_ready(mut rx: broadcast::Receiver<ServerReady>) -> Option<ServerReady> {
    loop {
        match rx.recv().await {
            Ok(ready) => {
                debug!(port = ready.port, url = %ready.url, "Server reported ready");
                return Some(ready);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed readiness notifications");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

pub fn preview_address(ready: ServerReady, device_mode: DeviceMode) -> PreviewAddress {
    PreviewAddress {
        url: ready.url,
        port: ready.port,
        device_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(port: u16, url: &str) -> ServerReady {
        ServerReady {
            port,
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn first_notification_is_returned() {
        let (tx, rx) = broadcast::channel(4);
        tx.send(ready(3000, "http://preview.local:3000")).unwrap();
        tx.send(ready(4000, "http://preview.local:4000")).unwrap();
        assert_eq!(first_ready(rx).await, Some(ready(3000, "http://preview.local:3000")));
    }

    #[tokio::test]
    async fn closed_channel_yields_none() {
        let (tx, rx) = broadcast::channel::<ServerReady>(4);
        drop(tx);
        assert_eq!(first_ready(rx).await, None);
    }

    #[tokio::test]
    async fn lagged_receiver_recovers() {
        let (tx, rx) = broadcast::channel(1);
        tx.send(ready(1111, "http://localhost:1111")).unwrap();
        tx.send(ready(2222, "http://localhost:2222")).unwrap();
        // Capacity 1: the first event was overwritten
        assert_eq!(first_ready(rx).await.map(|r| r.port), Some(2222));
    }

    #[test]
    fn address_carries_device_mode() {
        let address = preview_address(ready(5173, "http://localhost:5173"), DeviceMode::Tablet);
        assert_eq!(address.url, "http://localhost:5173");
        assert_eq!(address.port, 5173);
        assert_eq!(address.device_mode, DeviceMode::Tablet);
    }
}
