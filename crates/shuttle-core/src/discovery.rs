// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Local network discovery
//
// A receiver broadcasts a `query` carrying the digest of the code it holds.
// The engine that owns a live session with that code answers with an
// `offer` naming its transfer port. The code itself never goes on the wire.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::registry::CodeRegistry;
use crate::types::{ShuttleError, ShuttleResult};

/// Interval between repeated queries while waiting for an offer
const QUERY_RESEND_INTERVAL: Duration = Duration::from_millis(500);

const MAX_DATAGRAM: usize = 2048;

/// Datagrams exchanged on the discovery port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscoveryMessage {
    Query {
        digest: String,
    },
    Offer {
        digest: String,
        port: u16,
        hostname: String,
    },
}

/// A sender that answered a query
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredSender {
    pub addr: SocketAddr,
    pub hostname: String,
}

/// Answers discovery queries for every live code in the registry
pub struct DiscoveryResponder {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryResponder {
    /// Bind the discovery socket and start answering.
    ///
    /// `transfer_port` is the TCP port advertised in offers.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<CodeRegistry>,
        transfer_port: u16,
        hostname: String,
    ) -> ShuttleResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            ShuttleError::Network(format!("Failed to bind discovery port {}: {}", addr, e))
        })?;
        let local_addr = socket.local_addr()?;
        tracing::info!("Discovery responder listening on {}", local_addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(respond_loop(
            socket,
            registry,
            transfer_port,
            hostname,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn respond_loop(
    socket: UdpSocket,
    registry: Arc<CodeRegistry>,
    transfer_port: u16,
    hostname: String,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Discovery receive failed: {}", e);
                    continue;
                }
            },
        };

        let digest = match serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) {
            Ok(DiscoveryMessage::Query { digest }) => digest,
            Ok(DiscoveryMessage::Offer { .. }) => continue,
            Err(e) => {
                tracing::debug!("Ignoring malformed datagram from {}: {}", src, e);
                continue;
            }
        };

        let Some((_, session_id)) = registry.resolve_digest(&digest) else {
            continue;
        };

        let offer = DiscoveryMessage::Offer {
            digest,
            port: transfer_port,
            hostname: hostname.clone(),
        };
        match serde_json::to_vec(&offer) {
            Ok(bytes) => {
                tracing::debug!("Offering session {} to {}", session_id, src);
                if let Err(e) = socket.send_to(&bytes, src).await {
                    tracing::warn!("Failed to answer discovery query from {}: {}", src, e);
                }
            }
            Err(e) => tracing::error!("Failed to encode discovery offer: {}", e),
        }
    }

    tracing::info!("Discovery responder stopped");
}

/// Broadcast queries for `digest` until a sender answers or `timeout` passes.
pub async fn discover(
    digest: &str,
    targets: &[SocketAddr],
    timeout: Duration,
) -> ShuttleResult<Option<DiscoveredSender>> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        .await
        .map_err(|e| ShuttleError::Network(format!("Failed to open discovery socket: {}", e)))?;
    socket.set_broadcast(true)?;

    let query = serde_json::to_vec(&DiscoveryMessage::Query {
        digest: digest.to_string(),
    })?;

    let deadline = Instant::now() + timeout;
    let mut next_query = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }

        if now >= next_query {
            for target in targets {
                if let Err(e) = socket.send_to(&query, target).await {
                    tracing::debug!("Discovery query to {} failed: {}", target, e);
                }
            }
            next_query = now + QUERY_RESEND_INTERVAL;
        }

        let wait_until = next_query.min(deadline);
        let received = tokio::time::timeout_at(wait_until, socket.recv_from(&mut buf)).await;
        let (len, src) = match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::debug!("Discovery receive failed: {}", e);
                continue;
            }
            Ok(Ok(r)) => r,
        };

        if let Ok(DiscoveryMessage::Offer {
            digest: offered,
            port,
            hostname,
        }) = serde_json::from_slice(&buf[..len])
        {
            if offered == digest {
                let addr = SocketAddr::new(src.ip(), port);
                tracing::info!("Discovered sender {} at {}", hostname, addr);
                return Ok(Some(DiscoveredSender { addr, hostname }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_query_is_answered_for_live_code() {
        let registry = Arc::new(CodeRegistry::new(Duration::from_secs(60)));
        let code = registry.issue_code(SessionId::new()).unwrap();
        let responder = DiscoveryResponder::bind(loopback(), registry, 4242, "desk".into())
            .await
            .unwrap();

        let found = discover(
            &code.digest(),
            &[responder.local_addr()],
            Duration::from_secs(2),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(found.addr.port(), 4242);
        assert_eq!(found.hostname, "desk");
        responder.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_digest_times_out() {
        let registry = Arc::new(CodeRegistry::new(Duration::from_secs(60)));
        let responder = DiscoveryResponder::bind(loopback(), registry, 4242, "desk".into())
            .await
            .unwrap();

        let found = discover(
            "deadbeef",
            &[responder.local_addr()],
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_stop_frees_the_port() {
        let registry = Arc::new(CodeRegistry::new(Duration::from_secs(60)));
        let responder = DiscoveryResponder::bind(loopback(), registry.clone(), 4242, "desk".into())
            .await
            .unwrap();
        let addr = responder.local_addr();
        responder.stop().await;

        let again = DiscoveryResponder::bind(addr, registry.clone(), 4242, "desk".into())
            .await
            .unwrap();
        assert_eq!(again.local_addr(), addr);
        again.stop().await;
    }

    #[test]
    fn test_datagram_shape() {
        let json = serde_json::to_value(DiscoveryMessage::Offer {
            digest: "ab".into(),
            port: 1,
            hostname: "h".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["hostname"], "h");
    }
}
