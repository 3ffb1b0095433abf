// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Rendezvous relay
//
// Used when the two peers cannot see each other's broadcasts (different
// subnets, NAT). A sender parks a registration under its code digest; a
// receiver joining with the same digest is paired with it and the relay
// splices the two byte streams together. The relay never sees the code.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::link::Connection;
use crate::protocol::Header;
use crate::types::{ShuttleError, ShuttleResult};

/// How long a connecting client has to say what it wants
const INTRO_TIMEOUT: Duration = Duration::from_secs(10);

/// Registrations older than this are assumed dead
const PARK_TTL: Duration = Duration::from_secs(15 * 60);

struct Parked {
    conn: Connection,
    parked_at: Instant,
}

type ParkedMap = Arc<Mutex<HashMap<String, Parked>>>;

/// TCP relay pairing senders and receivers by code digest
pub struct RelayServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayServer {
    pub async fn bind(addr: SocketAddr) -> ShuttleResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ShuttleError::Network(format!("Failed to bind relay to {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Relay listening on {}", local_addr);

        let cancel = CancellationToken::new();
        let parked: ParkedMap = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(accept_loop(listener, parked, cancel.clone()));

        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until the task ends (used by the relay binary)
    pub async fn wait(self) {
        let _ = self.task.await;
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn accept_loop(listener: TcpListener, parked: ParkedMap, cancel: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!("Relay accept failed: {}", e);
                    continue;
                }
            },
        };

        let parked = parked.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, addr, parked).await {
                tracing::debug!("Relay client {} dropped: {}", addr, e);
            }
        });
    }

    parked.lock().clear();
    tracing::info!("Relay stopped");
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, parked: ParkedMap) -> ShuttleResult<()> {
    let _ = stream.set_nodelay(true);
    let mut conn = Connection::new(stream, addr.to_string());

    match conn.recv_header(INTRO_TIMEOUT).await? {
        Header::RelayRegister { digest } => {
            tracing::info!("Relay: sender {} registered", addr);
            let mut map = parked.lock();
            map.retain(|_, p| p.parked_at.elapsed() < PARK_TTL);
            map.insert(
                digest,
                Parked {
                    conn,
                    parked_at: Instant::now(),
                },
            );
            Ok(())
        }
        Header::RelayJoin { digest } => {
            let waiting = parked.lock().remove(&digest);
            let Some(Parked { conn: mut sender, .. }) = waiting else {
                conn.send(Header::RelayRejected {
                    reason: "no sender registered for this code".to_string(),
                })
                .await?;
                return Ok(());
            };

            if let Err(e) = sender.send(Header::RelayPaired).await {
                conn.send(Header::RelayRejected {
                    reason: "sender is no longer reachable".to_string(),
                })
                .await?;
                return Err(e);
            }
            conn.send(Header::RelayPaired).await?;
            tracing::info!("Relay: paired {} with {}", addr, sender.peer());

            splice(sender, conn).await
        }
        other => Err(ShuttleError::Protocol(format!(
            "relay expected register or join, got {}",
            other.kind()
        ))),
    }
}

async fn splice(a: Connection, b: Connection) -> ShuttleResult<()> {
    let (mut a_io, a_buf) = a.into_inner();
    let (mut b_io, b_buf) = b.into_inner();

    if !a_buf.is_empty() {
        b_io.write_all(&a_buf).await?;
    }
    if !b_buf.is_empty() {
        a_io.write_all(&b_buf).await?;
    }

    let (up, down) = tokio::io::copy_bidirectional(&mut a_io, &mut b_io)
        .await
        .map_err(|e| ShuttleError::TransportDisconnected(e.to_string()))?;
    tracing::debug!("Relay splice closed after {} / {} bytes", up, down);
    Ok(())
}

async fn dial(relay: SocketAddr, timeout: Duration) -> ShuttleResult<Connection> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(relay))
        .await
        .map_err(|_| ShuttleError::ConnectFailed(format!("relay {} timed out", relay)))?
        .map_err(|e| ShuttleError::ConnectFailed(format!("relay {}: {}", relay, e)))?;
    let _ = stream.set_nodelay(true);
    Ok(Connection::new(stream, format!("relay {}", relay)))
}

/// Park a sender registration. Await `RelayPaired` on the returned link.
pub async fn register(relay: SocketAddr, digest: &str, timeout: Duration) -> ShuttleResult<Connection> {
    let mut conn = dial(relay, timeout).await?;
    conn.send(Header::RelayRegister {
        digest: digest.to_string(),
    })
    .await?;
    Ok(conn)
}

/// Join the sender parked under `digest`; the returned link reaches the sender.
pub async fn join(relay: SocketAddr, digest: &str, timeout: Duration) -> ShuttleResult<Connection> {
    let attempt = async {
        let mut conn = dial(relay, timeout).await?;
        conn.send(Header::RelayJoin {
            digest: digest.to_string(),
        })
        .await?;

        match conn.recv().await?.header {
            Header::RelayPaired => Ok(conn),
            Header::RelayRejected { reason } => Err(ShuttleError::ConnectFailed(reason)),
            other => Err(ShuttleError::Protocol(format!(
                "relay answered join with {}",
                other.kind()
            ))),
        }
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ShuttleError::ConnectFailed(format!("relay {} did not pair within {:?}", relay, timeout)))?
}
