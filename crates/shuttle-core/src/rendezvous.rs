// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Receiver-side rendezvous
//
// Turns a transfer code into a live link: LAN discovery first, relay second,
// the whole attempt retried with exponential backoff.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::code::TransferCode;
use crate::discovery;
use crate::link::Connection;
use crate::relay;
use crate::types::{EngineConfig, ShuttleError, ShuttleResult};

/// How a link was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousPath {
    Direct,
    Relay,
}

/// Connection plan for finding a sender by code
#[derive(Debug, Clone)]
pub struct Rendezvous {
    pub discovery_targets: Vec<SocketAddr>,
    pub relay_addr: Option<SocketAddr>,
    pub direct_timeout: Duration,
    pub relay_timeout: Duration,
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Rendezvous {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            discovery_targets: config.discovery_targets.clone(),
            relay_addr: config.relay_addr,
            direct_timeout: config.direct_timeout,
            relay_timeout: config.relay_timeout,
            connect_timeout: config.connect_timeout,
            attempts: config.connect_attempts,
            retry_delay: config.retry_delay,
        }
    }

    /// Delay before attempt `attempt` (1-based); doubles every attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_delay.saturating_mul(1u32 << exponent)
    }

    /// Locate the sender holding `code` and open a link to it.
    ///
    /// Attempts are idempotent; after `attempts` failures this returns
    /// `ConnectFailed` with the last reason.
    pub async fn connect(
        &self,
        code: &TransferCode,
        cancel: &CancellationToken,
    ) -> ShuttleResult<(Connection, RendezvousPath)> {
        let digest = code.digest();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                let delay = self.backoff(attempt - 1);
                tracing::debug!("Rendezvous attempt {} in {:?}", attempt, delay);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ShuttleError::Stopped("local user".to_string()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ShuttleError::Stopped("local user".to_string()));
                }
                r = self.try_once(&digest) => r,
            };

            match result {
                Ok(found) => return Ok(found),
                Err(e) => {
                    tracing::warn!(
                        "Rendezvous attempt {}/{} failed: {}",
                        attempt,
                        self.attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(ShuttleError::ConnectFailed(last_error))
    }

    async fn try_once(&self, digest: &str) -> ShuttleResult<(Connection, RendezvousPath)> {
        let direct_error = match self.try_direct(digest).await {
            Ok(conn) => return Ok((conn, RendezvousPath::Direct)),
            Err(e) => e,
        };

        let Some(relay_addr) = self.relay_addr else {
            return Err(direct_error);
        };

        tracing::info!("Direct discovery failed ({}), trying relay {}", direct_error, relay_addr);
        let conn = relay::join(relay_addr, digest, self.relay_timeout).await?;
        Ok((conn, RendezvousPath::Relay))
    }

    async fn try_direct(&self, digest: &str) -> ShuttleResult<Connection> {
        if self.discovery_targets.is_empty() {
            return Err(ShuttleError::ConnectFailed("no discovery targets".to_string()));
        }

        let found = discovery::discover(digest, &self.discovery_targets, self.direct_timeout)
            .await?
            .ok_or_else(|| {
                ShuttleError::ConnectFailed("no sender answered on the local network".to_string())
            })?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(found.addr))
            .await
            .map_err(|_| ShuttleError::ConnectFailed(format!("{} timed out", found.addr)))?
            .map_err(|e| ShuttleError::ConnectFailed(format!("{}: {}", found.addr, e)))?;
        let _ = stream.set_nodelay(true);

        Ok(Connection::new(
            stream,
            format!("{} ({})", found.hostname, found.addr),
        ))
    }
}
