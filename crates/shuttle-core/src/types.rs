// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::protocol::MAX_PAYLOAD_LEN;

/// Default TCP port for incoming transfer links
pub const DEFAULT_PORT: u16 = 65432;

/// Default UDP port for LAN discovery
pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;

/// Default chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Identifier of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of a transfer a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// A file announced in a transfer manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub size_bytes: u64,
    /// SHA-256 of the whole file, hex encoded. Filled in once the file is fully transferred.
    #[serde(default)]
    pub content_hash: Option<String>,
    pub chunk_count: u64,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size_bytes: u64, chunk_size: usize) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            content_hash: None,
            chunk_count: chunk_count(size_bytes, chunk_size),
        }
    }

    /// Byte length of one chunk (the last chunk may be short)
    pub fn chunk_len(&self, chunk_index: u64, chunk_size: usize) -> usize {
        let offset = chunk_index * chunk_size as u64;
        self.size_bytes.saturating_sub(offset).min(chunk_size as u64) as usize
    }
}

/// Number of chunks needed to carry `size_bytes`
pub fn chunk_count(size_bytes: u64, chunk_size: usize) -> u64 {
    size_bytes.div_ceil(chunk_size as u64)
}

/// User-facing settings, persisted as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// TCP port for incoming transfer links (default: 65432)
    #[serde(default = "default_port")]
    pub port: u16,
    /// UDP port for LAN discovery (default: 50000)
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Device name shown to peers
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Where received files are written
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Rendezvous relay used when direct discovery fails
    #[serde(default)]
    pub relay_addr: Option<SocketAddr>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Flow-control window: chunks in flight before the sender waits
    #[serde(default = "default_window")]
    pub window_chunks: usize,
    /// Transmissions per chunk before a checksum mismatch is fatal
    #[serde(default = "default_max_chunk_attempts")]
    pub max_chunk_attempts: u32,
    /// Maximum connection attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between connection attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Lifetime of an unclaimed transfer code in seconds
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
    #[serde(default = "default_relay_timeout_ms")]
    pub relay_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Shuttle Device".to_string())
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|d| d.download_dir().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("received_files"))
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_window() -> usize {
    8
}

fn default_max_chunk_attempts() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_code_ttl_secs() -> u64 {
    300
}

fn default_relay_timeout_ms() -> u64 {
    3000
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            discovery_port: default_discovery_port(),
            device_name: default_device_name(),
            download_dir: default_download_dir(),
            relay_addr: None,
            chunk_size_bytes: default_chunk_size(),
            window_chunks: default_window(),
            max_chunk_attempts: default_max_chunk_attempts(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            code_ttl_secs: default_code_ttl_secs(),
            relay_timeout_ms: default_relay_timeout_ms(),
        }
    }
}

impl AppSettings {
    /// Convert to engine configuration
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
            discovery_bind: Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.discovery_port,
            )),
            discovery_targets: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                self.discovery_port,
            )],
            relay_addr: self.relay_addr,
            device_name: self.device_name.clone(),
            download_dir: self.download_dir.clone(),
            chunk_size: self.chunk_size_bytes,
            window: self.window_chunks,
            max_chunk_attempts: self.max_chunk_attempts,
            connect_attempts: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            relay_timeout: Duration::from_millis(self.relay_timeout_ms),
            code_ttl: Duration::from_secs(self.code_ttl_secs),
            ..EngineConfig::default()
        }
    }
}

/// Runtime configuration of a `ShuttleEngine`
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where the transfer listener binds
    pub listen_addr: SocketAddr,
    /// Where the discovery responder binds; `None` disables answering queries
    pub discovery_bind: Option<SocketAddr>,
    /// Where discovery queries are sent (broadcast by default)
    pub discovery_targets: Vec<SocketAddr>,
    pub relay_addr: Option<SocketAddr>,
    pub device_name: String,
    pub download_dir: PathBuf,
    pub chunk_size: usize,
    pub window: usize,
    pub max_chunk_attempts: u32,
    pub connect_attempts: u32,
    /// Base backoff; doubled after every failed attempt
    pub retry_delay: Duration,
    /// How long to wait for a discovery offer
    pub direct_timeout: Duration,
    pub relay_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Silence on the link longer than this counts as a disconnect
    pub ack_timeout: Duration,
    /// How long a sender waits for its receiver to come back after a disconnect
    pub reconnect_window: Duration,
    pub code_ttl: Duration,
    pub sweep_interval: Duration,
    /// How long terminal sessions stay queryable before the reaper drops them
    pub session_linger: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            discovery_bind: Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                DEFAULT_DISCOVERY_PORT,
            )),
            discovery_targets: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DEFAULT_DISCOVERY_PORT,
            )],
            relay_addr: None,
            device_name: default_device_name(),
            download_dir: PathBuf::from("received_files"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: default_window(),
            max_chunk_attempts: default_max_chunk_attempts(),
            connect_attempts: default_max_retries(),
            retry_delay: Duration::from_millis(default_retry_delay_ms()),
            direct_timeout: Duration::from_millis(1500),
            relay_timeout: Duration::from_millis(default_relay_timeout_ms()),
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(30),
            reconnect_window: Duration::from_secs(30),
            code_ttl: Duration::from_secs(default_code_ttl_secs()),
            sweep_interval: Duration::from_secs(1),
            session_linger: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Reject settings the transport cannot work with
    pub fn validate(&self) -> Result<(), ShuttleError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD_LEN {
            return Err(ShuttleError::InvalidConfig(format!(
                "chunk size must be between 1 and {} bytes, got {}",
                MAX_PAYLOAD_LEN, self.chunk_size
            )));
        }
        if self.window == 0 {
            return Err(ShuttleError::InvalidConfig(
                "flow-control window must allow at least one chunk".to_string(),
            ));
        }
        if self.max_chunk_attempts == 0 || self.connect_attempts == 0 {
            return Err(ShuttleError::InvalidConfig(
                "attempt budgets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error types for the transfer engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShuttleError {
    #[error("Invalid transfer code format: {0:?}")]
    InvalidCodeFormat(String),

    #[error("Transfer code not found: {0}")]
    CodeNotFound(String),

    #[error("Transfer code expired: {0}")]
    CodeExpired(String),

    #[error("Could not connect: {0}")]
    ConnectFailed(String),

    #[error("Checksum mismatch on file {file_index} chunk {chunk_index}")]
    ChecksumMismatch { file_index: u32, chunk_index: u64 },

    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("Unrecoverable transfer error: {0}")]
    UnrecoverableTransferError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Transfer stopped by {0}")]
    Stopped(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ShuttleResult<T> = Result<T, ShuttleError>;

impl From<std::io::Error> for ShuttleError {
    fn from(err: std::io::Error) -> Self {
        ShuttleError::FileIo(err.to_string())
    }
}

impl From<serde_json::Error> for ShuttleError {
    fn from(err: serde_json::Error) -> Self {
        ShuttleError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.port, 65432);
        assert_eq!(settings.discovery_port, 50000);
        assert_eq!(settings.chunk_size_bytes, 1024 * 1024);
        assert!(settings.relay_addr.is_none());
    }

    #[test]
    fn test_engine_config_conversion() {
        let settings = AppSettings {
            relay_timeout_ms: 1500,
            ..AppSettings::default()
        };
        let config = settings.to_engine_config();
        assert_eq!(config.listen_addr.port(), 65432);
        assert_eq!(config.discovery_targets[0].port(), 50000);
        assert_eq!(config.relay_timeout, Duration::from_millis(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_settings_tolerate_missing_fields() {
        let settings: AppSettings = serde_json::from_str(r#"{"port": 7000}"#).unwrap();
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.window_chunks, 8);
        assert_eq!(settings.max_chunk_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = EngineConfig {
            window: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ShuttleError::InvalidConfig(_))));
    }

    #[test]
    fn test_chunk_math() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);

        let file = FileDescriptor::new("a.bin", 2500, 1000);
        assert_eq!(file.chunk_count, 3);
        assert_eq!(file.chunk_len(0, 1000), 1000);
        assert_eq!(file.chunk_len(2, 1000), 500);
    }
}
