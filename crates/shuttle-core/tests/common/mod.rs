// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Shared helpers for engine integration tests

#![allow(dead_code)]

use shuttle_core::{EngineConfig, SessionId, SessionInfo, ShuttleEngine};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// A sending engine: ephemeral transfer port, discovery answered on loopback
pub fn sender_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        listen_addr: loopback(),
        discovery_bind: Some(loopback()),
        discovery_targets: Vec::new(),
        download_dir: dir.to_path_buf(),
        device_name: "sender-host".to_string(),
        retry_delay: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

/// A receiving engine whose discovery queries go straight to `sender`
pub fn receiver_config(dir: &Path, sender: &ShuttleEngine) -> EngineConfig {
    EngineConfig {
        listen_addr: loopback(),
        discovery_bind: None,
        discovery_targets: sender.discovery_addr().into_iter().collect(),
        download_dir: dir.to_path_buf(),
        device_name: "receiver-host".to_string(),
        retry_delay: Duration::from_millis(20),
        direct_timeout: Duration::from_millis(300),
        ..EngineConfig::default()
    }
}

/// Poll until the session is terminal and return its final view
pub async fn wait_terminal(engine: &ShuttleEngine, id: SessionId, limit: Duration) -> SessionInfo {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let info = engine.session(id).expect("session exists");
        if info.state.is_terminal() {
            return info;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {} still {} after {:?}",
            id,
            info.state,
            limit
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

/// Deterministic, non-repeating-looking bytes
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
