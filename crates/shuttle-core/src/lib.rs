// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Peer-to-peer LAN transfer engine
//
// This crate provides:
// - Transfer codes and the registry binding them to sessions
// - LAN discovery, the rendezvous relay and the receiver-side resolver
// - The session state machine with its log and subscribers
// - Chunked, verified, resumable transfer with progress snapshots
// - ShuttleEngine, the facade frontends talk to
// - AppSettings, SettingsStore and TransferHistory persistence
//
// Frontends live in separate crates.

pub mod code;
pub mod discovery;
pub mod engine;
pub mod history;
pub mod link;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod rendezvous;
pub mod scan;
pub mod session;
pub mod settings;
pub mod store;
pub mod transfer;
pub mod types;

// Re-export commonly used items
pub use code::TransferCode;
pub use engine::{EngineOptions, IssuedTransfer, ShuttleEngine};
pub use history::{TransferHistory, TransferRecord};
pub use progress::{ProgressSnapshot, ProgressStream};
pub use registry::CodeRegistry;
pub use relay::RelayServer;
pub use session::{
    EventCallback, LogEvent, SessionEvent, SessionInfo, SessionState, Severity, StopActor,
    Subscription,
};
pub use settings::SettingsStore;
pub use transfer::Dialer;
pub use types::{
    AppSettings, EngineConfig, FileDescriptor, Role, SessionId, ShuttleError, ShuttleResult,
};
