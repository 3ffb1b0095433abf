// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Transfer session state machine
//
// A session owns its state, its log and its subscribers. Every transition
// appends one log entry and is delivered to subscribers before the call
// returns. Delivery is serialized by a re-entrant lock, so callbacks see
// events in order and may call back into the session.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::code::TransferCode;
use crate::progress::{ProgressSnapshot, ProgressStream};
use crate::types::{FileDescriptor, Role, SessionId, ShuttleError, ShuttleResult};

/// Lifecycle of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Connecting,
    Transferring,
    Complete,
    Failed,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Failed | SessionState::Stopped
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Transferring)
                | (Connecting, Failed)
                | (Transferring, Complete)
                | (Transferring, Failed)
                | (Transferring, Stopped)
                | (Idle, Stopped)
                | (Connecting, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Transferring => "transferring",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// One entry of a session's append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub id: u64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Who stopped a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopActor {
    LocalUser,
    RemotePeer,
}

impl fmt::Display for StopActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopActor::LocalUser => f.write_str("local user"),
            StopActor::RemotePeer => f.write_str("remote peer"),
        }
    }
}

/// What subscribers are told
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Log {
        event: LogEvent,
    },
    Progress {
        snapshot: ProgressSnapshot,
    },
}

pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Read-only copy of a session for presentation layers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub code: Option<TransferCode>,
    pub role: Role,
    pub state: SessionState,
    pub files: Vec<FileDescriptor>,
    pub created_at: DateTime<Utc>,
    pub peer: Option<String>,
    /// Failure reason or stop actor once terminal
    pub reason: Option<String>,
    pub progress: ProgressSnapshot,
    pub logs: Vec<LogEvent>,
}

struct Inner {
    state: SessionState,
    files: Vec<FileDescriptor>,
    peer: Option<String>,
    reason: Option<String>,
    logs: Vec<LogEvent>,
    next_log_id: u64,
    subscribers: Vec<(Subscription, EventCallback)>,
    next_subscription: u64,
    terminal_at: Option<Instant>,
}

impl Inner {
    fn push_log(&mut self, severity: Severity, message: String) -> LogEvent {
        self.next_log_id += 1;
        let event = LogEvent {
            id: self.next_log_id,
            severity,
            message,
            timestamp: Utc::now(),
        };
        self.logs.push(event.clone());
        event
    }

    fn callbacks(&self) -> Vec<EventCallback> {
        self.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

/// One transfer session, shared between the engine, its tasks and subscribers
pub struct Session {
    id: SessionId,
    role: Role,
    code: Option<TransferCode>,
    created_at: DateTime<Utc>,
    created_instant: Instant,
    inner: Mutex<Inner>,
    delivery: ReentrantMutex<()>,
    progress_tx: watch::Sender<ProgressSnapshot>,
    cancel: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(role: Role, code: Option<TransferCode>) -> Arc<Self> {
        Self::with_id(SessionId::new(), role, code)
    }

    pub fn with_id(id: SessionId, role: Role, code: Option<TransferCode>) -> Arc<Self> {
        let (progress_tx, _) = watch::channel(ProgressSnapshot::default());
        Arc::new(Self {
            id,
            role,
            code,
            created_at: Utc::now(),
            created_instant: Instant::now(),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                files: Vec::new(),
                peer: None,
                reason: None,
                logs: Vec::new(),
                next_log_id: 0,
                subscribers: Vec::new(),
                next_subscription: 0,
                terminal_at: None,
            }),
            delivery: ReentrantMutex::new(()),
            progress_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn code(&self) -> Option<&TransferCode> {
        self.code.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Fires when the session reaches any terminal state
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_instant.elapsed()
    }

    /// Time spent in a terminal state, if any
    pub fn terminal_for(&self) -> Option<std::time::Duration> {
        self.inner.lock().terminal_at.map(|t| t.elapsed())
    }

    pub fn files(&self) -> Vec<FileDescriptor> {
        self.inner.lock().files.clone()
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.lock().reason.clone()
    }

    pub fn logs(&self) -> Vec<LogEvent> {
        self.inner.lock().logs.clone()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        *self.progress_tx.borrow()
    }

    pub fn progress_stream(&self) -> ProgressStream {
        ProgressStream::new(self.progress_tx.subscribe())
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        SessionInfo {
            id: self.id,
            code: self.code.clone(),
            role: self.role,
            state: inner.state,
            files: inner.files.clone(),
            created_at: self.created_at,
            peer: inner.peer.clone(),
            reason: inner.reason.clone(),
            progress: *self.progress_tx.borrow(),
            logs: inner.logs.clone(),
        }
    }

    /// Freeze the manifest. Only allowed before the transfer starts.
    pub fn set_files(&self, files: Vec<FileDescriptor>) -> ShuttleResult<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, SessionState::Idle | SessionState::Connecting) {
            return Err(ShuttleError::Protocol(format!(
                "manifest is frozen once the session is {}",
                inner.state
            )));
        }
        inner.files = files;
        Ok(())
    }

    /// Record the verified content hash of one file
    pub fn set_content_hash(&self, file_index: usize, hash: String) {
        if let Some(file) = self.inner.lock().files.get_mut(file_index) {
            file.content_hash = Some(hash);
        }
    }

    pub fn set_peer(&self, peer: Option<String>) {
        self.inner.lock().peer = peer;
    }

    /// Move to `to`, logging `message`. Returns false (and does nothing) if
    /// the state machine does not allow the move.
    pub fn transition(&self, to: SessionState, message: impl Into<String>) -> bool {
        let _order = self.delivery.lock();

        let (from, log, callbacks) = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            if !from.can_transition_to(to) {
                tracing::debug!("Session {}: ignoring {} -> {}", self.id, from, to);
                return false;
            }

            inner.state = to;
            let message = message.into();
            if matches!(to, SessionState::Failed | SessionState::Stopped) {
                inner.reason = Some(message.clone());
            }
            if to.is_terminal() {
                inner.terminal_at = Some(Instant::now());
            }

            let severity = match to {
                SessionState::Complete => Severity::Success,
                SessionState::Failed | SessionState::Stopped => Severity::Error,
                _ => Severity::Info,
            };
            let log = inner.push_log(severity, message);
            (from, log, inner.callbacks())
        };

        tracing::info!("Session {}: {} -> {} ({})", self.id, from, to, log.message);

        let changed = SessionEvent::StateChanged { from, to };
        let logged = SessionEvent::Log { event: log };
        for cb in &callbacks {
            cb(&changed);
        }
        for cb in &callbacks {
            cb(&logged);
        }

        if to.is_terminal() {
            self.cancel.cancel();
        }
        true
    }

    /// Move to Failed with `reason`
    pub fn fail(&self, reason: impl fmt::Display) -> bool {
        self.transition(SessionState::Failed, format!("Transfer failed: {}", reason))
    }

    /// Move to Stopped. A no-op returning false once the session is terminal.
    pub fn stop(&self, actor: StopActor) -> bool {
        self.transition(SessionState::Stopped, format!("Transfer stopped by {}", actor))
    }

    /// Append a log entry without changing state
    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        let _order = self.delivery.lock();
        let (log, callbacks) = {
            let mut inner = self.inner.lock();
            let log = inner.push_log(severity, message.into());
            (log, inner.callbacks())
        };

        match severity {
            Severity::Error => tracing::warn!("Session {}: {}", self.id, log.message),
            _ => tracing::debug!("Session {}: {}", self.id, log.message),
        }

        let event = SessionEvent::Log { event: log };
        for cb in &callbacks {
            cb(&event);
        }
    }

    /// Publish a new progress snapshot to the watch channel and subscribers
    pub fn publish_progress(&self, snapshot: ProgressSnapshot) {
        let _order = self.delivery.lock();
        self.progress_tx.send_replace(snapshot);
        let callbacks = self.inner.lock().callbacks();

        let event = SessionEvent::Progress { snapshot };
        for cb in &callbacks {
            cb(&event);
        }
    }

    /// Register `callback`. It immediately receives the current progress.
    pub fn subscribe(&self, callback: EventCallback) -> Subscription {
        let _order = self.delivery.lock();
        let id = {
            let mut inner = self.inner.lock();
            inner.next_subscription += 1;
            let id = Subscription(inner.next_subscription);
            inner.subscribers.push((id, callback.clone()));
            id
        };

        callback(&SessionEvent::Progress {
            snapshot: self.progress(),
        });
        id
    }

    pub fn unsubscribe(&self, id: Subscription) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sub, _)| *sub != id);
        inner.subscribers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(session: &Session) -> Arc<Mutex<Vec<SessionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        session.subscribe(Arc::new(move |e: &SessionEvent| sink.lock().push(e.clone())));
        events
    }

    #[test]
    fn test_happy_path_transitions() {
        let session = Session::new(Role::Sender, None);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.transition(SessionState::Connecting, "Waiting for receiver"));
        assert!(session.transition(SessionState::Transferring, "Connected"));
        assert!(session.transition(SessionState::Complete, "Done"));
        assert!(session.is_terminal());
        assert!(session.cancellation().is_cancelled());
        assert_eq!(session.logs().len(), 3);
        assert_eq!(session.logs()[2].severity, Severity::Success);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            SessionState::Complete,
            SessionState::Failed,
            SessionState::Stopped,
        ] {
            for next in [
                SessionState::Idle,
                SessionState::Connecting,
                SessionState::Transferring,
                SessionState::Complete,
                SessionState::Failed,
                SessionState::Stopped,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let session = Session::new(Role::Receiver, None);
        assert!(!session.transition(SessionState::Complete, "too early"));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.logs().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let session = Session::new(Role::Sender, None);
        let events = recorder(&session);
        session.transition(SessionState::Connecting, "Waiting");
        session.transition(SessionState::Transferring, "Connected");

        assert!(session.stop(StopActor::LocalUser));
        assert!(!session.stop(StopActor::LocalUser));

        let stops = events
            .lock()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::StateChanged {
                        to: SessionState::Stopped,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(stops, 1);
        assert_eq!(
            session.reason().as_deref(),
            Some("Transfer stopped by local user")
        );
    }

    #[test]
    fn test_subscriber_gets_current_progress_then_events_in_order() {
        let session = Session::new(Role::Receiver, None);
        session.publish_progress(ProgressSnapshot {
            percentage: 25.0,
            bytes_transferred: 25,
            total_bytes: 100,
            ..ProgressSnapshot::default()
        });

        let events = recorder(&session);
        session.transition(SessionState::Connecting, "Looking for sender");

        let events = events.lock();
        assert!(matches!(
            &events[0],
            SessionEvent::Progress { snapshot } if snapshot.bytes_transferred == 25
        ));
        assert!(matches!(
            &events[1],
            SessionEvent::StateChanged {
                from: SessionState::Idle,
                to: SessionState::Connecting
            }
        ));
        assert!(matches!(&events[2], SessionEvent::Log { .. }));
    }

    #[test]
    fn test_callback_may_reenter_session() {
        let session = Session::new(Role::Sender, None);
        let weak = Arc::downgrade(&session);
        session.subscribe(Arc::new(move |e: &SessionEvent| {
            if let SessionEvent::StateChanged {
                to: SessionState::Transferring,
                ..
            } = e
            {
                if let Some(s) = weak.upgrade() {
                    s.stop(StopActor::LocalUser);
                }
            }
        }));

        session.transition(SessionState::Connecting, "Waiting");
        session.transition(SessionState::Transferring, "Connected");
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_manifest_frozen_once_transferring() {
        let session = Session::new(Role::Receiver, None);
        session
            .set_files(vec![FileDescriptor::new("a", 1, 1024)])
            .unwrap();
        session.transition(SessionState::Connecting, "c");
        session.transition(SessionState::Transferring, "t");
        assert!(session.set_files(Vec::new()).is_err());
        assert_eq!(session.files().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let session = Session::new(Role::Sender, None);
        let id = session.subscribe(Arc::new(|_: &SessionEvent| {}));
        assert!(session.unsubscribe(id));
        assert!(!session.unsubscribe(id));
    }
}
