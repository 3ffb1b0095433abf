// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Engine facade
//
// The presentation boundary. Owns the transfer listener, the discovery
// responder, the session arena and the background reaper. Frontends issue and
// join transfers here, subscribe to session events and stop sessions; they
// never touch sockets.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::code::TransferCode;
use crate::discovery::DiscoveryResponder;
use crate::history::{TransferHistory, TransferRecord};
use crate::link::Connection;
use crate::progress::ProgressStream;
use crate::protocol::Header;
use crate::registry::CodeRegistry;
use crate::relay;
use crate::rendezvous::Rendezvous;
use crate::scan::scan_files;
use crate::session::{
    EventCallback, Session, SessionEvent, SessionInfo, SessionState, StopActor, Subscription,
};
use crate::transfer::{
    read_hello, reject, run_receiver, run_sender, settle, Dialer, IncomingLink, LinkSender,
    ReceiveJob, RendezvousDialer, SendJob, TransferTuning,
};
use crate::types::{EngineConfig, FileDescriptor, Role, SessionId, ShuttleError, ShuttleResult};

/// Queued receiver links per sending session
const LINK_QUEUE: usize = 4;

/// Longest pause between failed relay registrations
const MAX_RELAY_BACKOFF: Duration = Duration::from_secs(10);

/// Time allowed for session tasks to wind down on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What `issue_transfer` hands back to the caller
#[derive(Debug, Clone)]
pub struct IssuedTransfer {
    pub session_id: SessionId,
    pub code: TransferCode,
    pub files: Vec<FileDescriptor>,
    pub total_bytes: u64,
}

struct Slot {
    session: Arc<Session>,
    /// Present while a sending session accepts receiver links
    links: Option<LinkSender>,
}

struct Shared {
    config: EngineConfig,
    tuning: TransferTuning,
    registry: Arc<CodeRegistry>,
    sessions: Mutex<HashMap<SessionId, Slot>>,
    dialer: Arc<dyn Dialer>,
    history: Option<Arc<TransferHistory>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn get(&self, session_id: SessionId) -> ShuttleResult<Arc<Session>> {
        self.sessions
            .lock()
            .get(&session_id)
            .map(|slot| slot.session.clone())
            .ok_or(ShuttleError::SessionNotFound(session_id))
    }

    /// Bookkeeping once a session's task has returned
    fn finish(&self, session: &Session) {
        if let Some(code) = session.code() {
            if session.role() == Role::Sender {
                self.registry.release(code, session.id());
            }
        }
        if let Some(slot) = self.sessions.lock().get_mut(&session.id()) {
            slot.links = None;
        }

        if let Some(history) = &self.history {
            let record = TransferRecord::from_session(&session.info());
            if let Err(e) = history.add(record) {
                tracing::warn!("Failed to record transfer history: {}", e);
            }
        }
    }
}

/// Optional collaborators for `ShuttleEngine::start_with`
#[derive(Default)]
pub struct EngineOptions {
    /// Replaces discovery/relay rendezvous for receiving sessions
    pub dialer: Option<Arc<dyn Dialer>>,
    pub history: Option<Arc<TransferHistory>>,
}

/// The LAN Shuttle transfer engine
pub struct ShuttleEngine {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    discovery: Mutex<Option<DiscoveryResponder>>,
    discovery_addr: Option<SocketAddr>,
}

impl ShuttleEngine {
    /// Bind the transfer listener and discovery responder and start the reaper
    pub async fn start(config: EngineConfig) -> ShuttleResult<Self> {
        Self::start_with(config, EngineOptions::default()).await
    }

    pub async fn start_with(config: EngineConfig, options: EngineOptions) -> ShuttleResult<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            ShuttleError::Network(format!(
                "Failed to bind transfer port {}: {}",
                config.listen_addr, e
            ))
        })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Transfer listener on {}", local_addr);

        let registry = Arc::new(CodeRegistry::new(config.code_ttl));

        // Only senders need the responder; a second engine on the same host
        // runs without one.
        let discovery = match config.discovery_bind {
            Some(addr) => match DiscoveryResponder::bind(
                addr,
                registry.clone(),
                local_addr.port(),
                config.device_name.clone(),
            )
            .await
            {
                Ok(responder) => Some(responder),
                Err(e) => {
                    tracing::warn!("Discovery disabled: {}", e);
                    None
                }
            },
            None => None,
        };
        let discovery_addr = discovery.as_ref().map(|d| d.local_addr());

        let dialer: Arc<dyn Dialer> = match options.dialer {
            Some(dialer) => dialer,
            None => Arc::new(RendezvousDialer::new(Rendezvous::from_config(&config))),
        };

        let shared = Arc::new(Shared {
            tuning: TransferTuning::from(&config),
            config,
            registry,
            sessions: Mutex::new(HashMap::new()),
            dialer,
            history: options.history,
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        shared.track(tokio::spawn(accept_loop(listener, shared.clone())));
        shared.track(tokio::spawn(reap_loop(shared.clone())));

        Ok(Self {
            shared,
            local_addr,
            discovery: Mutex::new(discovery),
            discovery_addr,
        })
    }

    /// Address of the transfer listener
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the discovery responder, if one is running
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery_addr
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Scan `paths`, mint a code and start waiting for a receiver.
    ///
    /// Fails without issuing a code if any path is missing, unreadable or a
    /// directory.
    pub async fn issue_transfer<P: AsRef<Path>>(&self, paths: &[P]) -> ShuttleResult<IssuedTransfer> {
        let shared = &self.shared;
        let manifest = scan_files(paths, shared.config.chunk_size)?;
        let files = manifest.descriptors();
        let total_bytes = manifest.total_bytes();

        let session_id = SessionId::new();
        let code = shared.registry.issue_code(session_id)?;
        let session = Session::with_id(session_id, Role::Sender, Some(code.clone()));
        session.set_files(files.clone())?;

        let (links_tx, links_rx) = mpsc::channel(LINK_QUEUE);
        shared.sessions.lock().insert(
            session_id,
            Slot {
                session: session.clone(),
                links: Some(links_tx),
            },
        );

        session.transition(
            SessionState::Connecting,
            format!(
                "Waiting for a receiver with code {} ({} file(s), {} bytes)",
                code,
                files.len(),
                total_bytes
            ),
        );

        let job = SendJob {
            session: session.clone(),
            manifest,
            device_name: shared.config.device_name.clone(),
            tuning: shared.tuning.clone(),
            links: links_rx,
        };
        let task_shared = shared.clone();
        let task_session = session.clone();
        shared.track(tokio::spawn(async move {
            let result = run_sender(job).await;
            settle(&task_session, result, "All files delivered and verified");
            task_shared.finish(&task_session);
        }));

        if let Some(relay_addr) = shared.config.relay_addr {
            shared.track(tokio::spawn(relay_loop(
                shared.clone(),
                session,
                code.clone(),
                relay_addr,
            )));
        }

        Ok(IssuedTransfer {
            session_id,
            code,
            files,
            total_bytes,
        })
    }

    /// Start receiving the transfer behind `code`.
    ///
    /// A malformed code is rejected here, before any network activity.
    pub async fn join_transfer(&self, code: &str) -> ShuttleResult<SessionId> {
        let shared = &self.shared;
        let code = TransferCode::parse(code)?;
        let session = Session::new(Role::Receiver, Some(code.clone()));
        let session_id = session.id();

        shared.sessions.lock().insert(
            session_id,
            Slot {
                session: session.clone(),
                links: None,
            },
        );
        session.transition(
            SessionState::Connecting,
            format!("Looking for the sender of code {}", code),
        );

        let job = ReceiveJob {
            session: session.clone(),
            code,
            dialer: shared.dialer.clone(),
            download_dir: shared.config.download_dir.clone(),
            tuning: shared.tuning.clone(),
        };
        let task_shared = shared.clone();
        shared.track(tokio::spawn(async move {
            let result = run_receiver(job).await;
            settle(&session, result, "All files received and verified");
            task_shared.finish(&session);
        }));

        Ok(session_id)
    }

    /// Register `callback` for state changes, log entries and progress
    pub fn subscribe(
        &self,
        session_id: SessionId,
        callback: EventCallback,
    ) -> ShuttleResult<Subscription> {
        Ok(self.shared.get(session_id)?.subscribe(callback))
    }

    pub fn unsubscribe(&self, session_id: SessionId, subscription: Subscription) -> ShuttleResult<bool> {
        Ok(self.shared.get(session_id)?.unsubscribe(subscription))
    }

    /// Session events as an unbounded channel, for async consumers
    pub fn events(&self, session_id: SessionId) -> ShuttleResult<async_channel::Receiver<SessionEvent>> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribe(
            session_id,
            Arc::new(move |event: &SessionEvent| {
                let _ = tx.try_send(event.clone());
            }),
        )?;
        Ok(rx)
    }

    pub fn progress(&self, session_id: SessionId) -> ShuttleResult<ProgressStream> {
        Ok(self.shared.get(session_id)?.progress_stream())
    }

    /// Stop a session. Returns false if it had already finished.
    pub fn stop_transfer(&self, session_id: SessionId) -> ShuttleResult<bool> {
        Ok(self.shared.get(session_id)?.stop(StopActor::LocalUser))
    }

    pub fn session(&self, session_id: SessionId) -> ShuttleResult<SessionInfo> {
        Ok(self.shared.get(session_id)?.info())
    }

    /// Every session still in the arena
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .lock()
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        sessions.iter().map(|s| s.info()).collect()
    }

    /// Resolve user input to the local sending session it names
    pub fn validate_and_resolve(&self, code: &str) -> ShuttleResult<SessionId> {
        self.shared.registry.validate_and_resolve(code)
    }

    /// Stop every session and background task
    pub async fn shutdown(self) {
        tracing::info!("Shutting down engine");
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .lock()
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        for session in sessions {
            session.stop(StopActor::LocalUser);
        }

        self.shared.shutdown.cancel();
        let discovery = self.discovery.lock().take();
        if let Some(responder) = discovery {
            responder.stop().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.shared.tasks.lock().drain(..).collect();
        let joined = futures::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, joined).await.is_err() {
            tracing::warn!("Some session tasks did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
}

impl Drop for ShuttleEngine {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = route_stream(&shared, stream, addr).await {
                tracing::debug!("Link from {} not routed: {}", addr, e);
            }
        });
    }
    tracing::info!("Transfer listener stopped");
}

async fn route_stream(shared: &Shared, stream: TcpStream, addr: SocketAddr) -> ShuttleResult<()> {
    let _ = stream.set_nodelay(true);
    route_link(shared, Connection::new(stream, addr.to_string())).await
}

/// Read a receiver's hello and hand the link to the session owning its code
async fn route_link(shared: &Shared, mut conn: Connection) -> ShuttleResult<()> {
    let hello = read_hello(&mut conn, shared.config.handshake_timeout).await?;

    let resolved = TransferCode::parse(&hello.code).and_then(|code| {
        let session_id = shared.registry.resolve(&code)?;
        if hello.resume.is_none() {
            shared.registry.claim(&code, session_id)?;
        }
        Ok(session_id)
    });
    let session_id = match resolved {
        Ok(id) => id,
        Err(e) => {
            reject(conn, &e.to_string()).await;
            return Err(e);
        }
    };

    let links = shared
        .sessions
        .lock()
        .get(&session_id)
        .and_then(|slot| slot.links.clone());
    let Some(links) = links else {
        reject(conn, "transfer is no longer available").await;
        return Err(ShuttleError::SessionNotFound(session_id));
    };

    tracing::info!("Routing link from {} to session {}", conn.peer(), session_id);
    links
        .send(IncomingLink {
            conn,
            resume: hello.resume,
        })
        .await
        .map_err(|_| ShuttleError::SessionNotFound(session_id))
}

/// Keep a registration parked at the relay for as long as the session lives
async fn relay_loop(
    shared: Arc<Shared>,
    session: Arc<Session>,
    code: TransferCode,
    relay_addr: SocketAddr,
) {
    let cancel = session.cancellation().clone();
    let digest = code.digest();
    let mut failures = 0u32;

    loop {
        let attempt = async {
            let mut conn = relay::register(relay_addr, &digest, shared.config.relay_timeout).await?;
            match conn.recv().await?.header {
                Header::RelayPaired => Ok(conn),
                other => Err(ShuttleError::Protocol(format!(
                    "relay answered registration with {}",
                    other.kind()
                ))),
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.shutdown.cancelled() => break,
            result = attempt => result,
        };

        match result {
            Ok(conn) => {
                failures = 0;
                tracing::info!("Relay paired a receiver for session {}", session.id());
                if let Err(e) = route_link(&shared, conn).await {
                    tracing::debug!("Relayed link not routed: {}", e);
                }
            }
            Err(e) => {
                failures += 1;
                let delay = shared
                    .config
                    .retry_delay
                    .saturating_mul(1u32 << failures.min(6))
                    .min(MAX_RELAY_BACKOFF);
                tracing::warn!("Relay registration failed ({}), retrying in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::debug!("Relay registration for session {} ended", session.id());
}

/// Expire idle codes and drop sessions that have been terminal long enough
async fn reap_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.config.sweep_interval);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        for (code, session_id) in shared.registry.sweep(Instant::now()) {
            if let Ok(session) = shared.get(session_id) {
                session.fail(ShuttleError::CodeExpired(code.to_string()));
            }
        }

        let linger = shared.config.session_linger;
        shared.sessions.lock().retain(|id, slot| {
            let keep = slot.session.terminal_for().map_or(true, |t| t < linger);
            if !keep {
                tracing::debug!("Dropping finished session {}", id);
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            listen_addr: loopback(),
            discovery_bind: Some(loopback()),
            discovery_targets: Vec::new(),
            download_dir: dir.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_malformed_code_is_rejected_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ShuttleEngine::start(config(dir.path())).await.unwrap();

        let result = engine.join_transfer("abc12").await;
        assert!(matches!(result, Err(ShuttleError::InvalidCodeFormat(_))));
        assert!(engine.sessions().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_issue_binds_code_to_session() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let engine = ShuttleEngine::start(config(dir.path())).await.unwrap();

        let issued = engine.issue_transfer(&[&file]).await.unwrap();
        assert_eq!(issued.total_bytes, 5);
        assert_eq!(
            engine.validate_and_resolve(issued.code.as_str()).unwrap(),
            issued.session_id
        );
        assert_eq!(
            engine.session(issued.session_id).unwrap().state,
            SessionState::Connecting
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_twice_yields_one_transition() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let engine = ShuttleEngine::start(config(dir.path())).await.unwrap();
        let issued = engine.issue_transfer(&[&file]).await.unwrap();

        let events = engine.events(issued.session_id).unwrap();
        assert!(engine.stop_transfer(issued.session_id).unwrap());
        assert!(!engine.stop_transfer(issued.session_id).unwrap());

        let mut stopped = 0;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged {
                to: SessionState::Stopped,
                ..
            } = event
            {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ShuttleEngine::start(config(dir.path())).await.unwrap();
        let id = SessionId::new();
        assert!(matches!(
            engine.stop_transfer(id),
            Err(ShuttleError::SessionNotFound(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_code_expires_and_fails_sender() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let engine = ShuttleEngine::start(EngineConfig {
            code_ttl: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
            ..config(dir.path())
        })
        .await
        .unwrap();

        let issued = engine.issue_transfer(&[&file]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let info = engine.session(issued.session_id).unwrap();
        assert_eq!(info.state, SessionState::Failed);
        assert!(info.reason.unwrap().contains("expired"));
        assert!(matches!(
            engine.validate_and_resolve(issued.code.as_str()),
            Err(ShuttleError::CodeNotFound(_))
        ));
        engine.shutdown().await;
    }
}
