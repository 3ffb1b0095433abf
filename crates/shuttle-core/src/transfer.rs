// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Chunked transfer
//
// Sender side: a sliding window of unacknowledged chunks, retransmission on
// checksum mismatch, and resumption when the receiver redials after a
// disconnect. Receiver side: per-chunk verification, in-place writes,
// whole-file verification, and redial-with-resume.
//
// Both sides keep their per-file state outside the link, so a new link picks
// up exactly where the old one stopped.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::code::TransferCode;
use crate::link::Connection;
use crate::progress::{
    run_aggregator, transfer_event_channel, ProgressAggregator, TransferEvent, TransferEventSender,
};
use crate::protocol::{checksum, AckStatus, Frame, Header, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
use crate::rendezvous::{Rendezvous, RendezvousPath};
use crate::scan::{Manifest, ScannedFile};
use crate::session::{Session, SessionState, Severity, StopActor};
use crate::store::{IncomingStore, Verification};
use crate::types::{
    chunk_count, EngineConfig, FileDescriptor, Role, SessionId, ShuttleError, ShuttleResult,
};
use tokio_util::sync::CancellationToken;

/// Flow-control and timing knobs shared by both sides
#[derive(Debug, Clone)]
pub struct TransferTuning {
    pub chunk_size: usize,
    pub window: usize,
    pub max_chunk_attempts: u32,
    pub ack_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_window: Duration,
}

impl From<&EngineConfig> for TransferTuning {
    fn from(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            window: config.window,
            max_chunk_attempts: config.max_chunk_attempts,
            ack_timeout: config.ack_timeout,
            handshake_timeout: config.handshake_timeout,
            reconnect_window: config.reconnect_window,
        }
    }
}

/// A receiver link whose hello has been read, routed to its sending session
pub struct IncomingLink {
    pub conn: Connection,
    pub resume: Option<SessionId>,
}

pub type LinkSender = mpsc::Sender<IncomingLink>;
pub type LinkReceiver = mpsc::Receiver<IncomingLink>;

/// What a receiver announced in its first frame
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub code: String,
    pub resume: Option<SessionId>,
}

/// Read and check the receiver's hello on a freshly accepted link
pub async fn read_hello(conn: &mut Connection, timeout: Duration) -> ShuttleResult<Hello> {
    match conn.recv_header(timeout).await? {
        Header::Hello {
            protocol_version,
            code,
            role,
            resume_session,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ShuttleError::Protocol(format!(
                    "peer speaks protocol {}, expected {}",
                    protocol_version, PROTOCOL_VERSION
                )));
            }
            if role != Role::Receiver {
                return Err(ShuttleError::Protocol(
                    "only receivers may open a transfer link".to_string(),
                ));
            }
            Ok(Hello {
                code,
                resume: resume_session,
            })
        }
        other => Err(ShuttleError::Protocol(format!(
            "expected hello, got {}",
            other.kind()
        ))),
    }
}

/// Opens a link to the sender holding a code
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        code: &TransferCode,
        cancel: &CancellationToken,
    ) -> ShuttleResult<Connection>;
}

/// Direct discovery with relay fallback
pub struct RendezvousDialer {
    plan: Rendezvous,
}

impl RendezvousDialer {
    pub fn new(plan: Rendezvous) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl Dialer for RendezvousDialer {
    async fn dial(
        &self,
        code: &TransferCode,
        cancel: &CancellationToken,
    ) -> ShuttleResult<Connection> {
        let (conn, path) = self.plan.connect(code, cancel).await?;
        match path {
            RendezvousPath::Direct => tracing::info!("Connected directly to {}", conn.peer()),
            RendezvousPath::Relay => tracing::info!("Connected through {}", conn.peer()),
        }
        Ok(conn)
    }
}

/// Errors after which the peer is told the session is dead
fn needs_abort(err: &ShuttleError) -> bool {
    matches!(
        err,
        ShuttleError::UnrecoverableTransferError(_)
            | ShuttleError::Protocol(_)
            | ShuttleError::FileIo(_)
    )
}

fn stopped(actor: StopActor) -> ShuttleError {
    ShuttleError::Stopped(actor.to_string())
}

/// Budget for frames sent on the way out (cancel, abort, reject)
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(2);

/// Send a frame unless the session is stopped first or the peer stops reading
async fn send_guarded(
    link: &mut Connection,
    frame: impl Into<Frame>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> ShuttleResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(stopped(StopActor::LocalUser)),
        sent = link.send_timeout(frame, timeout) => sent,
    }
}

/// Drive a session to its terminal state from a transfer task's result
pub fn settle(session: &Session, result: ShuttleResult<()>, success: &str) {
    match result {
        Ok(()) => {
            session.transition(SessionState::Complete, success);
        }
        Err(ShuttleError::Stopped(actor)) => {
            let actor = if actor == StopActor::RemotePeer.to_string() {
                StopActor::RemotePeer
            } else {
                StopActor::LocalUser
            };
            session.stop(actor);
        }
        Err(e) => {
            session.fail(&e);
        }
    }
}

fn spawn_progress(session: &Arc<Session>, total_bytes: u64) -> (TransferEventSender, JoinHandle<()>) {
    let (events, events_rx) = transfer_event_channel();
    let publisher = session.clone();
    let task = tokio::spawn(run_aggregator(
        ProgressAggregator::new(total_bytes),
        events_rx,
        move |snapshot| publisher.publish_progress(snapshot),
    ));
    (events, task)
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Everything a sending session needs
pub struct SendJob {
    pub session: Arc<Session>,
    pub manifest: Manifest,
    pub device_name: String,
    pub tuning: TransferTuning,
    pub links: LinkReceiver,
}

/// Serve `job.manifest` to the receiver that shows up on `job.links`.
///
/// The session must already be `Connecting`. Returns when every file has
/// been verified by the receiver, or with the error that ended the session.
pub async fn run_sender(job: SendJob) -> ShuttleResult<()> {
    let SendJob {
        session,
        manifest,
        device_name,
        tuning,
        mut links,
    } = job;

    let (events, progress) = spawn_progress(&session, manifest.total_bytes());
    let mut transfer = OutgoingTransfer::new(session, manifest, device_name, tuning, events);
    let result = transfer.run(&mut links).await;

    drop(transfer);
    let _ = progress.await;
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Chunk { file: u32, chunk: u64, fresh: bool },
    FileComplete { file: u32 },
}

enum PumpExit {
    Finished,
    Superseded(Connection),
}

struct OutgoingFile {
    scanned: ScannedFile,
    handle: Option<File>,
    acked: Vec<bool>,
    acked_count: u64,
    mismatches: HashMap<u64, u32>,
    /// First chunk that has never been sent
    next_fresh: u64,
    hasher: Option<Sha256>,
    content_hash: Option<String>,
    complete_sent: bool,
    verified: bool,
}

impl OutgoingFile {
    fn new(scanned: ScannedFile) -> Self {
        let chunks = scanned.descriptor.chunk_count as usize;
        Self {
            scanned,
            handle: None,
            acked: vec![false; chunks],
            acked_count: 0,
            mismatches: HashMap::new(),
            next_fresh: 0,
            hasher: Some(Sha256::new()),
            content_hash: None,
            complete_sent: false,
            verified: false,
        }
    }

    fn chunk_count(&self) -> u64 {
        self.scanned.descriptor.chunk_count
    }

    fn all_acked(&self) -> bool {
        self.acked_count == self.chunk_count()
    }

    fn content_hash(&mut self) -> String {
        if let Some(hash) = &self.content_hash {
            return hash.clone();
        }
        let hasher = self.hasher.take().unwrap_or_default();
        let hash = hex::encode(hasher.finalize());
        self.content_hash = Some(hash.clone());
        hash
    }
}

struct OutgoingTransfer {
    session: Arc<Session>,
    device_name: String,
    tuning: TransferTuning,
    files: Vec<OutgoingFile>,
    retransmit: VecDeque<(u32, u64)>,
    in_flight: HashSet<(u32, u64)>,
    events: TransferEventSender,
}

impl OutgoingTransfer {
    fn new(
        session: Arc<Session>,
        manifest: Manifest,
        device_name: String,
        tuning: TransferTuning,
        events: TransferEventSender,
    ) -> Self {
        Self {
            session,
            device_name,
            tuning,
            files: manifest.files.into_iter().map(OutgoingFile::new).collect(),
            retransmit: VecDeque::new(),
            in_flight: HashSet::new(),
            events,
        }
    }

    fn descriptors(&self) -> Vec<FileDescriptor> {
        self.files.iter().map(|f| f.scanned.descriptor.clone()).collect()
    }

    fn all_verified(&self) -> bool {
        self.files.iter().all(|f| f.verified)
    }

    fn file_mut(&mut self, file_index: u32) -> ShuttleResult<&mut OutgoingFile> {
        self.files
            .get_mut(file_index as usize)
            .ok_or_else(|| ShuttleError::Protocol(format!("unknown file index {}", file_index)))
    }

    async fn run(&mut self, links: &mut LinkReceiver) -> ShuttleResult<()> {
        let mut link = self.await_first_link(links).await?;

        loop {
            let outcome = match self.welcome(&mut link).await {
                Ok(()) => {
                    if self.session.state() == SessionState::Connecting {
                        self.session.set_peer(Some(link.peer().to_string()));
                        self.session.transition(
                            SessionState::Transferring,
                            format!("Receiver connected from {}", link.peer()),
                        );
                    }
                    self.pump(&mut link, links).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(PumpExit::Finished) => return Ok(()),
                Ok(PumpExit::Superseded(conn)) => {
                    self.requeue();
                    self.session.log(
                        Severity::Info,
                        format!("Receiver reconnected from {}, resuming", conn.peer()),
                    );
                    link = conn;
                }
                Err(ShuttleError::TransportDisconnected(reason))
                    if self.session.state() == SessionState::Connecting =>
                {
                    // The receiver never learned our session id, so it cannot resume.
                    self.session.log(
                        Severity::Error,
                        format!("Receiver dropped before the handshake finished ({})", reason),
                    );
                    link = self.await_first_link(links).await?;
                }
                Err(ShuttleError::TransportDisconnected(reason)) => {
                    self.session.log(
                        Severity::Error,
                        format!(
                            "Connection lost ({}), waiting for the receiver to reconnect",
                            reason
                        ),
                    );
                    self.requeue();
                    link = self.await_resume(links).await?;
                    self.session.log(
                        Severity::Info,
                        format!("Receiver reconnected from {}, resuming", link.peer()),
                    );
                }
                Err(e) => {
                    if needs_abort(&e) {
                        let _ = link
                            .send_timeout(
                                Header::Abort {
                                    reason: e.to_string(),
                                },
                                FAREWELL_TIMEOUT,
                            )
                            .await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn await_first_link(&self, links: &mut LinkReceiver) -> ShuttleResult<Connection> {
        let cancel = self.session.cancellation().clone();
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => return Err(stopped(StopActor::LocalUser)),
                incoming = links.recv() => incoming,
            };
            let Some(incoming) = incoming else {
                return Err(stopped(StopActor::LocalUser));
            };
            match incoming.resume {
                None => return Ok(incoming.conn),
                Some(id) if id == self.session.id() => return Ok(incoming.conn),
                Some(_) => reject(incoming.conn, "unknown session").await,
            }
        }
    }

    async fn await_resume(&self, links: &mut LinkReceiver) -> ShuttleResult<Connection> {
        let cancel = self.session.cancellation().clone();
        let deadline = tokio::time::Instant::now() + self.tuning.reconnect_window;
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => return Err(stopped(StopActor::LocalUser)),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ShuttleError::TransportDisconnected(format!(
                        "receiver did not reconnect within {:?}",
                        self.tuning.reconnect_window
                    )));
                }
                incoming = links.recv() => incoming,
            };
            let Some(incoming) = incoming else {
                return Err(stopped(StopActor::LocalUser));
            };
            if let Some(conn) = self.admit_resume(incoming).await {
                return Ok(conn);
            }
        }
    }

    /// Accept a link only if it resumes this session
    async fn admit_resume(&self, incoming: IncomingLink) -> Option<Connection> {
        if incoming.resume == Some(self.session.id()) {
            Some(incoming.conn)
        } else {
            reject(incoming.conn, "transfer already in progress").await;
            None
        }
    }

    async fn welcome(&self, link: &mut Connection) -> ShuttleResult<()> {
        let welcome = Header::Welcome {
            session_id: self.session.id(),
            sender_name: self.device_name.clone(),
            chunk_size: self.tuning.chunk_size,
            files: self.descriptors(),
        };
        send_guarded(
            link,
            welcome,
            self.session.cancellation(),
            self.tuning.handshake_timeout,
        )
        .await
    }

    /// Put everything unconfirmed by the old link back in line
    fn requeue(&mut self) {
        let mut pending: Vec<(u32, u64)> = self.in_flight.drain().collect();
        pending.sort_unstable();
        for key in pending.into_iter().rev() {
            self.retransmit.push_front(key);
        }
        for file in &mut self.files {
            if !file.verified {
                file.complete_sent = false;
            }
        }
    }

    fn next_action(&mut self) -> Option<Next> {
        while let Some((file, chunk)) = self.retransmit.pop_front() {
            let acked = self
                .files
                .get(file as usize)
                .is_some_and(|f| f.acked[chunk as usize]);
            if !acked {
                return Some(Next::Chunk {
                    file,
                    chunk,
                    fresh: false,
                });
            }
        }

        for (index, file) in self.files.iter_mut().enumerate() {
            if file.verified {
                continue;
            }
            if file.next_fresh < file.chunk_count() {
                let chunk = file.next_fresh;
                file.next_fresh += 1;
                return Some(Next::Chunk {
                    file: index as u32,
                    chunk,
                    fresh: true,
                });
            }
            if file.all_acked() && !file.complete_sent {
                file.complete_sent = true;
                return Some(Next::FileComplete { file: index as u32 });
            }
        }
        None
    }

    async fn read_chunk(&mut self, file_index: u32, chunk_index: u64, fresh: bool) -> ShuttleResult<Frame> {
        let chunk_size = self.tuning.chunk_size;
        let file = self.file_mut(file_index)?;
        let path = file.scanned.path.clone();

        if file.handle.is_none() {
            let opened = File::open(&path)
                .await
                .map_err(|e| ShuttleError::FileIo(format!("{}: {}", path.display(), e)))?;
            file.handle = Some(opened);
        }
        let Some(handle) = file.handle.as_mut() else {
            return Err(ShuttleError::FileIo(format!("{} is closed", path.display())));
        };

        let offset = chunk_index * chunk_size as u64;
        let len = file.scanned.descriptor.chunk_len(chunk_index, chunk_size);
        let mut buf = vec![0u8; len];
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.read_exact(&mut buf).await.map_err(|e| {
            ShuttleError::FileIo(format!(
                "{} changed while being sent: {}",
                path.display(),
                e
            ))
        })?;

        if fresh {
            if let Some(hasher) = file.hasher.as_mut() {
                hasher.update(&buf);
            }
        }

        Ok(Frame::chunk(file_index, chunk_index, offset, Bytes::from(buf)))
    }

    async fn pump(
        &mut self,
        link: &mut Connection,
        links: &mut LinkReceiver,
    ) -> ShuttleResult<PumpExit> {
        let cancel = self.session.cancellation().clone();
        let send_timeout = self.tuning.ack_timeout;

        loop {
            while self.in_flight.len() < self.tuning.window {
                match self.next_action() {
                    Some(Next::Chunk { file, chunk, fresh }) => {
                        let frame = self.read_chunk(file, chunk, fresh).await?;
                        self.in_flight.insert((file, chunk));
                        send_guarded(link, frame, &cancel, send_timeout).await?;
                    }
                    Some(Next::FileComplete { file }) => {
                        let content_hash = self.file_mut(file)?.content_hash();
                        let complete = Header::FileComplete {
                            file_index: file,
                            content_hash,
                        };
                        send_guarded(link, complete, &cancel, send_timeout).await?;
                    }
                    None => break,
                }
            }

            if self.all_verified() {
                send_guarded(link, Header::SessionComplete, &cancel, send_timeout).await?;
                return Ok(PumpExit::Finished);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = link
                        .send_timeout(
                            Header::Cancel {
                                reason: "stopped by sender".to_string(),
                            },
                            FAREWELL_TIMEOUT,
                        )
                        .await;
                    return Err(stopped(StopActor::LocalUser));
                }
                incoming = links.recv() => {
                    let Some(incoming) = incoming else {
                        return Err(stopped(StopActor::LocalUser));
                    };
                    if let Some(conn) = self.admit_resume(incoming).await {
                        return Ok(PumpExit::Superseded(conn));
                    }
                }
                frame = link.recv_timeout(self.tuning.ack_timeout) => {
                    self.handle(frame?.header).await?;
                }
            }
        }
    }

    async fn handle(&mut self, header: Header) -> ShuttleResult<()> {
        match header {
            Header::Ack {
                file_index,
                chunk_index,
                status,
            } => {
                self.in_flight.remove(&(file_index, chunk_index));
                match status {
                    AckStatus::Ok => self.mark_acked(file_index, chunk_index),
                    AckStatus::Mismatch => self.on_mismatch(file_index, chunk_index),
                }
            }
            Header::FileVerified { file_index, ok } => {
                let file = self.file_mut(file_index)?;
                let name = file.scanned.descriptor.name.clone();
                if !ok {
                    return Err(ShuttleError::UnrecoverableTransferError(format!(
                        "receiver could not verify {}",
                        name
                    )));
                }
                if file.verified {
                    return Ok(());
                }
                file.verified = true;
                file.handle = None;
                let hash = file.content_hash();

                self.session.set_content_hash(file_index as usize, hash);
                let _ = self.events.send(TransferEvent::FileVerified { file_index });
                self.session
                    .log(Severity::Info, format!("{} delivered and verified", name));
                Ok(())
            }
            Header::Cancel { reason } => {
                tracing::info!("Receiver cancelled: {}", reason);
                Err(stopped(StopActor::RemotePeer))
            }
            Header::Abort { reason } => Err(ShuttleError::UnrecoverableTransferError(format!(
                "receiver aborted: {}",
                reason
            ))),
            other => Err(ShuttleError::Protocol(format!(
                "unexpected {} from receiver",
                other.kind()
            ))),
        }
    }

    fn mark_acked(&mut self, file_index: u32, chunk_index: u64) -> ShuttleResult<()> {
        let chunk_size = self.tuning.chunk_size;
        let file = self.file_mut(file_index)?;
        let Some(slot) = file.acked.get_mut(chunk_index as usize) else {
            return Err(ShuttleError::Protocol(format!(
                "ack for unknown chunk {} of file {}",
                chunk_index, file_index
            )));
        };
        if *slot {
            return Ok(());
        }
        *slot = true;
        file.acked_count += 1;

        let bytes = file.scanned.descriptor.chunk_len(chunk_index, chunk_size) as u64;
        let _ = self.events.send(TransferEvent::ChunkAcknowledged {
            file_index,
            chunk_index,
            bytes,
        });
        Ok(())
    }

    fn on_mismatch(&mut self, file_index: u32, chunk_index: u64) -> ShuttleResult<()> {
        let max_attempts = self.tuning.max_chunk_attempts;
        let file = self.file_mut(file_index)?;
        if chunk_index >= file.chunk_count() {
            return Err(ShuttleError::Protocol(format!(
                "mismatch for unknown chunk {} of file {}",
                chunk_index, file_index
            )));
        }

        let name = file.scanned.descriptor.name.clone();
        let failures = file.mismatches.entry(chunk_index).or_insert(0);
        *failures += 1;
        let failures = *failures;

        if failures >= max_attempts {
            return Err(ShuttleError::UnrecoverableTransferError(format!(
                "chunk {} of {} failed verification {} times",
                chunk_index, name, failures
            )));
        }

        let err = ShuttleError::ChecksumMismatch {
            file_index,
            chunk_index,
        };
        self.session.log(
            Severity::Error,
            format!(
                "{} ({}), retransmitting (attempt {} of {})",
                err,
                name,
                failures + 1,
                max_attempts
            ),
        );
        self.retransmit.push_back((file_index, chunk_index));
        Ok(())
    }
}

pub(crate) async fn reject(mut conn: Connection, reason: &str) {
    tracing::warn!("Rejecting link from {}: {}", conn.peer(), reason);
    let _ = conn
        .send_timeout(
            Header::Reject {
                reason: reason.to_string(),
            },
            FAREWELL_TIMEOUT,
        )
        .await;
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Everything a receiving session needs
pub struct ReceiveJob {
    pub session: Arc<Session>,
    pub code: TransferCode,
    pub dialer: Arc<dyn Dialer>,
    pub download_dir: PathBuf,
    pub tuning: TransferTuning,
}

struct Welcome {
    session_id: SessionId,
    sender_name: String,
    chunk_size: usize,
    files: Vec<FileDescriptor>,
}

/// Find the sender for `job.code`, then receive and verify every file.
///
/// The session must already be `Connecting`. Part files are removed when the
/// session fails.
pub async fn run_receiver(job: ReceiveJob) -> ShuttleResult<()> {
    let ReceiveJob {
        session,
        code,
        dialer,
        download_dir,
        tuning,
    } = job;

    let incoming = IncomingTransfer {
        session: session.clone(),
        code,
        dialer,
        tuning,
    };

    let (mut conn, welcome) = incoming.open_link(None).await?;
    let sender_id = welcome.session_id;
    let total_bytes: u64 = welcome.files.iter().map(|f| f.size_bytes).sum();

    session.set_peer(Some(format!("{} ({})", welcome.sender_name, conn.peer())));
    session.set_files(welcome.files.clone())?;

    let mut store = IncomingStore::prepare(
        &download_dir,
        &welcome.files,
        welcome.chunk_size,
        session.id(),
    )
    .await?;

    let (events, progress) = spawn_progress(&session, total_bytes);
    session.transition(
        SessionState::Transferring,
        format!(
            "Receiving {} file(s), {} bytes from {}",
            welcome.files.len(),
            total_bytes,
            welcome.sender_name
        ),
    );

    let result = loop {
        match incoming.pump(&mut conn, &mut store, &events).await {
            Ok(()) => break Ok(()),
            Err(ShuttleError::TransportDisconnected(reason)) => {
                session.log(
                    Severity::Error,
                    format!("Connection lost ({}), reconnecting", reason),
                );
                match incoming.open_link(Some(sender_id)).await {
                    Ok((resumed, w)) if w.session_id == sender_id => {
                        session.log(
                            Severity::Info,
                            format!("Reconnected to {}, resuming", resumed.peer()),
                        );
                        conn = resumed;
                    }
                    Ok(_) => {
                        break Err(ShuttleError::Protocol(
                            "sender answered the resume with a different session".to_string(),
                        ))
                    }
                    Err(e @ ShuttleError::Stopped(_)) => break Err(e),
                    Err(e) => {
                        break Err(ShuttleError::TransportDisconnected(format!(
                            "{}; reconnect failed: {}",
                            reason, e
                        )))
                    }
                }
            }
            Err(e) => {
                if needs_abort(&e) {
                    let _ = conn
                        .send_timeout(
                            Header::Abort {
                                reason: e.to_string(),
                            },
                            FAREWELL_TIMEOUT,
                        )
                        .await;
                }
                break Err(e);
            }
        }
    };

    // A stopped session keeps its part files; a failed one is unusable.
    if matches!(&result, Err(e) if !matches!(e, ShuttleError::Stopped(_))) {
        store.discard().await;
    }
    drop(events);
    let _ = progress.await;
    result
}

struct IncomingTransfer {
    session: Arc<Session>,
    code: TransferCode,
    dialer: Arc<dyn Dialer>,
    tuning: TransferTuning,
}

impl IncomingTransfer {
    async fn open_link(&self, resume: Option<SessionId>) -> ShuttleResult<(Connection, Welcome)> {
        let cancel = self.session.cancellation().clone();
        let mut conn = self.dialer.dial(&self.code, &cancel).await?;

        let hello = Header::Hello {
            protocol_version: PROTOCOL_VERSION,
            code: self.code.to_string(),
            role: Role::Receiver,
            resume_session: resume,
        };
        send_guarded(&mut conn, hello, &cancel, self.tuning.handshake_timeout).await?;

        let header = tokio::select! {
            _ = cancel.cancelled() => return Err(stopped(StopActor::LocalUser)),
            header = conn.recv_header(self.tuning.handshake_timeout) => header?,
        };

        match header {
            Header::Welcome {
                session_id,
                sender_name,
                chunk_size,
                files,
            } => {
                check_manifest(chunk_size, &files)?;
                Ok((
                    conn,
                    Welcome {
                        session_id,
                        sender_name,
                        chunk_size,
                        files,
                    },
                ))
            }
            Header::Reject { reason } => Err(ShuttleError::ConnectFailed(reason)),
            other => Err(ShuttleError::Protocol(format!(
                "expected welcome, got {}",
                other.kind()
            ))),
        }
    }

    async fn pump(
        &self,
        conn: &mut Connection,
        store: &mut IncomingStore,
        events: &TransferEventSender,
    ) -> ShuttleResult<()> {
        let cancel = self.session.cancellation().clone();
        let send_timeout = self.tuning.ack_timeout;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = conn
                        .send_timeout(
                            Header::Cancel {
                                reason: "stopped by receiver".to_string(),
                            },
                            FAREWELL_TIMEOUT,
                        )
                        .await;
                    return Err(stopped(StopActor::LocalUser));
                }
                frame = conn.recv_timeout(self.tuning.ack_timeout) => frame?,
            };

            match frame.header {
                Header::Chunk {
                    file_index,
                    chunk_index,
                    byte_offset,
                    length,
                    checksum: expected,
                } => {
                    store.check_chunk(file_index, chunk_index, byte_offset, length)?;

                    let status = if checksum(&frame.payload) != expected {
                        let err = ShuttleError::ChecksumMismatch {
                            file_index,
                            chunk_index,
                        };
                        self.session
                            .log(Severity::Error, format!("{}, requesting it again", err));
                        AckStatus::Mismatch
                    } else {
                        let fresh = store
                            .write_chunk(file_index, chunk_index, byte_offset, &frame.payload)
                            .await?;
                        if fresh {
                            let _ = events.send(TransferEvent::ChunkAcknowledged {
                                file_index,
                                chunk_index,
                                bytes: length as u64,
                            });
                        }
                        AckStatus::Ok
                    };

                    let ack = Header::Ack {
                        file_index,
                        chunk_index,
                        status,
                    };
                    send_guarded(conn, ack, &cancel, send_timeout).await?;
                }
                Header::FileComplete {
                    file_index,
                    content_hash,
                } => {
                    let name = self
                        .session
                        .files()
                        .get(file_index as usize)
                        .map(|f| f.name.clone())
                        .unwrap_or_else(|| format!("file {}", file_index));
                    let first_time = !store.is_finished(file_index);

                    match store.finish_file(file_index, &content_hash).await? {
                        Verification::Verified(path) => {
                            if first_time {
                                self.session
                                    .set_content_hash(file_index as usize, content_hash);
                                let _ = events.send(TransferEvent::FileVerified { file_index });
                                self.session.log(
                                    Severity::Info,
                                    format!("Received {} as {}", name, path.display()),
                                );
                            }
                            let verified = Header::FileVerified {
                                file_index,
                                ok: true,
                            };
                            send_guarded(conn, verified, &cancel, send_timeout).await?;
                        }
                        Verification::Incomplete => {
                            return Err(ShuttleError::Protocol(format!(
                                "sender finished {} before all chunks arrived",
                                name
                            )));
                        }
                        Verification::HashMismatch { actual } => {
                            tracing::warn!(
                                "{} hashed to {}, sender announced {}",
                                name,
                                actual,
                                content_hash
                            );
                            let _ = conn
                                .send_timeout(
                                    Header::FileVerified {
                                        file_index,
                                        ok: false,
                                    },
                                    FAREWELL_TIMEOUT,
                                )
                                .await;
                            return Err(ShuttleError::UnrecoverableTransferError(format!(
                                "{} failed whole-file verification",
                                name
                            )));
                        }
                    }
                }
                Header::SessionComplete => {
                    let files = self.session.files().len() as u32;
                    if let Some(missing) = (0..files).find(|i| !store.is_finished(*i)) {
                        return Err(ShuttleError::Protocol(format!(
                            "sender completed the session without finishing file {}",
                            missing
                        )));
                    }
                    return Ok(());
                }
                Header::Cancel { reason } => {
                    tracing::info!("Sender cancelled: {}", reason);
                    return Err(stopped(StopActor::RemotePeer));
                }
                Header::Abort { reason } => {
                    return Err(ShuttleError::UnrecoverableTransferError(format!(
                        "sender aborted: {}",
                        reason
                    )));
                }
                other => {
                    return Err(ShuttleError::Protocol(format!(
                        "unexpected {} from sender",
                        other.kind()
                    )));
                }
            }
        }
    }
}

/// Most chunks a receiver will track for one session
const MAX_MANIFEST_CHUNKS: u64 = 1 << 24;

fn check_manifest(chunk_size: usize, files: &[FileDescriptor]) -> ShuttleResult<()> {
    if chunk_size == 0 || chunk_size > MAX_PAYLOAD_LEN {
        return Err(ShuttleError::Protocol(format!(
            "sender proposed chunk size {}",
            chunk_size
        )));
    }
    let mut total_chunks = 0u64;
    for file in files {
        if file.chunk_count != chunk_count(file.size_bytes, chunk_size) {
            return Err(ShuttleError::Protocol(format!(
                "manifest entry {} has {} chunks for {} bytes",
                file.name, file.chunk_count, file.size_bytes
            )));
        }
        total_chunks = total_chunks.saturating_add(file.chunk_count);
    }
    if total_chunks > MAX_MANIFEST_CHUNKS {
        return Err(ShuttleError::Protocol(format!(
            "manifest declares {} chunks, more than the {} a session may carry",
            total_chunks, MAX_MANIFEST_CHUNKS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::scan_files;
    use crate::session::SessionEvent;
    use crate::store::hash_file;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    fn tuning() -> TransferTuning {
        TransferTuning {
            chunk_size: 4096,
            window: 4,
            max_chunk_attempts: 3,
            ack_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            reconnect_window: Duration::from_secs(5),
        }
    }

    fn code() -> TransferCode {
        TransferCode::parse("K7WQ3M").unwrap()
    }

    /// Reads at most `remaining` bytes, then reports end of stream
    struct Tripwire {
        inner: DuplexStream,
        remaining: usize,
    }

    impl AsyncRead for Tripwire {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Ok(()));
            }
            let max = buf.remaining().min(self.remaining);
            let mut tmp = vec![0u8; max];
            let mut limited = ReadBuf::new(&mut tmp);
            match Pin::new(&mut self.inner).poll_read(cx, &mut limited) {
                Poll::Ready(Ok(())) => {
                    let n = limited.filled().len();
                    buf.put_slice(&tmp[..n]);
                    self.remaining -= n;
                    Poll::Ready(Ok(()))
                }
                other => other,
            }
        }
    }

    impl AsyncWrite for Tripwire {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Connects the receiver straight to a sender's link queue over an in-memory pipe
    struct PipeDialer {
        links: LinkSender,
        trip_first_after: Option<usize>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for PipeDialer {
        async fn dial(
            &self,
            _code: &TransferCode,
            _cancel: &CancellationToken,
        ) -> ShuttleResult<Connection> {
            let attempt = self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(256 * 1024);
            let links = self.links.clone();
            tokio::spawn(async move {
                let mut conn = Connection::new(far, "receiver");
                if let Ok(hello) = read_hello(&mut conn, Duration::from_secs(5)).await {
                    let _ = links
                        .send(IncomingLink {
                            conn,
                            resume: hello.resume,
                        })
                        .await;
                }
            });

            match (attempt, self.trip_first_after) {
                (0, Some(limit)) => Ok(Connection::new(
                    Tripwire {
                        inner: near,
                        remaining: limit,
                    },
                    "sender",
                )),
                _ => Ok(Connection::new(near, "sender")),
            }
        }
    }

    fn write_file(dir: &std::path::Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn transfer_pair(
        trip_first_after: Option<usize>,
    ) -> (Arc<Session>, Arc<Session>, PathBuf, tempfile::TempDir, tempfile::TempDir) {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = write_file(src.path(), "data.bin", 64 * 1024 + 123);
        let manifest = scan_files(&[&path], tuning().chunk_size).unwrap();

        let sender = Session::new(Role::Sender, Some(code()));
        sender.set_files(manifest.descriptors()).unwrap();
        sender.transition(SessionState::Connecting, "Waiting for receiver");
        let receiver = Session::new(Role::Receiver, Some(code()));
        receiver.transition(SessionState::Connecting, "Looking for sender");

        let (links_tx, links_rx) = mpsc::channel(4);
        let send_task = tokio::spawn(run_sender(SendJob {
            session: sender.clone(),
            manifest,
            device_name: "desk".to_string(),
            tuning: tuning(),
            links: links_rx,
        }));

        let dialer = Arc::new(PipeDialer {
            links: links_tx,
            trip_first_after,
            dials: AtomicUsize::new(0),
        });
        let received = run_receiver(ReceiveJob {
            session: receiver.clone(),
            code: code(),
            dialer,
            download_dir: dst.path().to_path_buf(),
            tuning: tuning(),
        })
        .await;
        settle(&receiver, received, "Transfer complete");

        let sent = send_task.await.unwrap();
        settle(&sender, sent, "Transfer complete");

        (sender, receiver, path, src, dst)
    }

    #[tokio::test]
    async fn test_transfer_over_pipe() {
        let (sender, receiver, source, _src, dst) = transfer_pair(None).await;

        assert_eq!(sender.state(), SessionState::Complete);
        assert_eq!(receiver.state(), SessionState::Complete);

        let copy = dst.path().join("data.bin");
        assert_eq!(
            hash_file(&copy).await.unwrap(),
            hash_file(&source).await.unwrap()
        );
        assert_eq!(receiver.progress().percentage, 100.0);
        assert_eq!(sender.progress().bytes_transferred, 64 * 1024 + 123);
        assert!(sender.files()[0].content_hash.is_some());
        assert_eq!(
            receiver.files()[0].content_hash,
            sender.files()[0].content_hash
        );
    }

    #[tokio::test]
    async fn test_resume_after_disconnect() {
        let (sender, receiver, source, _src, dst) = transfer_pair(Some(30_000)).await;

        assert_eq!(receiver.state(), SessionState::Complete);
        assert_eq!(sender.state(), SessionState::Complete);
        let copy = dst.path().join("data.bin");
        assert_eq!(
            hash_file(&copy).await.unwrap(),
            hash_file(&source).await.unwrap()
        );

        let logs = receiver.logs();
        assert!(logs.iter().any(|l| l.message.starts_with("Connection lost")));
        assert!(logs.iter().any(|l| l.message.starts_with("Reconnected")));
        assert_eq!(receiver.progress().bytes_transferred, 64 * 1024 + 123);
    }

    #[test]
    fn test_requeue_resends_only_unacked_chunks() {
        let src = tempfile::tempdir().unwrap();
        let path = write_file(src.path(), "a.bin", 4 * 4096);
        let manifest = scan_files(&[&path], 4096).unwrap();
        let session = Session::new(Role::Sender, None);
        let (events, _rx) = transfer_event_channel();
        let mut transfer =
            OutgoingTransfer::new(session, manifest, "desk".to_string(), tuning(), events);

        for _ in 0..4 {
            if let Some(Next::Chunk { file, chunk, .. }) = transfer.next_action() {
                transfer.in_flight.insert((file, chunk));
            }
        }
        transfer.in_flight.remove(&(0, 0));
        transfer.mark_acked(0, 0).unwrap();
        transfer.in_flight.remove(&(0, 2));
        transfer.mark_acked(0, 2).unwrap();

        transfer.requeue();
        let mut resent = Vec::new();
        while let Some(Next::Chunk { chunk, fresh, .. }) = transfer.next_action() {
            assert!(!fresh);
            resent.push(chunk);
        }
        assert_eq!(resent, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_repeated_mismatch_fails_once() {
        let src = tempfile::tempdir().unwrap();
        let path = write_file(src.path(), "a.bin", 1000);
        let manifest = scan_files(&[&path], 4096).unwrap();

        let session = Session::new(Role::Sender, Some(code()));
        let failed_logs = Arc::new(parking_lot::Mutex::new(0usize));
        let counter = failed_logs.clone();
        session.subscribe(Arc::new(move |e: &SessionEvent| {
            if let SessionEvent::Log { event } = e {
                if event.message.starts_with("Transfer failed") {
                    *counter.lock() += 1;
                }
            }
        }));
        session.transition(SessionState::Connecting, "Waiting for receiver");

        let (links_tx, links_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_sender(SendJob {
            session: session.clone(),
            manifest,
            device_name: "desk".to_string(),
            tuning: tuning(),
            links: links_rx,
        }));

        let (near, far) = tokio::io::duplex(64 * 1024);
        links_tx
            .send(IncomingLink {
                conn: Connection::new(far, "receiver"),
                resume: None,
            })
            .await
            .unwrap();

        // A receiver whose every chunk check fails.
        let mut peer = Connection::new(near, "sender");
        let mut chunks_seen = 0;
        let abort = loop {
            let header = peer.recv_header(Duration::from_secs(5)).await.unwrap();
            match header {
                Header::Welcome { .. } => {}
                Header::Chunk {
                    file_index,
                    chunk_index,
                    ..
                } => {
                    chunks_seen += 1;
                    peer.send(Header::Ack {
                        file_index,
                        chunk_index,
                        status: AckStatus::Mismatch,
                    })
                    .await
                    .unwrap();
                }
                other => break other,
            }
        };

        assert_eq!(chunks_seen, 3);
        assert!(matches!(abort, Header::Abort { .. }));

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(ShuttleError::UnrecoverableTransferError(_))
        ));
        settle(&session, result, "Transfer complete");
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(*failed_logs.lock(), 1);

        let retry_logs = session
            .logs()
            .iter()
            .filter(|l| l.severity == Severity::Error && l.message.contains("retransmitting"))
            .count();
        assert_eq!(retry_logs, 2);
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_receiver() {
        let src = tempfile::tempdir().unwrap();
        let path = write_file(src.path(), "a.bin", 10);
        let manifest = scan_files(&[&path], 4096).unwrap();
        let session = Session::new(Role::Sender, Some(code()));
        session.transition(SessionState::Connecting, "Waiting for receiver");

        let (_links_tx, links_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_sender(SendJob {
            session: session.clone(),
            manifest,
            device_name: "desk".to_string(),
            tuning: tuning(),
            links: links_rx,
        }));

        session.stop(StopActor::LocalUser);
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ShuttleError::Stopped(_))));
        settle(&session, result, "Transfer complete");
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(
            session
                .logs()
                .iter()
                .filter(|l| l.message.starts_with("Transfer stopped"))
                .count(),
            1
        );
    }

    #[test]
    fn test_manifest_check() {
        let good = vec![FileDescriptor::new("a", 10, 4)];
        assert!(check_manifest(4, &good).is_ok());
        assert!(check_manifest(0, &good).is_err());
        assert!(check_manifest(8, &good).is_err());
    }

    #[test]
    fn test_manifest_with_absurd_size_is_refused() {
        let huge = vec![FileDescriptor::new("huge.bin", u64::MAX / 2, 1)];
        assert!(matches!(
            check_manifest(1, &huge),
            Err(ShuttleError::Protocol(_))
        ));

        // The cap is on the whole session, not per entry.
        let per_file = MAX_MANIFEST_CHUNKS / 2 + 1;
        let split = vec![
            FileDescriptor::new("a.bin", per_file, 1),
            FileDescriptor::new("b.bin", per_file, 1),
        ];
        assert!(check_manifest(1, &split).is_err());

        let fine = vec![FileDescriptor::new("movie.mkv", 40 * 1024 * 1024 * 1024, 1024 * 1024)];
        assert!(check_manifest(1024 * 1024, &fine).is_ok());
    }

    struct SenderUnderTest {
        session: Arc<Session>,
        task: JoinHandle<ShuttleResult<()>>,
        links: LinkSender,
        _src: tempfile::TempDir,
    }

    fn spawn_sender(tuning: TransferTuning) -> SenderUnderTest {
        let src = tempfile::tempdir().unwrap();
        let path = write_file(src.path(), "a.bin", 64 * 1024);
        let manifest = scan_files(&[&path], tuning.chunk_size).unwrap();
        let session = Session::new(Role::Sender, Some(code()));
        session.transition(SessionState::Connecting, "Waiting for receiver");

        let (links_tx, links_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_sender(SendJob {
            session: session.clone(),
            manifest,
            device_name: "desk".to_string(),
            tuning,
            links: links_rx,
        }));

        SenderUnderTest {
            session,
            task,
            links: links_tx,
            _src: src,
        }
    }

    /// Hand the sender a link over a pipe of `capacity` bytes; returns the receiver end
    async fn offer_link(sender: &SenderUnderTest, capacity: usize) -> DuplexStream {
        let (near, far) = tokio::io::duplex(capacity);
        sender
            .links
            .send(IncomingLink {
                conn: Connection::new(far, "receiver"),
                resume: None,
            })
            .await
            .unwrap();
        near
    }

    #[tokio::test]
    async fn test_stop_unblocks_sender_stuck_on_full_link() {
        let sender = spawn_sender(tuning());
        // The receiver end is held open but never read.
        let _near = offer_link(&sender, 1024).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sender.session.state(), SessionState::Transferring);

        sender.session.stop(StopActor::LocalUser);
        let result = tokio::time::timeout(Duration::from_secs(2), sender.task)
            .await
            .expect("sender task ends after stop")
            .unwrap();
        assert!(matches!(result, Err(ShuttleError::Stopped(_))));
    }

    #[tokio::test]
    async fn test_receiver_that_stops_reading_counts_as_disconnect() {
        let tuning = TransferTuning {
            ack_timeout: Duration::from_millis(200),
            reconnect_window: Duration::from_millis(200),
            ..tuning()
        };
        let sender = spawn_sender(tuning);
        let _near = offer_link(&sender, 1024).await;

        let result = tokio::time::timeout(Duration::from_secs(3), sender.task)
            .await
            .expect("sender task gives up on a stalled receiver")
            .unwrap();
        assert!(matches!(result, Err(ShuttleError::TransportDisconnected(_))));
        assert!(sender
            .session
            .logs()
            .iter()
            .any(|l| l.message.starts_with("Connection lost")));
    }

    #[tokio::test]
    async fn test_transferring_only_after_welcome_is_sent() {
        let sender = spawn_sender(tuning());
        // The receiver hangs up before the welcome can be written.
        let (near, far) = tokio::io::duplex(64 * 1024);
        drop(near);
        sender
            .links
            .send(IncomingLink {
                conn: Connection::new(far, "receiver"),
                resume: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sender.session.state(), SessionState::Connecting);
        assert!(sender
            .session
            .logs()
            .iter()
            .any(|l| l.message.starts_with("Receiver dropped before the handshake")));

        sender.session.stop(StopActor::LocalUser);
        let result = sender.task.await.unwrap();
        assert!(matches!(result, Err(ShuttleError::Stopped(_))));
    }
}
