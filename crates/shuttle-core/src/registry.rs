// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Pairing code registry
//
// Maps live transfer codes to sender sessions. Every mutation happens under a
// single lock, so two session-initiation requests can never bind one code.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::code::TransferCode;
use crate::types::{SessionId, ShuttleError, ShuttleResult};

/// Fresh codes drawn before giving up on finding an unused one
const MAX_ISSUE_ATTEMPTS: usize = 64;

#[derive(Debug, Clone)]
struct CodeEntry {
    session_id: SessionId,
    expires_at: Instant,
    /// A receiver completed the handshake; the code no longer idles out
    claimed: bool,
}

impl CodeEntry {
    fn is_expired(&self, now: Instant) -> bool {
        !self.claimed && now >= self.expires_at
    }
}

/// Registry of transfer codes bound to sender sessions
pub struct CodeRegistry {
    entries: Mutex<HashMap<TransferCode, CodeEntry>>,
    ttl: Duration,
}

impl CodeRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Mint a code for `session_id` that no live session is using.
    pub fn issue_code(&self, session_id: SessionId) -> ShuttleResult<TransferCode> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let code = TransferCode::generate();
            let taken = entries.get(&code).is_some_and(|e| !e.is_expired(now));
            if taken {
                tracing::debug!("Code collision on {}, regenerating", code);
                continue;
            }

            entries.insert(
                code.clone(),
                CodeEntry {
                    session_id,
                    expires_at: now + self.ttl,
                    claimed: false,
                },
            );
            tracing::info!("Issued transfer code {} for session {}", code, session_id);
            return Ok(code);
        }

        Err(ShuttleError::UnrecoverableTransferError(
            "could not find an unused transfer code".to_string(),
        ))
    }

    /// Check the format of user input, then look up the session it is bound to.
    pub fn validate_and_resolve(&self, input: &str) -> ShuttleResult<SessionId> {
        let code = TransferCode::parse(input)?;
        self.resolve(&code)
    }

    pub fn resolve(&self, code: &TransferCode) -> ShuttleResult<SessionId> {
        let entries = self.entries.lock();
        match entries.get(code) {
            None => Err(ShuttleError::CodeNotFound(code.to_string())),
            Some(entry) if entry.is_expired(Instant::now()) => {
                Err(ShuttleError::CodeExpired(code.to_string()))
            }
            Some(entry) => Ok(entry.session_id),
        }
    }

    /// Find the live code whose public digest matches
    pub fn resolve_digest(&self, digest: &str) -> Option<(TransferCode, SessionId)> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .find(|(code, entry)| !entry.is_expired(now) && code.digest() == digest)
            .map(|(code, entry)| (code.clone(), entry.session_id))
    }

    /// Mark a code as taken by a connected receiver.
    pub fn claim(&self, code: &TransferCode, session_id: SessionId) -> ShuttleResult<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(code) {
            Some(entry) if entry.session_id == session_id => {
                if entry.is_expired(Instant::now()) {
                    return Err(ShuttleError::CodeExpired(code.to_string()));
                }
                entry.claimed = true;
                Ok(())
            }
            _ => Err(ShuttleError::CodeNotFound(code.to_string())),
        }
    }

    /// Free a code once its session is over. Returns whether it was bound.
    ///
    /// The entry is only removed while it still belongs to `session_id`, so a
    /// finished session cannot free a code that was minted again for another.
    pub fn release(&self, code: &TransferCode, session_id: SessionId) -> bool {
        let mut entries = self.entries.lock();
        let removed = match entries.get(code) {
            Some(entry) if entry.session_id == session_id => entries.remove(code).is_some(),
            _ => false,
        };
        if removed {
            tracing::debug!("Released transfer code {}", code);
        }
        removed
    }

    /// Drop idle-expired codes and report which sessions they belonged to.
    pub fn sweep(&self, now: Instant) -> Vec<(TransferCode, SessionId)> {
        let mut expired = Vec::new();
        self.entries.lock().retain(|code, entry| {
            if entry.is_expired(now) {
                expired.push((code.clone(), entry.session_id));
                false
            } else {
                true
            }
        });

        for (code, session_id) in &expired {
            tracing::info!("Transfer code {} for session {} expired", code, session_id);
        }
        expired
    }

    /// Number of codes bound to live sessions
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }
}
