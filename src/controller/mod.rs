//! Concurrency Controller: one active generation per session.
//!
//! The controller owns an explicit registry keyed by session id. Each entry
//! holds the generation's cancellation token and the result channels of
//! callers waiting on it. Resolving or rejecting waiters is a broadcast over
//! that list. Permission prompts are serialized per session through a fair
//! async mutex, so they surface one at a time in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusEvent, SessionStatus};
use crate::error::MessageError;
use crate::message::MessageWithParts;

/// Outcome delivered to waiters: the final assistant message, or why there is none.
pub type GenerationResult = std::result::Result<MessageWithParts, MessageError>;

/// Handle for an active generation, returned by [`Controller::start`].
#[derive(Debug, Clone)]
pub struct Generation {
    session_id: String,
    id: u64,
    token: CancellationToken,
}

impl Generation {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Entry {
    generation: u64,
    token: CancellationToken,
    waiters: Vec<oneshot::Sender<GenerationResult>>,
}

impl Entry {
    fn resolve(self, result: &GenerationResult) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
        count
    }
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    permission_chains: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
    bus: Bus,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Controller {
    pub fn new(bus: Bus) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            bus,
        }
    }

    /// Claim the session. Returns `None` when a generation is already active;
    /// the caller should [`wait`](Self::wait) instead of starting a second loop.
    pub fn start(&self, session_id: &str) -> Option<Generation> {
        let generation = {
            let mut entries = lock(&self.inner.entries);
            if entries.contains_key(session_id) {
                return None;
            }
            let generation = Generation {
                session_id: session_id.to_string(),
                id: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
                token: CancellationToken::new(),
            };
            entries.insert(
                session_id.to_string(),
                Entry {
                    generation: generation.id,
                    token: generation.token.clone(),
                    waiters: Vec::new(),
                },
            );
            generation
        };
        tracing::debug!(session_id, generation = generation.id, "generation started");
        self.publish_status(session_id, SessionStatus::Busy);
        Some(generation)
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        lock(&self.inner.entries).contains_key(session_id)
    }

    /// Sessions with an active generation.
    pub fn active_sessions(&self) -> Vec<String> {
        lock(&self.inner.entries).keys().cloned().collect()
    }

    /// Register a waiter on the active generation. `None` when idle.
    pub fn wait(&self, session_id: &str) -> Option<oneshot::Receiver<GenerationResult>> {
        let mut entries = lock(&self.inner.entries);
        let entry = entries.get_mut(session_id)?;
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        Some(rx)
    }

    /// Abort the active generation and reject its waiters. Idempotent: a
    /// session with no active generation is left untouched.
    pub fn cancel(&self, session_id: &str) {
        let Some(entry) = lock(&self.inner.entries).remove(session_id) else {
            return;
        };
        entry.token.cancel();
        let rejected = entry.resolve(&Err(MessageError::aborted()));
        tracing::debug!(session_id, rejected, "generation cancelled");
        self.publish_status(session_id, SessionStatus::Idle);
    }

    /// Release the session and hand `result` to every waiter. Only the
    /// generation that owns the entry can finish it; a generation that was
    /// cancelled (and possibly replaced) is ignored.
    pub fn finish(&self, generation: &Generation, result: GenerationResult) -> bool {
        let entry = {
            let mut entries = lock(&self.inner.entries);
            match entries.get(&generation.session_id) {
                Some(entry) if entry.generation == generation.id => {
                    entries.remove(&generation.session_id)
                }
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        let resolved = entry.resolve(&result);
        tracing::debug!(
            session_id = %generation.session_id,
            generation = generation.id,
            resolved,
            ok = result.is_ok(),
            "generation finished"
        );
        self.publish_status(&generation.session_id, SessionStatus::Idle);
        true
    }

    /// Give back a claim nobody is waiting on. Returns false when the claim
    /// was cancelled or other callers have queued behind it.
    pub fn release(&self, generation: &Generation) -> bool {
        {
            let mut entries = lock(&self.inner.entries);
            match entries.get(&generation.session_id) {
                Some(entry) if entry.generation == generation.id && entry.waiters.is_empty() => {
                    entries.remove(&generation.session_id);
                }
                _ => return false,
            }
        }
        tracing::debug!(session_id = %generation.session_id, generation = generation.id, "generation released");
        self.publish_status(&generation.session_id, SessionStatus::Idle);
        true
    }

    /// Drop all state kept for a deleted session, aborting its generation.
    pub fn forget(&self, session_id: &str) {
        self.cancel(session_id);
        lock(&self.inner.permission_chains).remove(session_id);
    }

    /// Abort every active generation and reject all waiters.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Entry)> = lock(&self.inner.entries).drain().collect();
        for (session_id, entry) in drained {
            entry.token.cancel();
            entry.resolve(&Err(MessageError::aborted()));
            self.publish_status(&session_id, SessionStatus::Idle);
        }
        lock(&self.inner.permission_chains).clear();
    }

    /// Wait for this session's permission-prompt turn. Holding the guard
    /// keeps later prompts for the same session queued behind this one.
    pub async fn permission_turn(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let chain = lock(&self.inner.permission_chains)
            .entry(session_id.to_string())
            .or_default()
            .clone();
        chain.lock_owned().await
    }

    fn publish_status(&self, session_id: &str, status: SessionStatus) {
        self.bus.publish(BusEvent::SessionStatus {
            session_id: session_id.to_string(),
            status,
        });
    }
}
