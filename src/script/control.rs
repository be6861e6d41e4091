//! Cross-session control events.
//!
//! Every executor subscribes once and receives its own bounded queue.
//! `SCRIPT KILL` and `SCRIPT FLUSH` style requests are broadcast from any
//! thread; executors drain their queue at invocation boundaries and, while a
//! script is over its time limit, at every hook firing.

use crate::host::SessionId;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which running script a kill request applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    /// Whatever script is running.
    All,
    /// Only the script whose SHA1 digest is this 40-character hex string.
    Function(String),
}

impl KillTarget {
    /// Parses a kill target; `all` is matched case-insensitively.
    pub fn parse(target: &str) -> Self {
        if target.eq_ignore_ascii_case("all") {
            KillTarget::All
        } else {
            KillTarget::Function(target.to_ascii_lowercase())
        }
    }

    /// Returns true if a script running under `digest` should be killed.
    pub fn matches(&self, digest: &str) -> bool {
        match self {
            KillTarget::All => true,
            KillTarget::Function(target) => target.eq_ignore_ascii_case(digest),
        }
    }
}

/// An event delivered to every subscribed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Abort the matching running script.
    Kill(KillTarget),
    /// The script store was flushed by `origin`; rebuild the sandbox.
    Flush {
        /// Session that requested the flush.
        origin: SessionId,
    },
}

/// A session's receiving end of the control hub.
#[derive(Debug)]
pub struct Subscription {
    id: SessionId,
    receiver: Receiver<ControlEvent>,
}

impl Subscription {
    /// Session id assigned at subscription.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Takes every queued event without blocking.
    pub fn drain(&self) -> Vec<ControlEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Broadcast hub for control events, shared by all sessions.
#[derive(Debug, Default)]
pub struct ScriptControl {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SessionId, Sender<ControlEvent>)>>,
}

impl ScriptControl {
    /// Creates a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session with a queue holding up to `capacity` events.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = channel::bounded(capacity);
        self.subscribers.lock().push((id, sender));
        Subscription { id, receiver }
    }

    /// Number of registered subscriptions. Dropped ones are only pruned by
    /// the next broadcast.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Asks every session to kill its running script if it matches `target`.
    ///
    /// Returns how many sessions the request was delivered to.
    pub fn request_kill(&self, target: &str) -> usize {
        let target = KillTarget::parse(target);
        log::info!("Script kill requested: {:?}", target);
        self.broadcast(ControlEvent::Kill(target), None)
    }

    /// Tells every session except `origin` that the store was flushed.
    pub fn request_flush(&self, origin: SessionId) -> usize {
        log::info!("Script flush requested by session {}", origin);
        self.broadcast(ControlEvent::Flush { origin }, Some(origin))
    }

    fn broadcast(&self, event: ControlEvent, skip: Option<SessionId>) -> usize {
        let mut delivered = 0;
        self.subscribers.lock().retain(|(id, sender)| {
            if Some(*id) == skip {
                return true;
            }
            match sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!("Control queue of session {} is full, dropping {:?}", id, event);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        delivered
    }
}
