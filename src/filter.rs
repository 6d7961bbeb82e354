//! Message filters and the blocking waiter.
//!
//! A session expresses what it is prepared to receive next as a
//! disjunction of patterns: message kind, source peer, session uid, and a
//! per-pattern timeout. The [`MessageWaiter`] is the demux registry the
//! embedding transport feeds inbound messages and disconnect events into;
//! a parked [`wait_for`](MessageWaiter::wait_for) resolves with the first
//! matching message, with a timeout once every pattern's deadline has
//! passed, or with a disconnect from any peer a pattern names.
//!
//! Deadlines are normally anchored at the start of the wait. A pattern
//! built with [`MessagePattern::timeout_relative_to_creation`] anchors at
//! filter construction instead, which is how the reply drain enforces one
//! 30-second wall-clock cap across several successive waits on the same
//! filter.

use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace};

use crate::counter::ByteCounter;
use crate::messages::{self, Message, MessageKind};
use crate::peers::PeerId;

/// One alternative in a filter disjunction.
#[derive(Clone, Debug)]
pub struct MessagePattern {
    kind: MessageKind,
    source: PeerId,
    uid: u64,
    timeout: Duration,
    relative_to_creation: bool,
}

impl MessagePattern {
    pub fn new(kind: MessageKind, source: PeerId, uid: u64, timeout: Duration) -> MessagePattern {
        MessagePattern {
            kind,
            source,
            uid,
            timeout,
            relative_to_creation: false,
        }
    }

    /// Anchor this pattern's deadline at filter construction instead of at
    /// the start of each wait.
    pub fn timeout_relative_to_creation(mut self) -> MessagePattern {
        self.relative_to_creation = true;
        self
    }

    fn matches(&self, from: &PeerId, msg: &Message) -> bool {
        msg.kind() == self.kind && msg.uid == self.uid && from == &self.source
    }
}

/// A non-empty disjunction of patterns plus its creation time.
#[derive(Clone, Debug)]
pub struct MessageFilter {
    patterns: Vec<MessagePattern>,
    created: Instant,
}

impl MessageFilter {
    /// Build a filter from at least one pattern.
    pub fn any(patterns: Vec<MessagePattern>) -> MessageFilter {
        assert!(!patterns.is_empty(), "a filter needs at least one pattern");
        MessageFilter {
            patterns,
            created: Instant::now(),
        }
    }

    fn deadlines(&self, wait_start: Instant) -> Vec<Instant> {
        self.patterns
            .iter()
            .map(|p| {
                let anchor = if p.relative_to_creation {
                    self.created
                } else {
                    wait_start
                };
                anchor + p.timeout
            })
            .collect()
    }
}

/// What a wait resolved to.
#[derive(Debug)]
pub enum WaitOutcome {
    /// Exactly one message matched; it is consumed.
    Matched(Message),
    /// Every pattern's deadline elapsed without a match.
    TimedOut,
    /// A peer named by some pattern disconnected.
    Disconnected(PeerId),
}

struct PendingWait {
    id: u64,
    /// Patterns paired with their absolute deadlines for this wait.
    armed: Vec<(MessagePattern, Instant)>,
    tx: oneshot::Sender<WaitOutcome>,
}

#[derive(Default)]
struct WaiterInner {
    waits: Vec<PendingWait>,
    next_id: u64,
}

/// The uid demux registry. The embedding transport calls
/// [`dispatch`](MessageWaiter::dispatch) for every inbound announcement
/// message and [`disconnected`](MessageWaiter::disconnected) when a peer
/// drops; sessions park in [`wait_for`](MessageWaiter::wait_for).
#[derive(Default)]
pub struct MessageWaiter {
    inner: Mutex<WaiterInner>,
}

impl MessageWaiter {
    pub fn new() -> MessageWaiter {
        MessageWaiter::default()
    }

    /// Offer an inbound message. At most one parked wait with a live
    /// matching pattern consumes it; returns false if nothing claimed it.
    pub fn dispatch(&self, from: PeerId, msg: Message) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("waiter poisoned");
        let pos = inner.waits.iter().position(|w| {
            w.armed
                .iter()
                .any(|(p, deadline)| *deadline > now && p.matches(&from, &msg))
        });
        match pos {
            Some(i) => {
                let wait = inner.waits.swap_remove(i);
                trace!(uid = msg.uid, kind = ?msg.kind(), from = %from, "matched inbound message");
                // The receiver only disappears on a timeout race; the
                // message is dropped then, same as arriving a tick later.
                let _ = wait.tx.send(WaitOutcome::Matched(msg));
                true
            }
            None => {
                debug!(uid = msg.uid, kind = ?msg.kind(), from = %from, "unclaimed inbound message");
                false
            }
        }
    }

    /// A peer dropped. Every wait naming it in any pattern aborts.
    pub fn disconnected(&self, peer: PeerId) {
        let mut inner = self.inner.lock().expect("waiter poisoned");
        let mut i = 0;
        while i < inner.waits.len() {
            if inner.waits[i].armed.iter().any(|(p, _)| p.source == peer) {
                let wait = inner.waits.swap_remove(i);
                let _ = wait.tx.send(WaitOutcome::Disconnected(peer));
            } else {
                i += 1;
            }
        }
    }

    /// Park until one pattern matches, all deadlines pass, or a named peer
    /// disconnects. The matched message's wire size is reported to
    /// `counter` as received bytes.
    pub async fn wait_for(&self, filter: &MessageFilter, counter: &ByteCounter) -> WaitOutcome {
        let wait_start = Instant::now();
        let deadlines = filter.deadlines(wait_start);
        let overall = *deadlines
            .iter()
            .max()
            .expect("filter has at least one pattern");
        if overall <= wait_start {
            return WaitOutcome::TimedOut;
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.inner.lock().expect("waiter poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            inner.waits.push(PendingWait {
                id,
                armed: filter.patterns.iter().cloned().zip(deadlines).collect(),
                tx,
            });
            id
        };

        tokio::select! {
            outcome = rx => {
                match outcome.expect("waiter dropped a pending send") {
                    WaitOutcome::Matched(msg) => {
                        if let Ok(bytes) = messages::encode(&msg) {
                            counter.received_bytes(bytes.len());
                        }
                        WaitOutcome::Matched(msg)
                    }
                    other => other,
                }
            }
            _ = sleep_until(overall) => {
                let mut inner = self.inner.lock().expect("waiter poisoned");
                if let Some(i) = inner.waits.iter().position(|w| w.id == id) {
                    inner.waits.swap_remove(i);
                }
                WaitOutcome::TimedOut
            }
        }
    }
}
