//! Collaborator trait definitions for the announcement engine.
//!
//! The engine drives these seams but does not implement them: the message
//! transport, the peer database, the noderef validator and the HTL policy
//! all live elsewhere in the node. Defining them here keeps the session
//! logic testable against scripted implementations.
//!
//! ## Traits
//!
//! | Concern | Trait |
//! |---------|-------|
//! | Outbound messages + bulk transfer | [`MessageRouter`] |
//! | Peer database & proximity routing | [`PeerSet`] |
//! | Noderef verification | [`NoderefValidator`] |
//! | Hops-to-live policy | [`HtlPolicy`] |
//! | Originator notifications | [`AnnouncementCallback`] |
//! | Per-uid bookkeeping release | [`SessionRegistry`] |

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::counter::ByteCounter;
use crate::location::Location;
use crate::messages::Message;
use crate::peers::{ParsedNoderef, Peer, PeerId};

/// The named peer is not connected. Sends and transfers fail with this;
/// the session reacts by routing elsewhere or terminating, never retrying
/// the same peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotConnected;

impl std::fmt::Display for NotConnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer not connected")
    }
}

impl std::error::Error for NotConnected {}

/// Outbound half of the unreliable message transport, plus the bulk
/// channel noderef payloads travel over.
///
/// Inbound messages do not appear here: the embedding transport feeds them
/// into the [`MessageWaiter`](crate::filter::MessageWaiter) instead.
#[async_trait]
pub trait MessageRouter: Send + Sync + 'static {
    /// Send one protocol message. Bytes actually put on the wire are
    /// reported to `counter`.
    async fn send(
        &self,
        to: &PeerId,
        msg: Message,
        counter: &ByteCounter,
    ) -> Result<(), NotConnected>;

    /// Enqueue a bulk payload for transmission under `transfer_uid`.
    /// Returns as soon as the payload is queued.
    fn queue_bulk(
        &self,
        to: &PeerId,
        transfer_uid: u64,
        data: Vec<u8>,
    ) -> Result<(), NotConnected>;

    /// Block until the payload queued under `transfer_uid` has been fully
    /// drained to the peer.
    async fn flush_bulk(&self, to: &PeerId, transfer_uid: u64) -> Result<(), NotConnected>;

    /// Receive the bulk payload a peer announced under `transfer_uid`.
    /// Returns the padded bytes, or None on transport failure.
    async fn recv_bulk(
        &self,
        from: &PeerId,
        transfer_uid: u64,
        padded_length: u32,
    ) -> Option<Vec<u8>>;
}

/// The peer database: proximity routing and admission of announced nodes.
/// Black box; the only contract on `closer_peer` is determinism for
/// identical inputs.
pub trait PeerSet: Send + Sync + 'static {
    /// The connected peer closest to `target`, excluding `source` and
    /// everything in `exclude`, subject to the provider's own backoff and
    /// admission heuristics. None is a legitimate answer and triggers
    /// backtracking.
    fn closer_peer(
        &self,
        source: Option<&PeerId>,
        exclude: &HashSet<PeerId>,
        target: Location,
    ) -> Option<Arc<Peer>>;

    /// Offer an announced node to the database. Some(peer) if it was
    /// taken, None if not wanted.
    fn add_announced_node(&self, noderef: &ParsedNoderef) -> Option<Arc<Peer>>;
}

/// Cryptographic noderef verification, external to this crate.
pub trait NoderefValidator: Send + Sync + 'static {
    /// Parse and verify a noderef blob. None if it is malformed or the
    /// signature does not check out.
    fn validate(&self, blob: &[u8]) -> Option<ParsedNoderef>;
}

/// Hops-to-live policy. Decrements may be probabilistically refused when
/// htl is at the maximum; that is the provider's business.
pub trait HtlPolicy: Send + Sync + 'static {
    fn max_htl(&self) -> u16;

    fn decrement_htl(&self, source: Option<&PeerId>, htl: u16) -> u16;
}

/// Notifications to a local announcement originator. Never invoked in
/// relay mode; `completed` fires exactly once per session.
pub trait AnnouncementCallback: Send + Sync + 'static {
    /// A reply noderef was accepted into the peer set.
    fn added_node(&self, peer: &Arc<Peer>);
    /// A valid reply noderef was offered but not taken.
    fn node_not_added(&self);
    /// A node on the path did not want us.
    fn node_not_wanted(&self);
    /// A hop failed terminally.
    fn node_failed(&self, peer: &PeerId, reason: &str);
    /// A reply noderef failed validation.
    fn bogus_noderef(&self, reason: &str);
    /// Routing found no peer to try.
    fn no_more_nodes(&self);
    /// The session is over, whatever the outcome.
    fn completed(&self);
}

/// Release of per-uid bookkeeping when a session ends. The embedder uses
/// this to drop demux state for the uid; sessions call it exactly once,
/// from their cleanup path.
pub trait SessionRegistry: Send + Sync + 'static {
    /// The session with this uid has terminated.
    fn session_completed(&self, uid: u64);

    /// Same, scoped to the upstream peer's per-peer tracking. Only called
    /// for sessions that had an upstream source.
    fn peer_session_completed(&self, peer: &PeerId, uid: u64);
}
