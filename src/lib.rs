//! # Opennet - Announcement Routing Engine
//!
//! Opennet implements the join protocol of a peer-to-peer anonymity
//! network: a new node propagates its noderef toward a chosen keyspace
//! location, each hop greedily routes it closer, and the noderefs of the
//! peers met along the path flow back to the originator.
//!
//! ## Architecture
//!
//! Each announcement runs as its own **session task**: a long-lived state
//! machine that negotiates admission with one hop at a time, streams the
//! noderef behind the handshake, and backtracks on rejection or timeout.
//! Inbound messages reach sessions through a uid-keyed waiter registry
//! rather than back-pointers, so the transport and the sessions stay
//! decoupled.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `announce` | Per-announcement session state machine |
//! | `filter` | Message pattern disjunctions and the blocking waiter |
//! | `transfer` | Bulk noderef transfers with padding |
//! | `bucket` | Adaptive RAM/disk temp buffer pool |
//! | `messages` | Wire message types (bincode, bounded) |
//! | `location` | Circular keyspace locations and distance |
//! | `peers` | Peer identities and parsed noderefs |
//! | `protocols` | Trait seams to the transport, peer set and policies |
//! | `counter` | Per-session byte accounting |
//!
//! ## Collaboration Model
//!
//! The crate owns routing, negotiation, draining and buffering. The
//! surrounding node supplies the transport, the peer database, noderef
//! verification and the HTL policy through the traits in [`protocols`];
//! tests script those seams directly.

pub mod announce;
pub mod bucket;
pub mod counter;
pub mod filter;
pub mod location;
pub mod messages;
pub mod peers;
pub mod protocols;
pub mod transfer;

pub use announce::{AnnounceContext, AnnounceSender, InboundTransfer, IncomingAnnouncement};
pub use bucket::{PoolConfig, TempBucket, TempBucketPool};
pub use counter::ByteCounter;
pub use filter::{MessageFilter, MessagePattern, MessageWaiter, WaitOutcome};
pub use location::Location;
pub use messages::{Body, Message, MessageKind, RejectCode};
pub use peers::{ParsedNoderef, Peer, PeerId};
pub use protocols::{
    AnnouncementCallback, HtlPolicy, MessageRouter, NoderefValidator, NotConnected, PeerSet,
    SessionRegistry,
};
