//! Announcement wire protocol messages.
//!
//! Every message carries the session `uid` that demultiplexes it to the
//! right announcement; the body says what happened at that hop. Messages
//! are serialized with bincode under a hard size limit.
//!
//! ## Message flow per hop
//!
//! | Direction | Messages |
//! |-----------|----------|
//! | request | `AnnouncementRequest` + noderef bulk transfer |
//! | admission | `Accepted`, `RejectedLoop`, `RejectedOverload`, `OpennetDisabled` |
//! | body | `AnnounceReply` (+ bulk transfer), `AnnounceCompleted`, `RouteNotFound`, `NodeNotWanted`, `NoderefRejected` |
//!
//! Bulk noderef payloads travel out-of-band, correlated by `transfer_uid`.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Maximum serialized size of a single protocol message. Headers are tiny;
/// anything near this limit is garbage.
pub const MAX_MESSAGE_SIZE: u64 = 4096;

/// Maximum noderef payload we will accept, padded. Real noderefs are a few
/// KiB; this bounds what a malicious peer can make us buffer.
pub const MAX_PADDED_NODEREF: u32 = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(msg)
}

/// Deserialize with the size limit enforced. Use this for anything that
/// came off the wire.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Why a noderef was refused by the remote side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// The blob failed validation.
    Invalid,
    /// The bulk transfer failed almost immediately.
    TransferFailedShortly,
    /// The bulk transfer timed out.
    TransferTimeout,
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectCode::Invalid => write!(f, "invalid noderef"),
            RejectCode::TransferFailedShortly => write!(f, "transfer failed shortly"),
            RejectCode::TransferTimeout => write!(f, "transfer timeout"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// Ask the receiver to route this announcement on. Followed by the
    /// sender's noderef as a bulk transfer under `transfer_uid`.
    AnnouncementRequest {
        htl: u16,
        nearest_location: f64,
        target_location: f64,
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    },
    /// Admission granted; the noderef transfer may complete.
    Accepted,
    /// The receiver has already seen this announcement.
    RejectedLoop,
    /// The receiver (or, when `is_local`, the sender's own node acting on a
    /// fatal timeout) cannot take the request.
    RejectedOverload { is_local: bool },
    /// The receiver does not participate in the opennet.
    OpennetDisabled,
    /// A noderef collected downstream, following as a bulk transfer.
    AnnounceReply {
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    },
    /// The announcement ran out of hops downstream; no more replies except
    /// late stragglers.
    AnnounceCompleted,
    /// The receiver could not route any further with the hops it had left.
    RouteNotFound { htl: u16 },
    /// The announced node was not wanted by a node on the path.
    NodeNotWanted,
    /// The announced noderef was refused.
    NoderefRejected { code: RejectCode },
}

/// Discriminant of [`Body`], used by message filters to express "one of
/// these kinds" without constructing bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AnnouncementRequest,
    Accepted,
    RejectedLoop,
    RejectedOverload,
    OpennetDisabled,
    AnnounceReply,
    AnnounceCompleted,
    RouteNotFound,
    NodeNotWanted,
    NoderefRejected,
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::AnnouncementRequest { .. } => MessageKind::AnnouncementRequest,
            Body::Accepted => MessageKind::Accepted,
            Body::RejectedLoop => MessageKind::RejectedLoop,
            Body::RejectedOverload { .. } => MessageKind::RejectedOverload,
            Body::OpennetDisabled => MessageKind::OpennetDisabled,
            Body::AnnounceReply { .. } => MessageKind::AnnounceReply,
            Body::AnnounceCompleted => MessageKind::AnnounceCompleted,
            Body::RouteNotFound { .. } => MessageKind::RouteNotFound,
            Body::NodeNotWanted => MessageKind::NodeNotWanted,
            Body::NoderefRejected { .. } => MessageKind::NoderefRejected,
        }
    }
}

/// One protocol message: session uid plus body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub uid: u64,
    pub body: Body,
}

impl Message {
    pub fn new(uid: u64, body: Body) -> Message {
        Message { uid, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}
