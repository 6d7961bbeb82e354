//! Peer identities and parsed noderefs.
//!
//! Peers are owned by the external peer set; the announcement engine only
//! sees shared handles carrying the identity, the keyspace location, and a
//! connection flag the transport keeps current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::location::Location;

/// 32-byte peer identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> PeerId {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// A peer as the announcement engine sees it. The peer set owns the
/// canonical record; sessions hold `Arc<Peer>` handles and never mutate
/// anything but observe `connected`.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    location: Location,
    connected: AtomicBool,
}

impl Peer {
    pub fn new(id: PeerId, location: Location) -> Arc<Peer> {
        Arc::new(Peer {
            id,
            location,
            connected: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Called by the transport when the link goes up or down.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// Structured form of a validated noderef. Produced only by the external
/// validator; the engine never parses blobs itself.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedNoderef {
    pub id: PeerId,
    pub location: Location,
}
