//! Circular keyspace locations.
//!
//! The keyspace is the unit circle [0.0, 1.0). Distance between two
//! locations is the shorter arc, so the farthest any two locations can be
//! apart is 0.5. Announcement routing greedily minimizes this distance
//! toward a target location.

use serde::{Deserialize, Serialize};

/// A position on the circular keyspace, in [0.0, 1.0).
///
/// The wire form is a raw `f64`; use [`Location::from_wire`] when decoding
/// untrusted input. `-1.0` is the "not yet known" sentinel some messages
/// carry before any node on the path has computed a nearest location.
#[derive(Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Location(f64);

impl Location {
    /// Sentinel for "no location known yet". Valid on the wire, never
    /// produced by routing.
    pub const INVALID: Location = Location(-1.0);

    /// Construct a location, rejecting anything outside [0.0, 1.0).
    pub fn new(value: f64) -> Option<Location> {
        if value.is_finite() && (0.0..1.0).contains(&value) {
            Some(Location(value))
        } else {
            None
        }
    }

    /// Decode a location received from the network. Accepts the invalid
    /// sentinel; everything else must be a valid location.
    pub fn from_wire(value: f64) -> Option<Location> {
        if value == -1.0 {
            Some(Location::INVALID)
        } else {
            Location::new(value)
        }
    }

    pub fn is_valid(&self) -> bool {
        (0.0..1.0).contains(&self.0)
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Shorter-arc distance between two locations.
    ///
    /// Distance from or to the invalid sentinel is the maximum 0.5 plus a
    /// little, so any real location compares closer than "unknown".
    pub fn distance(self, other: Location) -> f64 {
        if !self.is_valid() || !other.is_valid() {
            return 0.51;
        }
        let d = (self.0 - other.0).abs();
        d.min(1.0 - d)
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Location({:.4})", self.0)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}
