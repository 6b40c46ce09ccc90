use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a cache entry.
///
/// Only the transitions listed in [`CacheState::can_transition_to`] are
/// legal; attempting any other transition is a programming error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    /// Has un-flushed data. Must not be evicted.
    Pending,
    /// Clean and fully present in the content store, but the backend's
    /// end-of-upload handshake has not run. Evictable unless a streaming
    /// upload is still open.
    Cached,
    /// A flush is in progress. New writes are accepted (and move the entry
    /// back to `Pending`). Must not be evicted.
    Uploading,
    /// Fully durable and finalized in the content store. Evictable.
    Finalized,
}

impl CacheState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: CacheState) -> bool {
        use CacheState::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Uploading, Cached)
                | (Uploading, Pending)
                | (Cached, Finalized)
                | (Cached, Pending)
                | (Finalized, Pending)
        )
    }

    /// Entries in these states hold data the store does not yet have.
    pub fn is_dirty(self) -> bool {
        matches!(self, CacheState::Pending | CacheState::Uploading)
    }

    /// Entries in these states may be dropped under capacity pressure.
    pub fn is_evictable(self) -> bool {
        matches!(self, CacheState::Cached | CacheState::Finalized)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheState::Pending => "pending",
            CacheState::Cached => "cached",
            CacheState::Uploading => "uploading",
            CacheState::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

/// Durability state of a single slice, as persisted in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceState {
    /// Written to the cache, not yet committed to the content store.
    Pending,
    /// Committed to the content store.
    Flushed,
    /// A commit was in flight when the slice was logged.
    Uploading,
}

impl SliceState {
    /// Wire encoding (one byte in the log).
    pub fn to_wire(self) -> u8 {
        match self {
            SliceState::Pending => 0,
            SliceState::Flushed => 1,
            SliceState::Uploading => 2,
        }
    }

    /// Decode from the wire; `None` for unknown values.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(SliceState::Pending),
            1 => Some(SliceState::Flushed),
            2 => Some(SliceState::Uploading),
            _ => None,
        }
    }

    /// Slices in this state still need a flush after recovery.
    pub fn is_dirty(self) -> bool {
        !matches!(self, SliceState::Flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CacheState::*;

    #[test]
    fn legal_transitions() {
        assert!(Pending.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Cached));
        assert!(Uploading.can_transition_to(Pending));
        assert!(Cached.can_transition_to(Finalized));
        assert!(Cached.can_transition_to(Pending));
        assert!(Finalized.can_transition_to(Pending));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!Pending.can_transition_to(Cached));
        assert!(!Pending.can_transition_to(Finalized));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Cached.can_transition_to(Uploading));
        assert!(!Finalized.can_transition_to(Cached));
        assert!(!Uploading.can_transition_to(Finalized));
    }

    #[test]
    fn dirty_and_evictable_are_disjoint() {
        for state in [Pending, Cached, Uploading, Finalized] {
            assert_ne!(state.is_dirty(), state.is_evictable());
        }
    }

    #[test]
    fn slice_state_wire_roundtrip() {
        for s in [SliceState::Pending, SliceState::Flushed, SliceState::Uploading] {
            assert_eq!(SliceState::from_wire(s.to_wire()), Some(s));
        }
        assert_eq!(SliceState::from_wire(3), None);
    }
}
