//! Call identifiers and the relay's fake-id pools.
//!
//! Caller-side fake ids are odd and callee-side fake ids are even. Both pools
//! only move forward and never wrap, so a fake id identifies exactly one
//! (link, direction) pair for the lifetime of the process.

use crate::error::{ProxyError, ProxyResult};

/// A PPTP call id. Only the low 16 bits travel on the wire.
pub type CallId = u32;

/// Marker for an id that has not been observed yet.
pub const UNSET_CALL_ID: CallId = u32::MAX;

/// Largest id that fits the 16-bit wire field.
pub const MAX_WIRE_CALL_ID: CallId = 0xFFFF;

/// Which end of a link a message came from or is going to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The endpoint that connected to the relay.
    Caller,
    /// The configured remote endpoint the relay connected to.
    Callee,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Caller => Side::Callee,
            Side::Callee => Side::Caller,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Caller => "caller",
            Side::Callee => "callee",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocator for the two fake-id pools.
///
/// Owned by the control-plane loop; every allocation goes through `&mut self`.
#[derive(Debug)]
pub struct IdAllocator {
    next_caller: CallId,
    next_callee: CallId,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_caller: 1,
            next_callee: 0,
        }
    }

    /// Next fake id exposed to the callee in place of the caller's real id.
    pub fn allocate_caller_id(&mut self) -> ProxyResult<CallId> {
        Self::take(&mut self.next_caller, "caller")
    }

    /// Next fake id exposed to the caller in place of the callee's real id.
    pub fn allocate_callee_id(&mut self) -> ProxyResult<CallId> {
        Self::take(&mut self.next_callee, "callee")
    }

    /// Allocate from the pool belonging to `side`.
    pub fn allocate(&mut self, side: Side) -> ProxyResult<CallId> {
        match side {
            Side::Caller => self.allocate_caller_id(),
            Side::Callee => self.allocate_callee_id(),
        }
    }

    fn take(pool: &mut CallId, name: &'static str) -> ProxyResult<CallId> {
        let id = *pool;
        if id > MAX_WIRE_CALL_ID {
            return Err(ProxyError::IdSpaceExhausted(name));
        }
        *pool += 2;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn first_ids_match_pool_origins() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate_caller_id().unwrap(), 1);
        assert_eq!(ids.allocate_callee_id().unwrap(), 0);
        assert_eq!(ids.allocate_caller_id().unwrap(), 3);
        assert_eq!(ids.allocate_callee_id().unwrap(), 2);
    }

    #[test]
    fn interleaved_pools_are_disjoint_and_step_by_two() {
        let mut ids = IdAllocator::new();
        let mut seen = HashSet::new();
        let mut last_caller = None;
        let mut last_callee = None;

        for i in 0..500u32 {
            let side = if i % 3 == 0 { Side::Callee } else { Side::Caller };
            let id = ids.allocate(side).unwrap();
            assert!(seen.insert(id), "id {id} handed out twice");

            let last = match side {
                Side::Caller => {
                    assert_eq!(id % 2, 1);
                    &mut last_caller
                }
                Side::Callee => {
                    assert_eq!(id % 2, 0);
                    &mut last_callee
                }
            };
            if let Some(prev) = *last {
                assert_eq!(id, prev + 2);
            }
            *last = Some(id);
        }
    }

    #[test]
    fn exhausted_pool_refuses_instead_of_wrapping() {
        let mut ids = IdAllocator::new();
        let mut last = 0;
        for _ in 0..=(MAX_WIRE_CALL_ID / 2) {
            last = ids.allocate_caller_id().unwrap();
        }
        assert_eq!(last, MAX_WIRE_CALL_ID);
        assert!(matches!(
            ids.allocate_caller_id(),
            Err(ProxyError::IdSpaceExhausted("caller"))
        ));
        // The other pool is unaffected.
        assert_eq!(ids.allocate_callee_id().unwrap(), 0);
    }

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Caller.opposite(), Side::Callee);
        assert_eq!(Side::Callee.opposite(), Side::Caller);
    }
}
