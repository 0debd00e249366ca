// Connection Handle Allocator
//
// Issues connection handles from a counter that only moves forward. When the
// counter reaches its ceiling it wraps to 1 and skips every handle still
// outstanding, so a handle is reused only after it was explicitly released.

use crate::transport::{ConnectionHandle, TransportError};
use std::collections::HashSet;

/// Allocator for process-unique connection handles
#[derive(Debug)]
pub struct HandleAllocator {
    next: u32,
    ceiling: u32,
    outstanding: HashSet<ConnectionHandle>,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleAllocator {
    /// Allocator over the full `1..=u32::MAX` range
    pub fn new() -> Self {
        Self::with_ceiling(u32::MAX)
    }

    /// Allocator over `1..=ceiling`; 0 is never handed out
    pub fn with_ceiling(ceiling: u32) -> Self {
        Self {
            next: 1,
            ceiling: ceiling.max(1),
            outstanding: HashSet::new(),
        }
    }

    /// Next free handle
    pub fn allocate(&mut self) -> Result<ConnectionHandle, TransportError> {
        if self.outstanding.len() as u64 >= self.ceiling as u64 {
            return Err(TransportError::HandlesExhausted);
        }

        loop {
            let candidate = ConnectionHandle::from_raw(self.next);
            self.next = if self.next >= self.ceiling { 1 } else { self.next + 1 };

            if self.outstanding.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Make a handle eligible for reuse
    pub fn release(&mut self, handle: ConnectionHandle) -> Result<(), TransportError> {
        if self.outstanding.remove(&handle) {
            Ok(())
        } else {
            Err(TransportError::HandleNotAllocated(handle))
        }
    }

    pub fn is_allocated(&self, handle: ConnectionHandle) -> bool {
        self.outstanding.contains(&handle)
    }

    /// Number of handles currently allocated
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
