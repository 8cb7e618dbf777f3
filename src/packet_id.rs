//! Packet identifier allocation.
//!
//! Identifiers are handed out in increasing order, wrapping from 65535 back to 1, and skip any
//! value that is still in flight. An identifier returns to the pool only through
//! [PacketIdAllocator::release].
use crate::error::OperationError;

const WORDS: usize = (u16::MAX as usize + 1) / 32;

/// Issues identifiers for client-initiated packets.
pub struct PacketIdAllocator {
    in_use: [u32; WORDS],
    next: u16,
    count: usize,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub const fn new() -> Self {
        Self {
            in_use: [0; WORDS],
            next: 1,
            count: 0,
        }
    }

    /// Allocate the next free identifier.
    ///
    /// # Returns
    /// [OperationError::NoIdentifiersAvailable] if all 65535 identifiers are in flight.
    pub fn next(&mut self) -> Result<u16, OperationError> {
        if self.count >= u16::MAX as usize {
            return Err(OperationError::NoIdentifiersAvailable);
        }

        loop {
            let id = self.next;
            self.next = id.checked_add(1).unwrap_or(1);

            if !self.is_in_use(id) {
                self.set(id, true);
                self.count += 1;
                return Ok(id);
            }
        }
    }

    /// Return an identifier to the pool.
    ///
    /// # Returns
    /// False if the identifier was not allocated.
    pub fn release(&mut self, id: u16) -> bool {
        if id == 0 || !self.is_in_use(id) {
            return false;
        }

        self.set(id, false);
        self.count -= 1;
        true
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        let (word, bit) = Self::position(id);
        self.in_use[word] & (1 << bit) != 0
    }

    /// The number of identifiers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.count
    }

    fn set(&mut self, id: u16, in_use: bool) {
        let (word, bit) = Self::position(id);
        if in_use {
            self.in_use[word] |= 1 << bit;
        } else {
            self.in_use[word] &= !(1 << bit);
        }
    }

    fn position(id: u16) -> (usize, u32) {
        (id as usize / 32, id as u32 % 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocation() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.next(), Ok(1));
        assert_eq!(ids.next(), Ok(2));
        assert_eq!(ids.next(), Ok(3));
        assert_eq!(ids.in_flight(), 3);
    }

    #[test]
    fn released_identifiers_are_not_reissued_early() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.next(), Ok(1));
        assert_eq!(ids.next(), Ok(2));
        assert!(ids.release(1));
        assert!(!ids.release(1));

        // Allocation keeps increasing rather than immediately reusing 1.
        assert_eq!(ids.next(), Ok(3));
        assert!(!ids.is_in_use(1));
    }

    #[test]
    fn wraps_and_skips_in_flight() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.next(), Ok(1));
        ids.next = u16::MAX;

        assert_eq!(ids.next(), Ok(u16::MAX));
        // 0 is never issued and 1 is still in flight.
        assert_eq!(ids.next(), Ok(2));
    }

    #[test]
    fn exhaustion() {
        let mut ids = PacketIdAllocator::new();
        for expected in 1..=u16::MAX {
            assert_eq!(ids.next(), Ok(expected));
        }

        assert_eq!(ids.next(), Err(OperationError::NoIdentifiersAvailable));
        assert_eq!(ids.in_flight(), 65535);

        assert!(ids.release(500));
        assert_eq!(ids.next(), Ok(500));
        assert_eq!(ids.next(), Err(OperationError::NoIdentifiersAvailable));
    }

    #[test]
    fn zero_is_never_released() {
        let mut ids = PacketIdAllocator::new();
        assert!(!ids.release(0));
    }
}
