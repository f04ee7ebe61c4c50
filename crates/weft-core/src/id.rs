//! Fiber identity.

use core::fmt;

/// Identifies a fiber within its owning thread's arena.
///
/// The id carries a generation alongside the slot index, so an id held
/// after its fiber terminated simply stops matching: scheduling a stale
/// id is a no-op rather than a resurrection of whatever fiber reused the
/// slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    index: u32,
    generation: u32,
}

impl FiberId {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single u64 (index in the low half).
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_u64(v: u64) -> Self {
        Self {
            index: v as u32,
            generation: (v >> 32) as u32,
        }
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({}.{})", self.index, self.generation)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip() {
        let id = FiberId::new(7, 3);
        assert_eq!(FiberId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn test_generation_distinguishes() {
        assert_ne!(FiberId::new(1, 0), FiberId::new(1, 1));
    }
}
