use std::sync::atomic::{AtomicU32, Ordering};

/// A per-sender, monotonically increasing (mod 2^32) packet counter.
///
/// One `Sequence` is owned per logical stream: the server owns one for its
/// process, a client owns one per connection.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU32);

impl Sequence {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Returns the next sequence number and advances the counter by one,
    /// wrapping at `u32::MAX` back to 0.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_by_one() {
        let seq = Sequence::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn wraps_at_u32_max() {
        let seq = Sequence(AtomicU32::new(u32::MAX));
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 0);
    }
}
