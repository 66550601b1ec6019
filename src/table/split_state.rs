//! Split state: the `(power, buddy)` pair that drives bucket routing
//!
//! Packed into one 64-bit word like the lock words: the power sits in the
//! top byte, the next buddy bucket in the low 56 bits.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::hash::KeyHash;

const POWER_SHIFT: u32 = 56;
const BUDDY_MASK: u64 = (1 << POWER_SHIFT) - 1;

/// Linear hashing state.
///
/// With base `N`, the table has `buddy` buckets. Buckets `[0, buddy - N*2^power)`
/// have already split in the current round; their keys route with
/// `power + 1`. Ordering is lexicographic on `(power, buddy)`, and the state
/// only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SplitState {
    power: u32,
    buddy: u64,
}

impl SplitState {
    /// Create a state
    #[inline]
    pub const fn new(power: u32, buddy: u64) -> Self {
        Self { power, buddy }
    }

    /// State of a fresh table with `base` buckets
    #[inline]
    pub const fn initial(base: u64) -> Self {
        Self::new(0, base)
    }

    /// Decode from a control word
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self {
            power: (control >> POWER_SHIFT) as u32,
            buddy: control & BUDDY_MASK,
        }
    }

    /// Encode into a control word
    #[inline]
    pub const fn to_control(&self) -> u64 {
        ((self.power as u64) << POWER_SHIFT) | (self.buddy & BUDDY_MASK)
    }

    /// Current power `i`
    #[inline]
    pub const fn power(&self) -> u32 {
        self.power
    }

    /// Next bucket to be created, `s`
    #[inline]
    pub const fn buddy(&self) -> u64 {
        self.buddy
    }

    /// Buckets in a round: `N * 2^power`
    #[inline]
    pub const fn round_size(&self, base: u64) -> u64 {
        base << self.power
    }

    /// Buckets already split in the current round
    #[inline]
    pub const fn split_in_round(&self, base: u64) -> u64 {
        self.buddy - self.round_size(base)
    }

    /// Number of addressable buckets
    #[inline]
    pub const fn num_buckets(&self) -> u64 {
        self.buddy
    }

    /// Whether every bucket of the round has been claimed for splitting
    #[inline]
    pub const fn round_claimed(&self, base: u64) -> bool {
        self.buddy == 2 * self.round_size(base)
    }

    /// Bucket of `hash`.
    ///
    /// `hash(key, i)` unless that bucket already split this round, then
    /// `hash(key, i + 1)`.
    #[inline]
    pub const fn route(&self, hash: KeyHash, base: u64) -> u64 {
        let bucket = hash.bucket(base, self.power);
        if bucket < self.split_in_round(base) {
            hash.bucket(base, self.power + 1)
        } else {
            bucket
        }
    }

    /// State after claiming the next bucket
    #[inline]
    pub const fn claim_next(&self) -> Self {
        Self::new(self.power, self.buddy + 1)
    }

    /// State after a completed round
    #[inline]
    pub const fn next_round(&self) -> Self {
        Self::new(self.power + 1, self.buddy)
    }
}

/// Atomically updated [`SplitState`]
#[derive(Debug)]
pub struct AtomicSplitState {
    control: AtomicU64,
}

impl AtomicSplitState {
    /// Create from an initial state
    pub const fn new(state: SplitState) -> Self {
        Self {
            control: AtomicU64::new(state.to_control()),
        }
    }

    /// Current state
    #[inline]
    pub fn load(&self) -> SplitState {
        SplitState::from_control(self.control.load(Ordering::Acquire))
    }

    /// Replace `current` with `new`. Returns false if the state moved.
    #[inline]
    pub fn compare_exchange(&self, current: SplitState, new: SplitState) -> bool {
        debug_assert!(new > current);
        self.control
            .compare_exchange(
                current.to_control(),
                new.to_control(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let state = SplitState::new(5, 64 * 32 + 17);
        assert_eq!(SplitState::from_control(state.to_control()), state);
        assert_eq!(SplitState::from_control(0), SplitState::new(0, 0));
    }

    #[test]
    fn test_initial_routes_with_power_zero() {
        let state = SplitState::initial(64);
        assert_eq!(state.num_buckets(), 64);
        assert_eq!(state.split_in_round(64), 0);
        for h in [0u64, 1, 63, 64, 65, 1000, u64::MAX] {
            assert_eq!(state.route(KeyHash::new(h), 64), h % 64);
        }
    }

    #[test]
    fn test_route_after_partial_round() {
        // 4 base buckets, bucket 0 and 1 already split into 4 and 5
        let state = SplitState::new(0, 6);
        assert_eq!(state.num_buckets(), 6);
        assert_eq!(state.route(KeyHash::new(4), 4), 4);
        assert_eq!(state.route(KeyHash::new(8), 4), 0);
        assert_eq!(state.route(KeyHash::new(5), 4), 5);
        assert_eq!(state.route(KeyHash::new(1), 4), 1);
        // Bucket 2 has not split: 6 % 8 would be 6, but it stays at 2
        assert_eq!(state.route(KeyHash::new(6), 4), 2);
        assert_eq!(state.route(KeyHash::new(7), 4), 3);
    }

    #[test]
    fn test_route_is_one_of_two_candidates() {
        let base = 3;
        let mut state = SplitState::initial(base);
        for _ in 0..40 {
            for h in 0..500u64 {
                let hash = KeyHash::new(h.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let bucket = state.route(hash, base);
                let low = hash.bucket(base, state.power());
                let high = hash.bucket(base, state.power() + 1);
                assert!(bucket < state.num_buckets());
                if low < state.split_in_round(base) {
                    assert_eq!(bucket, high);
                } else {
                    assert_eq!(bucket, low);
                }
            }
            let next = if state.round_claimed(base) {
                state.next_round()
            } else {
                state.claim_next()
            };
            assert!(next > state);
            state = next;
        }
    }

    #[test]
    fn test_full_round_routes_like_next_power() {
        let base = 4;
        let claimed = SplitState::new(1, 16);
        assert!(claimed.round_claimed(base));
        let advanced = claimed.next_round();
        for h in 0..1000u64 {
            let hash = KeyHash::new(h);
            assert_eq!(claimed.route(hash, base), advanced.route(hash, base));
        }
    }

    #[test]
    fn test_atomic_compare_exchange() {
        let state = AtomicSplitState::new(SplitState::initial(8));
        let current = state.load();
        assert!(state.compare_exchange(current, current.claim_next()));
        assert!(!state.compare_exchange(current, current.claim_next()));
        assert_eq!(state.load(), SplitState::new(0, 9));
    }
}
