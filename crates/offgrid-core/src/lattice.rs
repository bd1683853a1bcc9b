//! Join-semilattice trait for replicated values
//!
//! `join` must be commutative, associative and idempotent. Replicas that
//! receive the same set of values, in any order and with any repetition,
//! then hold the same result.

/// A value that merges by least upper bound.
pub trait Lattice: Clone + PartialEq {
    /// Identity for `join`: the value a replica holds before any write.
    fn bottom() -> Self;

    /// Least upper bound of `self` and `other`.
    fn join(&self, other: &Self) -> Self;

    /// `self` is already covered by `other`.
    fn leq(&self, other: &Self) -> bool {
        &self.join(other) == other
    }

    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }
}
