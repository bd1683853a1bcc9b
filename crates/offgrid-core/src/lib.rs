//! # offgrid-core
//!
//! Causality primitives shared by the document CRDT and the sync layers:
//! - [`clock`] - Lamport clock with pluggable wall-clock source
//! - [`lww`] - Last-Writer-Wins value and the in-place merge
//! - [`lattice`] - join-semilattice contract

pub mod clock;
pub mod lattice;
pub mod lww;

pub use clock::{LamportClock, LogicalTimestamp, ManualClock, SystemClock, WallClock};
pub use lattice::Lattice;
pub use lww::{merge_lww, LwwValue};
