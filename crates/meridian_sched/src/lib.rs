//! Deterministic scheduling core.
//!
//! This crate provides the concurrency machinery of a meridian partition:
//! the gap-tolerant ordered log used to assemble batches arriving out of
//! order, the lock manager with deterministic deadlock resolution, and the
//! per-transaction views shared by the node modules. Higher layers supply a
//! `Sharding` implementation and drive transactions through a `LockManager`.

pub mod sched;
