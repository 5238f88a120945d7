//! # clotho
//!
//! `clotho` implements the causal determinant logging core of a distributed
//! stream-processing runtime: the per-vertex record of every
//! non-deterministic choice (RNG draws, timer firings, source emission
//! counts) an execution makes, organized into checkpoint epochs and
//! distributed downstream so that a standby replica can deterministically
//! replay a failed task.
//!
//! The crate is organized as three nested layers, leaves first:
//!
//! * thread causal logs, append-only byte logs sliced by epoch, in a
//!   single-producer and a multi-producer flavor;
//! * vertex causal logs, which route appends to the right thread log and
//!   assemble per-consumer deltas;
//! * the job causal log, which federates the local vertex's log with the
//!   logs of upstream vertices and speaks the delta exchange and bulk
//!   recovery protocols.
//!
//! Wire framing, failover orchestration, and the stream operator runtime
//! are collaborators of this crate, not part of it.

pub mod causal;
