//! This module contains the implementation details of `clotho`.
//!
//! The three log layers live in `thread`, `vertex` and `job`; the
//! remaining modules carry the identifiers, codecs and plumbing shared
//! between them.

pub mod collections;
pub mod config;
pub mod counters;
pub mod delta;
pub mod determinant;
pub mod error;
pub mod job;
pub mod ordering;
pub mod thread;
pub mod vertex;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A `VertexId` identifies one logical vertex of the dataflow graph.
///
/// Stable for the lifetime of the job; its 16 byte big-endian image is
/// what travels on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct VertexId(u128);

impl VertexId {
    /// The size of the wire representation of a `VertexId` in bytes.
    pub const LENGTH: usize = std::mem::size_of::<u128>();

    /// Returns the big-endian wire image of this id.
    #[inline]
    pub fn to_be_bytes(self) -> [u8; Self::LENGTH] {
        self.0.to_be_bytes()
    }

    /// Rebuilds an id from its big-endian wire image.
    #[inline]
    pub fn from_be_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl From<u128> for VertexId {
    #[inline]
    fn from(id: u128) -> VertexId {
        VertexId(id)
    }
}

impl From<VertexId> for u128 {
    #[inline]
    fn from(id: VertexId) -> u128 {
        id.0
    }
}

/// A `PartitionId` identifies one intermediate result partition produced
/// by a vertex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct PartitionId(u128);

impl PartitionId {
    /// The size of the wire representation of a `PartitionId` in bytes.
    pub const LENGTH: usize = std::mem::size_of::<u128>();

    /// Returns the big-endian wire image of this id.
    #[inline]
    pub fn to_be_bytes(self) -> [u8; Self::LENGTH] {
        self.0.to_be_bytes()
    }

    /// Rebuilds an id from its big-endian wire image.
    #[inline]
    pub fn from_be_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl From<u128> for PartitionId {
    #[inline]
    fn from(id: u128) -> PartitionId {
        PartitionId(id)
    }
}

impl From<PartitionId> for u128 {
    #[inline]
    fn from(id: PartitionId) -> u128 {
        id.0
    }
}

/// A `ConsumerId` identifies one downstream input channel reading deltas
/// from this replica.
///
/// Created on registration, forgotten on unregistration or cancel.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct ConsumerId(u64);

impl From<u64> for ConsumerId {
    #[inline]
    fn from(id: u64) -> ConsumerId {
        ConsumerId(id)
    }
}

impl From<ConsumerId> for u64 {
    #[inline]
    fn from(id: ConsumerId) -> u64 {
        id.0
    }
}

/// Addresses one subpartition of one output partition of a vertex.
///
/// The derived ordering is partition-major, which is also the order the
/// delta wire format groups subpartition payloads in.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PartitionKey {
    /// The intermediate result partition.
    pub partition: PartitionId,
    /// The subpartition index within `partition`.
    pub sub: u32,
}

impl PartitionKey {
    /// Creates a new key addressing subpartition `sub` of `partition`.
    pub fn new(partition: PartitionId, sub: u32) -> Self {
        Self { partition, sub }
    }
}
