//! Module to order epochs, the checkpoint intervals every causal log
//! is sliced by.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Represents the id of a checkpoint interval.
///
/// Issued by the checkpoint coordinator, one per completed barrier, and
/// strictly monotonic over the lifetime of a job; an epoch is identified
/// by the id of the barrier that closes the prior epoch.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct EpochId(u64);

impl EpochId {
    /// The first epoch of a job.
    pub const ZERO: EpochId = EpochId(0);

    /// The size of the wire representation of an `EpochId` in bytes.
    pub const LENGTH: usize = std::mem::size_of::<u64>();

    /// Returns the following epoch id.
    #[inline]
    pub fn next(self) -> EpochId {
        EpochId(self.0 + 1)
    }

    /// Returns the preceding epoch id, unless this is `ZERO`.
    #[inline]
    pub fn prev(self) -> Option<EpochId> {
        self.0.checked_sub(1).map(EpochId)
    }

    /// Returns the big-endian wire image of this id.
    #[inline]
    pub fn to_be_bytes(self) -> [u8; Self::LENGTH] {
        self.0.to_be_bytes()
    }

    /// Rebuilds an id from its big-endian wire image.
    #[inline]
    pub fn from_be_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl From<u64> for EpochId {
    #[inline]
    fn from(epoch: u64) -> EpochId {
        EpochId(epoch)
    }
}

impl From<EpochId> for u64 {
    #[inline]
    fn from(epoch: EpochId) -> u64 {
        epoch.0
    }
}

/// Implemented by values pinned to a particular epoch.
pub trait Orderable {
    /// Returns the id of the epoch this value belongs to.
    fn epoch_id(&self) -> EpochId;
}
