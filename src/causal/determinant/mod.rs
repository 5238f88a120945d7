//! Determinants: byte-encoded records of single non-deterministic
//! events, sufficient to replay those events on another replica.
//!
//! The encoding is a 1 byte tag followed by a fixed-width big-endian
//! payload, and must be round-trip stable across all replicas of the
//! same job.

use smallvec::SmallVec;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::causal::error::*;

/// A single non-deterministic choice made by a producer thread.
///
/// Determinants are appended to a thread causal log under the vertex
/// lock, never mutated, and freed when their epoch is reclaimed.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Determinant {
    /// The output of one RNG draw.
    Rng(u32),
    /// A serializable timer firing, with the registered callback it
    /// triggered.
    Timer { timestamp: u64, callback: u64 },
    /// A buffer boundary event of the given kind, in sequence order.
    Buffer { seq: u64, kind: u8 },
    /// The number of records a source emitted within the closing epoch.
    SourceCheckpoint(u64),
}

// wire tags; these are cross-replica protocol constants
const TAG_RNG: u8 = 0x01;
const TAG_TIMER: u8 = 0x02;
const TAG_BUFFER: u8 = 0x03;
const TAG_SOURCE_CHECKPOINT: u8 = 0x04;

/// The byte buffer one encoded determinant is returned in; sized so no
/// variant spills to the heap.
pub type EncodedDeterminant = SmallVec<[u8; Determinant::MAX_LENGTH]>;

impl Determinant {
    /// An encoded determinant never exceeds this many bytes.
    pub const MAX_LENGTH: usize = 17;

    /// Returns the size of the wire representation of this determinant
    /// in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Determinant::Rng(_) => std::mem::size_of::<u32>(),
            Determinant::Timer { .. } => 2 * std::mem::size_of::<u64>(),
            Determinant::Buffer { .. } => std::mem::size_of::<u64>() + 1,
            Determinant::SourceCheckpoint(_) => std::mem::size_of::<u64>(),
        }
    }

    /// Serialize this determinant into its wire representation.
    pub fn serialize(&self) -> EncodedDeterminant {
        let mut buf = EncodedDeterminant::new();
        match *self {
            Determinant::Rng(value) => {
                buf.push(TAG_RNG);
                buf.extend_from_slice(&value.to_be_bytes());
            }
            Determinant::Timer {
                timestamp,
                callback,
            } => {
                buf.push(TAG_TIMER);
                buf.extend_from_slice(&timestamp.to_be_bytes());
                buf.extend_from_slice(&callback.to_be_bytes());
            }
            Determinant::Buffer { seq, kind } => {
                buf.push(TAG_BUFFER);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.push(kind);
            }
            Determinant::SourceCheckpoint(count) => {
                buf.push(TAG_SOURCE_CHECKPOINT);
                buf.extend_from_slice(&count.to_be_bytes());
            }
        }
        buf
    }

    /// Deserialize one determinant from the front of `buf`, reporting
    /// how many bytes were consumed.
    ///
    /// An unrecognized tag or a truncated payload means the log cannot
    /// be salvaged mid-epoch, and is fatal to the enclosing task.
    pub fn deserialize_from(buf: &[u8]) -> Result<(Determinant, usize)> {
        let (tag, payload) = match buf.split_first() {
            Some(split) => split,
            None => {
                return Err("Empty determinant buffer").wrapped(ErrorKind::Determinant);
            }
        };
        let determinant = match *tag {
            TAG_RNG => Determinant::Rng(u32::from_be_bytes(read_array(payload, 0)?)),
            TAG_TIMER => Determinant::Timer {
                timestamp: u64::from_be_bytes(read_array(payload, 0)?),
                callback: u64::from_be_bytes(read_array(payload, 8)?),
            },
            TAG_BUFFER => Determinant::Buffer {
                seq: u64::from_be_bytes(read_array(payload, 0)?),
                kind: *payload
                    .get(8)
                    .ok_or_else(|| Error::wrapped(ErrorKind::Determinant, "Truncated payload"))?,
            },
            TAG_SOURCE_CHECKPOINT => {
                Determinant::SourceCheckpoint(u64::from_be_bytes(read_array(payload, 0)?))
            }
            _ => {
                return Err("Unrecognized determinant tag").wrapped(ErrorKind::Determinant);
            }
        };
        Ok((determinant, determinant.encoded_len()))
    }

    /// Deserialize the exact sequence of determinants encoded in `buf`.
    pub fn deserialize_all(mut buf: &[u8]) -> Result<Vec<Determinant>> {
        let mut determinants = Vec::new();
        while !buf.is_empty() {
            let (determinant, consumed) = Determinant::deserialize_from(buf)?;
            determinants.push(determinant);
            buf = &buf[consumed..];
        }
        Ok(determinants)
    }
}

fn read_array<const N: usize>(payload: &[u8], at: usize) -> Result<[u8; N]> {
    payload
        .get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::wrapped(ErrorKind::Determinant, "Truncated payload"))
}
