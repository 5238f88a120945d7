//! Delta types traded between replicas, and their wire codec.
//!
//! A delta is the incremental portion of a causal log that one consumer
//! has not yet received. Deltas piggyback on data messages; the bulk
//! recovery request/response pair shares the same payload layout. All
//! integers are big-endian, lengths and counts are LEB128 varints.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::causal::collections::{self, OrderedMap};
use crate::causal::error::*;
use crate::causal::ordering::{EpochId, Orderable};
use crate::causal::{PartitionId, PartitionKey, VertexId};

/// New bytes of a single thread causal log, within a single epoch.
///
/// Immutable once constructed; consumed by the recipient.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ThreadLogDelta {
    epoch: EpochId,
    offset: u64,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    bytes: Vec<u8>,
}

impl Orderable for ThreadLogDelta {
    fn epoch_id(&self) -> EpochId {
        self.epoch
    }
}

impl ThreadLogDelta {
    /// Creates a delta carrying `bytes`, starting `offset` bytes into
    /// the given epoch.
    pub fn new(epoch: EpochId, offset: u64, bytes: Vec<u8>) -> Self {
        Self {
            epoch,
            offset,
            bytes,
        }
    }

    /// Creates a delta carrying no bytes for the given epoch.
    pub fn empty(epoch: EpochId) -> Self {
        Self::new(epoch, 0, Vec::new())
    }

    /// The logical offset from the start of the epoch of the first
    /// carried byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The carried bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    /// Reports whether this delta carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The first byte offset past this delta within its epoch.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}

/// The per-consumer delta of a whole vertex causal log: an optional
/// main thread delta plus the relevant subpartition deltas, in
/// partition-major order.
///
/// Instances with nothing to say carry no bytes at all; callers are
/// expected to test `has_updates()` and never put an empty delta on the
/// wire.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VertexLogDelta {
    vertex: VertexId,
    main: Option<ThreadLogDelta>,
    subpartitions: OrderedMap<PartitionKey, ThreadLogDelta>,
}

impl VertexLogDelta {
    /// Creates an empty delta for the given vertex.
    pub fn empty(vertex: VertexId) -> Self {
        Self {
            vertex,
            main: None,
            subpartitions: collections::ordered_map(),
        }
    }

    /// Creates a delta from its parts. Empty thread deltas are elided
    /// rather than stored.
    pub fn new(
        vertex: VertexId,
        main: Option<ThreadLogDelta>,
        subpartitions: OrderedMap<PartitionKey, ThreadLogDelta>,
    ) -> Self {
        let mut delta = Self::empty(vertex);
        if let Some(main) = main {
            delta.set_main(main);
        }
        for (key, sub) in subpartitions {
            delta.insert_subpartition(key, sub);
        }
        delta
    }

    /// The vertex this delta describes.
    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    /// The main thread delta, if it carries bytes.
    pub fn main(&self) -> Option<&ThreadLogDelta> {
        self.main.as_ref()
    }

    /// The subpartition deltas, in partition-major order.
    pub fn subpartitions(&self) -> &OrderedMap<PartitionKey, ThreadLogDelta> {
        &self.subpartitions
    }

    /// Reports whether this delta carries any bytes at all.
    pub fn has_updates(&self) -> bool {
        self.main.is_some() || !self.subpartitions.is_empty()
    }

    /// Returns the inner parts of this delta.
    pub fn into_inner(
        self,
    ) -> (
        VertexId,
        Option<ThreadLogDelta>,
        OrderedMap<PartitionKey, ThreadLogDelta>,
    ) {
        (self.vertex, self.main, self.subpartitions)
    }

    pub(crate) fn set_main(&mut self, main: ThreadLogDelta) {
        if !main.is_empty() {
            self.main = Some(main);
        }
    }

    pub(crate) fn insert_subpartition(&mut self, key: PartitionKey, sub: ThreadLogDelta) {
        if !sub.is_empty() {
            self.subpartitions.insert(key, sub);
        }
    }

    /// Serialize this delta into `buf`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.vertex.to_be_bytes());
        match &self.main {
            Some(main) => {
                buf.push(1);
                serialize_thread_delta(main, buf);
            }
            None => buf.push(0),
        }

        // partition-major grouping falls out of the map's sorted order
        let num_groups = {
            let mut count: u64 = 0;
            let mut last = None;
            for key in self.subpartitions.keys() {
                if last != Some(key.partition) {
                    count += 1;
                    last = Some(key.partition);
                }
            }
            count
        };
        write_varint(buf, num_groups);

        let mut entries = self.subpartitions.iter().peekable();
        while let Some((first, _)) = entries.peek() {
            let partition = first.partition;
            buf.extend_from_slice(&partition.to_be_bytes());
            let group: Vec<_> = {
                let mut group = Vec::new();
                while let Some((key, _)) = entries.peek() {
                    if key.partition != partition {
                        break;
                    }
                    let (key, sub) = entries.next().unwrap();
                    group.push((key.sub, sub));
                }
                group
            };
            write_varint(buf, group.len() as u64);
            for (sub_index, sub) in group {
                write_varint(buf, sub_index as u64);
                serialize_thread_delta(sub, buf);
            }
        }
    }

    /// Deserialize one delta from the front of `buf`, reporting how
    /// many bytes were consumed.
    pub fn deserialize_from(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let delta = Self::deserialize_from_reader(&mut reader)?;
        Ok((delta, reader.consumed()))
    }

    fn deserialize_from_reader(reader: &mut ByteReader<'_>) -> Result<Self> {
        let vertex = VertexId::from_be_bytes(reader.read_array()?);
        let mut delta = Self::empty(vertex);

        let has_main = reader.read_u8()?;
        if has_main > 1 {
            return Err("Invalid main delta presence byte").wrapped(ErrorKind::DeltaCodec);
        }
        if has_main == 1 {
            delta.set_main(deserialize_thread_delta(reader)?);
        }

        let num_groups = reader.read_varint()?;
        for _ in 0..num_groups {
            let partition = PartitionId::from_be_bytes(reader.read_array()?);
            let num_subparts = reader.read_varint()?;
            for _ in 0..num_subparts {
                let sub_index = reader.read_varint()?;
                let sub_index = u32::try_from(sub_index)
                    .simple_msg(ErrorKind::DeltaCodec, "Subpartition index overflow")?;
                let sub = deserialize_thread_delta(reader)?;
                delta.insert_subpartition(PartitionKey::new(partition, sub_index), sub);
            }
        }
        Ok(delta)
    }
}

/// Serialize a list of vertex deltas into `buf`, length-prefixed, the
/// layout a data message carries piggybacked deltas in.
pub fn serialize_delta_list(deltas: &[VertexLogDelta], buf: &mut Vec<u8>) {
    write_varint(buf, deltas.len() as u64);
    for delta in deltas {
        delta.serialize_into(buf);
    }
}

/// Deserialize a length-prefixed list of vertex deltas from the front
/// of `buf`, reporting how many bytes were consumed.
pub fn deserialize_delta_list(buf: &[u8]) -> Result<(Vec<VertexLogDelta>, usize)> {
    let mut reader = ByteReader::new(buf);
    let count = reader.read_varint()?;
    let mut deltas = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        deltas.push(VertexLogDelta::deserialize_from_reader(&mut reader)?);
    }
    Ok((deltas, reader.consumed()))
}

/// Asks a peer replica for every determinant it holds for `vertex`,
/// from `start_epoch` to the tip of its log.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeterminantRequest {
    vertex: VertexId,
    start_epoch: EpochId,
}

impl Orderable for DeterminantRequest {
    fn epoch_id(&self) -> EpochId {
        self.start_epoch
    }
}

impl DeterminantRequest {
    /// The size of the wire representation of a request in bytes.
    pub const LENGTH: usize = VertexId::LENGTH + EpochId::LENGTH;

    /// Creates a new request for `vertex` starting at `start_epoch`.
    pub fn new(vertex: VertexId, start_epoch: EpochId) -> Self {
        Self {
            vertex,
            start_epoch,
        }
    }

    /// The vertex whose determinants are requested.
    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    /// The first epoch the requester is interested in.
    pub fn start_epoch(&self) -> EpochId {
        self.start_epoch
    }

    /// Serialize a request into a byte buffer of appropriate size.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to serialize into").wrapped(ErrorKind::DeltaCodec);
        }
        buf[..VertexId::LENGTH].copy_from_slice(&self.vertex.to_be_bytes());
        buf[VertexId::LENGTH..Self::LENGTH].copy_from_slice(&self.start_epoch.to_be_bytes());
        Ok(())
    }

    /// Deserialize a request from a byte buffer of appropriate size.
    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to deserialize from").wrapped(ErrorKind::DeltaCodec);
        }
        let mut reader = ByteReader::new(buf);
        Ok(Self {
            vertex: VertexId::from_be_bytes(reader.read_array()?),
            start_epoch: EpochId::from_be_bytes(reader.read_array()?),
        })
    }
}

/// Answers a `DeterminantRequest`.
///
/// `found == false` signals the requested vertex is outside this
/// replica's sharing depth, and the requester should try another
/// replica; no payload is carried in that case.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeterminantResponse {
    vertex: VertexId,
    payload: Option<VertexLogDelta>,
}

impl DeterminantResponse {
    /// Creates a positive response carrying `payload`.
    pub fn new(vertex: VertexId, payload: VertexLogDelta) -> Self {
        Self {
            vertex,
            payload: Some(payload),
        }
    }

    /// Creates a negative response: the vertex is outside this
    /// replica's sharing depth.
    pub fn not_found(vertex: VertexId) -> Self {
        Self {
            vertex,
            payload: None,
        }
    }

    /// Reports whether the responder served the request.
    pub fn found(&self) -> bool {
        self.payload.is_some()
    }

    /// The vertex this response describes.
    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    /// The served determinants, on a positive response.
    pub fn payload(&self) -> Option<&VertexLogDelta> {
        self.payload.as_ref()
    }

    /// Returns the served determinants, consuming the response.
    pub fn into_payload(self) -> Option<VertexLogDelta> {
        self.payload
    }

    /// Serialize this response into `buf`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.found() as u8);
        buf.extend_from_slice(&self.vertex.to_be_bytes());
        if let Some(payload) = &self.payload {
            payload.serialize_into(buf);
        }
    }

    /// Deserialize one response from the front of `buf`, reporting how
    /// many bytes were consumed.
    pub fn deserialize_from(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let found = reader.read_u8()?;
        if found > 1 {
            return Err("Invalid response presence byte").wrapped(ErrorKind::DeltaCodec);
        }
        let vertex = VertexId::from_be_bytes(reader.read_array()?);
        let payload = if found == 1 {
            Some(VertexLogDelta::deserialize_from_reader(&mut reader)?)
        } else {
            None
        };
        Ok((Self { vertex, payload }, reader.consumed()))
    }
}

fn serialize_thread_delta(delta: &ThreadLogDelta, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&delta.epoch_id().to_be_bytes());
    write_varint(buf, delta.offset());
    write_varint(buf, delta.bytes().len() as u64);
    buf.extend_from_slice(delta.bytes());
}

fn deserialize_thread_delta(reader: &mut ByteReader<'_>) -> Result<ThreadLogDelta> {
    let epoch = EpochId::from_be_bytes(reader.read_array()?);
    let offset = reader.read_varint()?;
    let length = reader.read_varint()?;
    let length = usize::try_from(length).simple_msg(ErrorKind::DeltaCodec, "Delta length overflow")?;
    let bytes = reader.read_bytes(length)?.to_vec();
    Ok(ThreadLogDelta::new(epoch, offset, bytes))
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

// a forward-only view over an input buffer; every read is
// length-checked
struct ByteReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn consumed(&self) -> usize {
        self.at
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.at)
            .ok_or_else(|| Error::wrapped(ErrorKind::DeltaCodec, "Truncated input"))?;
        self.at += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.at..self.at + len)
            .ok_or_else(|| Error::wrapped(ErrorKind::DeltaCodec, "Truncated input"))?;
        self.at += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        // the length is exact, safe to use unwrap()
        self.read_bytes(N).map(|bytes| bytes.try_into().unwrap())
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            let bits = (byte & 0x7f) as u64;
            if shift == 63 && bits > 1 {
                break;
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err("Varint overflow").wrapped(ErrorKind::DeltaCodec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(epoch: u64, offset: u64, bytes: &[u8]) -> ThreadLogDelta {
        ThreadLogDelta::new(EpochId::from(epoch), offset, bytes.to_vec())
    }

    fn key(partition: u128, sub: u32) -> PartitionKey {
        PartitionKey::new(PartitionId::from(partition), sub)
    }

    #[test]
    fn varint_round_trip() {
        let values = [0, 1, 127, 128, 300, 16_383, 16_384, u64::MAX];
        for &value in &values {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut reader = ByteReader::new(&buf);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert_eq!(reader.consumed(), buf.len());
        }
    }

    #[test]
    fn varint_overflow_is_an_error() {
        let buf = [0xff; 11];
        let mut reader = ByteReader::new(&buf);
        let err = reader.read_varint().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeltaCodec);
    }

    #[test]
    fn vertex_delta_round_trip() {
        let mut subpartitions = collections::ordered_map();
        subpartitions.insert(key(1, 0), delta(42, 0, b"abcdef"));
        subpartitions.insert(key(1, 3), delta(42, 6, b"ghi"));
        subpartitions.insert(key(2, 1), delta(41, 100, b"z"));
        let original = VertexLogDelta::new(
            VertexId::from(0xfeed),
            Some(delta(42, 10, b"main bytes")),
            subpartitions,
        );

        let mut buf = Vec::new();
        original.serialize_into(&mut buf);
        let (decoded, consumed) = VertexLogDelta::deserialize_from(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, original);
    }

    #[test]
    fn vertex_delta_without_main_round_trip() {
        let mut subpartitions = collections::ordered_map();
        subpartitions.insert(key(9, 7), delta(3, 0, b"xy"));
        let original = VertexLogDelta::new(VertexId::from(1), None, subpartitions);

        let mut buf = Vec::new();
        original.serialize_into(&mut buf);
        let (decoded, _) = VertexLogDelta::deserialize_from(&buf).unwrap();
        assert!(decoded.main().is_none());
        assert_eq!(decoded, original);
    }

    #[test]
    fn empty_thread_deltas_are_elided() {
        let mut subpartitions = collections::ordered_map();
        subpartitions.insert(key(1, 0), delta(5, 0, b""));
        let empty = VertexLogDelta::new(
            VertexId::from(7),
            Some(ThreadLogDelta::empty(EpochId::from(5))),
            subpartitions,
        );
        assert!(!empty.has_updates());
        assert!(empty.main().is_none());
        assert!(empty.subpartitions().is_empty());
    }

    #[test]
    fn delta_list_round_trip() {
        let one = VertexLogDelta::new(VertexId::from(1), Some(delta(1, 0, b"a")), Default::default());
        let two = VertexLogDelta::new(VertexId::from(2), Some(delta(1, 0, b"b")), Default::default());
        let deltas = vec![one, two];

        let mut buf = Vec::new();
        serialize_delta_list(&deltas, &mut buf);
        let (decoded, consumed) = deserialize_delta_list(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, deltas);
    }

    #[test]
    fn request_round_trip() {
        let request = DeterminantRequest::new(VertexId::from(0xabcd), EpochId::from(17));
        let mut buf = [0; DeterminantRequest::LENGTH];
        request.serialize_into(&mut buf[..]).unwrap();
        assert_eq!(DeterminantRequest::deserialize_from(&buf[..]).unwrap(), request);
    }

    #[test]
    fn request_length_is_checked() {
        let request = DeterminantRequest::new(VertexId::from(1), EpochId::ZERO);
        let mut buf = [0; DeterminantRequest::LENGTH - 1];
        let err = request.serialize_into(&mut buf[..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeltaCodec);
        let err = DeterminantRequest::deserialize_from(&buf[..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeltaCodec);
    }

    #[test]
    fn response_round_trip() {
        let payload = VertexLogDelta::new(
            VertexId::from(3),
            Some(delta(2, 0, b"payload")),
            Default::default(),
        );
        let positive = DeterminantResponse::new(VertexId::from(3), payload);
        let negative = DeterminantResponse::not_found(VertexId::from(4));

        for original in [positive, negative] {
            let mut buf = Vec::new();
            original.serialize_into(&mut buf);
            let (decoded, consumed) = DeterminantResponse::deserialize_from(&buf).unwrap();
            assert_eq!(consumed, buf.len());
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn truncated_delta_is_an_error() {
        let original = VertexLogDelta::new(
            VertexId::from(1),
            Some(delta(1, 0, b"some bytes")),
            Default::default(),
        );
        let mut buf = Vec::new();
        original.serialize_into(&mut buf);
        let err = VertexLogDelta::deserialize_from(&buf[..buf.len() - 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeltaCodec);
    }

    #[cfg(feature = "serialize_serde")]
    #[test]
    fn serde_round_trip() {
        let mut subpartitions = collections::ordered_map();
        subpartitions.insert(key(1, 2), delta(8, 4, b"sub"));
        let original = VertexLogDelta::new(
            VertexId::from(0xbeef),
            Some(delta(8, 0, b"main")),
            subpartitions,
        );
        let bytes = bincode::serialize(&original).unwrap();
        let decoded: VertexLogDelta = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, original);
    }
}
