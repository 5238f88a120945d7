//! Thread causal logs: append-only byte logs sliced by epoch, with
//! per-consumer read cursors.
//!
//! Two flavors share one storage core. [`LocalThreadLog`] backs a
//! single producer thread of the owning vertex; appends are serialized
//! by the vertex-wide lock held by the caller, so the type carries no
//! synchronization of its own. [`UpstreamThreadLog`] accumulates deltas
//! arriving concurrently from peer replicas, serializing writers behind
//! a write lock while delta dispatch reads on the read side.

mod buffer;

use std::collections::VecDeque;
use std::sync::Arc;

use either::{Either, Left, Right};
use intmap::IntMap;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::causal::counters::LogCounters;
use crate::causal::delta::ThreadLogDelta;
use crate::causal::determinant::Determinant;
use crate::causal::error::*;
use crate::causal::ordering::{EpochId, Orderable};
use crate::causal::ConsumerId;

use self::buffer::CircularByteBuffer;

// out-of-order fragments parked per log until their gap fills
const MAX_PENDING_FRAGMENTS: usize = 64;

/// One epoch's run of bytes within the backing buffer.
///
/// A slice is open while it is the youngest; it closes implicitly when
/// a later epoch opens, and is destroyed when a completed checkpoint
/// with a greater id reclaims it. No slice ever re-opens.
struct EpochSlice {
    epoch: EpochId,
    // physical offset of the slice's first byte; rebased on growth
    start: usize,
    len: usize,
}

impl Orderable for EpochSlice {
    fn epoch_id(&self) -> EpochId {
        self.epoch
    }
}

/// Why an epoch has no slice in the store.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SliceMiss {
    /// A completed checkpoint already reclaimed the epoch.
    Reclaimed,
    /// No write has mentioned the epoch yet.
    Unopened,
}

/// Outcome of feeding one upstream fragment to the store.
enum Apply {
    /// The final `n` bytes of the fragment were new and were appended.
    Applied(usize),
    /// The store had already advanced past every byte of the fragment.
    Stale,
    /// The fragment claims bytes a well-behaved sender cannot still be
    /// producing (new content for a closed slice, or an epoch behind
    /// the tip that never opened here).
    Torn,
    /// The fragment starts past the epoch's contiguous frontier; it
    /// must wait for the gap to fill.
    Gap,
}

/// Outcome of processing one upstream delta.
enum CatchUp {
    Applied(usize),
    Stale,
    Torn,
    /// Parked until the bytes in front of it arrive.
    Deferred,
    Closed,
}

/// Epoch-sliced byte storage shared by both thread log flavors.
struct EpochStore {
    buffer: CircularByteBuffer,
    slices: VecDeque<EpochSlice>,
    // fragments received ahead of their epoch's contiguous frontier
    pending: Vec<ThreadLogDelta>,
    // every epoch below this id is reclaimed; monotone
    floor: EpochId,
    closed: bool,
}

impl EpochStore {
    fn new(limit: usize) -> Self {
        Self {
            buffer: CircularByteBuffer::new(limit),
            slices: VecDeque::new(),
            pending: Vec::new(),
            floor: EpochId::ZERO,
            closed: false,
        }
    }

    #[cfg(test)]
    fn with_capacity(capacity: usize, limit: usize) -> Self {
        Self {
            buffer: CircularByteBuffer::with_capacity(capacity, limit),
            ..Self::new(limit)
        }
    }

    fn locate(&self, epoch: EpochId) -> Either<SliceMiss, usize> {
        if epoch < self.floor {
            return Left(SliceMiss::Reclaimed);
        }
        let index = self.slices.partition_point(|s| s.epoch_id() < epoch);
        match self.slices.get(index) {
            Some(slice) if slice.epoch_id() == epoch => Right(index),
            _ => Left(SliceMiss::Unopened),
        }
    }

    /// The oldest epoch a read may still observe.
    fn earliest_retained(&self) -> EpochId {
        self.slices
            .front()
            .map(|s| s.epoch_id())
            .unwrap_or(self.floor)
    }

    fn log_length(&self) -> usize {
        self.buffer.len()
    }

    /// Appends producer bytes to `epoch`, opening its slice on the
    /// first write. Epochs only move forward: writing behind the
    /// youngest slice or behind the reclaim floor is a logic error of
    /// the producer's barrier discipline.
    fn append(&mut self, epoch: EpochId, bytes: &[u8]) -> Result<()> {
        if self.closed || bytes.is_empty() {
            return Ok(());
        }
        if epoch < self.floor {
            return Err("Append to a reclaimed epoch").wrapped(ErrorKind::ThreadLog);
        }
        let open = match self.slices.back() {
            Some(back) if back.epoch_id() > epoch => {
                return Err("Append to a closed epoch").wrapped(ErrorKind::ThreadLog);
            }
            Some(back) => back.epoch_id() < epoch,
            None => true,
        };

        let start_logical = self.buffer.len();
        if let Some(rebase) = self.buffer.append(bytes)? {
            for slice in &mut self.slices {
                slice.start = rebase.apply(slice.start);
            }
        }
        if open {
            self.slices.push_back(EpochSlice {
                epoch,
                start: self.buffer.position_of(start_logical),
                len: bytes.len(),
            });
        } else {
            // safe to use unwrap(): `open` is false only with a back
            let back = self.slices.back_mut().unwrap();
            back.len += bytes.len();
        }
        Ok(())
    }

    /// Applies one upstream delta idempotently: with `L` the current
    /// length of the delta's epoch and `R` its end offset, nothing
    /// happens unless `R > L`, and then only the final `R - L` bytes
    /// are appended. Fragments arriving ahead of the contiguous
    /// frontier are parked and merged once the gap fills, so the final
    /// state depends only on the set of fragments received, not their
    /// arrival order.
    fn catch_up(&mut self, delta: &ThreadLogDelta) -> Result<CatchUp> {
        if self.closed {
            return Ok(CatchUp::Closed);
        }
        match self.apply_fragment(delta.epoch_id(), delta.offset() as usize, delta.bytes())? {
            Apply::Applied(fresh) => {
                self.drain_pending()?;
                Ok(CatchUp::Applied(fresh))
            }
            Apply::Gap => {
                if self.pending.len() >= MAX_PENDING_FRAGMENTS {
                    return Ok(CatchUp::Torn);
                }
                self.pending.push(delta.clone());
                Ok(CatchUp::Deferred)
            }
            Apply::Stale => Ok(CatchUp::Stale),
            Apply::Torn => Ok(CatchUp::Torn),
        }
    }

    fn apply_fragment(&mut self, epoch: EpochId, offset: usize, bytes: &[u8]) -> Result<Apply> {
        if epoch < self.floor {
            return Ok(Apply::Stale);
        }
        let end = offset + bytes.len();
        match self.locate(epoch) {
            Right(index) => {
                let live = self.slices[index].len;
                if end <= live {
                    return Ok(Apply::Stale);
                }
                if index != self.slices.len() - 1 {
                    return Ok(Apply::Torn);
                }
                if offset > live {
                    return Ok(Apply::Gap);
                }
                self.append(epoch, &bytes[live - offset..])?;
                Ok(Apply::Applied(end - live))
            }
            Left(SliceMiss::Unopened) => {
                if bytes.is_empty() {
                    return Ok(Apply::Stale);
                }
                let behind_tip = self
                    .slices
                    .back()
                    .map(|back| back.epoch_id() > epoch)
                    .unwrap_or(false);
                if behind_tip {
                    return Ok(Apply::Torn);
                }
                if offset > 0 {
                    return Ok(Apply::Gap);
                }
                self.append(epoch, bytes)?;
                Ok(Apply::Applied(bytes.len()))
            }
            Left(SliceMiss::Reclaimed) => Ok(Apply::Stale),
        }
    }

    // retries parked fragments until a full pass makes no progress
    fn drain_pending(&mut self) -> Result<()> {
        let mut progressed = true;
        while progressed && !self.pending.is_empty() {
            progressed = false;
            let pending = std::mem::take(&mut self.pending);
            for delta in pending {
                let outcome = self.apply_fragment(
                    delta.epoch_id(),
                    delta.offset() as usize,
                    delta.bytes(),
                )?;
                match outcome {
                    Apply::Applied(_) => progressed = true,
                    Apply::Gap => self.pending.push(delta),
                    // subsumed by other fragments in the meantime
                    Apply::Stale | Apply::Torn => (),
                }
            }
        }
        Ok(())
    }

    /// Number of bytes written to `epoch` so far; zero when the epoch
    /// has no slice.
    #[cfg(test)]
    fn epoch_len(&self, epoch: EpochId) -> usize {
        match self.locate(epoch) {
            Right(index) => self.slices[index].len,
            Left(_) => 0,
        }
    }

    /// Copies the bytes of `epoch` from logical offset `from` to the
    /// slice's end.
    fn read_epoch(&self, epoch: EpochId, from: usize) -> Vec<u8> {
        let mut out = Vec::new();
        if let Right(index) = self.locate(epoch) {
            let slice = &self.slices[index];
            if from < slice.len {
                let capacity = self.buffer.capacity().max(1);
                let start = (slice.start + from) % capacity;
                self.buffer.copy_range(start, slice.len - from, &mut out);
            }
        }
        out
    }

    /// Concatenates every byte from the earliest retained epoch at or
    /// past `start_epoch` through the tip, reporting that epoch.
    fn read_from(&self, start_epoch: EpochId) -> Option<(EpochId, Vec<u8>)> {
        let index = self.slices.partition_point(|s| s.epoch_id() < start_epoch);
        let first = self.slices.get(index)?;
        let effective = first.epoch_id();
        let mut out = Vec::new();
        for slice in self.slices.iter().skip(index) {
            self.buffer.copy_range(slice.start, slice.len, &mut out);
        }
        Some((effective, out))
    }

    /// Reclaims every slice with an id below `checkpoint`, keeping the
    /// slice with the checkpoint's own id. Repeated or out of date
    /// notifications are no-ops.
    fn reclaim(&mut self, checkpoint: EpochId) -> usize {
        if self.closed || checkpoint <= self.floor {
            return 0;
        }
        self.floor = checkpoint;
        self.pending.retain(|d| d.epoch_id() >= checkpoint);
        let mut reclaimed = 0;
        while let Some(front) = self.slices.front() {
            if front.epoch_id() >= checkpoint {
                break;
            }
            let len = front.len;
            self.buffer.discard_front(len);
            self.slices.pop_front();
            reclaimed += 1;
        }
        reclaimed
    }

    fn close(&mut self) {
        self.closed = true;
        self.slices.clear();
        self.pending.clear();
        self.buffer.release();
    }
}

/// Tracks, per downstream consumer, how far into which epoch the
/// consumer has been served.
struct ConsumerCursor {
    epoch: EpochId,
    offset: usize,
}

struct CursorTable {
    cursors: IntMap<ConsumerCursor>,
}

impl CursorTable {
    fn new() -> Self {
        Self {
            cursors: IntMap::new(),
        }
    }

    fn known(&self, consumer: ConsumerId) -> bool {
        self.cursors.contains_key(consumer.into())
    }

    /// The cursor algorithm: serve the bytes between the cursor and the
    /// writer position within `epoch`, then advance the cursor to the
    /// writer position. Unknown consumers start at the beginning of
    /// `epoch`.
    fn advance(
        &mut self,
        consumer: ConsumerId,
        epoch: EpochId,
        store: &EpochStore,
    ) -> ThreadLogDelta {
        if store.closed {
            return ThreadLogDelta::empty(epoch);
        }
        if let Left(SliceMiss::Reclaimed) = store.locate(epoch) {
            return ThreadLogDelta::empty(epoch);
        }
        let key = u64::from(consumer);
        if self.cursors.get(key).is_none() {
            self.cursors.insert(key, ConsumerCursor { epoch, offset: 0 });
        }
        // safe to use unwrap(): inserted above when absent
        let cursor = self.cursors.get_mut(key).unwrap();
        if cursor.epoch < epoch {
            // the caller drives epoch advance through successive calls;
            // a cursor left in a reclaimed epoch can only move here,
            // which is exactly the rebase reclamation asks for
            cursor.epoch = epoch;
            cursor.offset = 0;
        } else if cursor.epoch > epoch {
            return ThreadLogDelta::empty(epoch);
        }
        let bytes = store.read_epoch(epoch, cursor.offset);
        let delta = ThreadLogDelta::new(epoch, cursor.offset as u64, bytes);
        cursor.offset += delta.bytes().len();
        delta
    }

    /// Rewinds one consumer to replay from the oldest in-scope
    /// determinant.
    fn reset(&mut self, consumer: ConsumerId, earliest: EpochId) {
        let key = u64::from(consumer);
        self.cursors.remove(key);
        self.cursors.insert(
            key,
            ConsumerCursor {
                epoch: earliest,
                offset: 0,
            },
        );
    }

    fn remove(&mut self, consumer: ConsumerId) {
        self.cursors.remove(consumer.into());
    }

    fn clear(&mut self) {
        self.cursors.clear();
    }
}

/// The single-producer thread causal log of this replica's own vertex.
///
/// Every append must happen under the vertex-wide lock; the owning
/// vertex log enforces that by construction.
pub struct LocalThreadLog {
    store: EpochStore,
    cursors: CursorTable,
    counters: Arc<LogCounters>,
}

impl LocalThreadLog {
    /// Creates an empty log without a growth bound.
    pub fn new(counters: Arc<LogCounters>) -> Self {
        Self::with_limit(usize::MAX, counters)
    }

    /// Creates an empty log that fails appends with a capacity error
    /// once growing it would exceed `limit` bytes.
    pub fn with_limit(limit: usize, counters: Arc<LogCounters>) -> Self {
        Self {
            store: EpochStore::new(limit),
            cursors: CursorTable::new(),
            counters,
        }
    }

    /// Encodes `determinant` and appends it to `epoch`, opening the
    /// epoch's slice on its first write.
    pub fn append_determinant(&mut self, determinant: &Determinant, epoch: EpochId) -> Result<()> {
        let encoded = determinant.serialize();
        self.store.append(epoch, &encoded)
    }

    /// Returns the bytes of `epoch` the consumer has not seen yet, and
    /// advances its cursor past them.
    pub fn next_delta_for(&mut self, consumer: ConsumerId, epoch: EpochId) -> ThreadLogDelta {
        if !self.cursors.known(consumer) {
            self.counters.count_unknown_consumer();
        }
        self.cursors.advance(consumer, epoch, &self.store)
    }

    /// Reclaims every epoch slice with an id below `checkpoint`.
    pub fn notify_checkpoint_complete(&mut self, checkpoint: EpochId) {
        let reclaimed = self.store.reclaim(checkpoint);
        self.counters.count_reclaimed_slices(reclaimed);
    }

    /// Rewinds the consumer's cursor to the earliest retained epoch, so
    /// a replacement replica is replayed from the oldest in-scope
    /// determinant.
    pub fn notify_downstream_failure(&mut self, consumer: ConsumerId) {
        self.cursors.reset(consumer, self.store.earliest_retained());
    }

    /// Forgets the consumer's cursor.
    pub fn unregister_consumer(&mut self, consumer: ConsumerId) {
        self.cursors.remove(consumer);
    }

    /// Total live bytes.
    pub fn log_length(&self) -> usize {
        self.store.log_length()
    }

    /// Releases the backing storage and invalidates all cursors.
    /// Idempotent; operations on a closed log are empty no-ops.
    pub fn close(&mut self) {
        self.store.close();
        self.cursors.clear();
    }
}

/// A thread causal log fed by deltas from peer replicas.
///
/// Multiple network I/O threads may feed and read it concurrently:
/// writers serialize behind the storage write lock, delta dispatch
/// takes the read side and is never blocked by other readers. The lock
/// order is cursors before storage, everywhere.
pub struct UpstreamThreadLog {
    store: RwLock<EpochStore>,
    cursors: Mutex<CursorTable>,
    counters: Arc<LogCounters>,
}

impl UpstreamThreadLog {
    /// Creates an empty log without a growth bound.
    pub fn new(counters: Arc<LogCounters>) -> Self {
        Self {
            store: RwLock::new(EpochStore::new(usize::MAX)),
            cursors: Mutex::new(CursorTable::new()),
            counters,
        }
    }

    /// Applies one delta received from a peer replica, by idempotent,
    /// commutative catch-up. Stale deltas are discarded silently and
    /// counted.
    pub fn process_delta(&self, delta: &ThreadLogDelta) -> Result<()> {
        let outcome = self.store.write().catch_up(delta)?;
        match outcome {
            CatchUp::Applied(fresh) => {
                debug!(
                    "caught up {} fresh bytes for epoch {:?}",
                    fresh,
                    delta.epoch_id()
                );
            }
            CatchUp::Deferred => {
                debug!(
                    "parked out-of-order fragment for epoch {:?} at offset {}",
                    delta.epoch_id(),
                    delta.offset()
                );
            }
            CatchUp::Stale => {
                self.counters.count_stale_delta();
                debug!("discarded stale delta for epoch {:?}", delta.epoch_id());
            }
            CatchUp::Torn => {
                self.counters.count_stale_delta();
                warn!(
                    "discarded delta tearing epoch {:?} at offset {}",
                    delta.epoch_id(),
                    delta.offset()
                );
            }
            CatchUp::Closed => (),
        }
        Ok(())
    }

    /// Returns the bytes of `epoch` the consumer has not seen yet, and
    /// advances its cursor past them.
    pub fn next_delta_for(&self, consumer: ConsumerId, epoch: EpochId) -> ThreadLogDelta {
        let mut cursors = self.cursors.lock();
        if !cursors.known(consumer) {
            self.counters.count_unknown_consumer();
        }
        let store = self.store.read();
        cursors.advance(consumer, epoch, &store)
    }

    /// Concatenates everything retained from `start_epoch` through the
    /// tip into one delta pinned at the earliest epoch served, for bulk
    /// recovery.
    pub fn read_from(&self, start_epoch: EpochId) -> Option<ThreadLogDelta> {
        let store = self.store.read();
        let (effective, bytes) = store.read_from(start_epoch)?;
        Some(ThreadLogDelta::new(effective, 0, bytes))
    }

    /// Reclaims every epoch slice with an id below `checkpoint`.
    pub fn notify_checkpoint_complete(&self, checkpoint: EpochId) {
        let reclaimed = self.store.write().reclaim(checkpoint);
        self.counters.count_reclaimed_slices(reclaimed);
    }

    /// Rewinds the consumer's cursor to the earliest retained epoch.
    pub fn notify_downstream_failure(&self, consumer: ConsumerId) {
        let mut cursors = self.cursors.lock();
        let earliest = self.store.read().earliest_retained();
        cursors.reset(consumer, earliest);
    }

    /// Forgets the consumer's cursor.
    pub fn unregister_consumer(&self, consumer: ConsumerId) {
        self.cursors.lock().remove(consumer);
    }

    /// Total live bytes.
    pub fn log_length(&self) -> usize {
        self.store.read().log_length()
    }

    /// Releases the backing storage and invalidates all cursors.
    /// Idempotent; operations on a closed log are empty no-ops.
    pub fn close(&self) {
        let mut cursors = self.cursors.lock();
        cursors.clear();
        self.store.write().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> Arc<LogCounters> {
        Arc::new(LogCounters::new())
    }

    fn local() -> LocalThreadLog {
        LocalThreadLog::new(counters())
    }

    fn consumer(id: u64) -> ConsumerId {
        ConsumerId::from(id)
    }

    fn epoch(id: u64) -> EpochId {
        EpochId::from(id)
    }

    fn rng_bytes(values: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &value in values {
            bytes.extend_from_slice(&Determinant::Rng(value).serialize());
        }
        bytes
    }

    #[test]
    fn single_producer_single_consumer_one_epoch() {
        let mut log = local();
        for value in [7, 11, 13] {
            log.append_determinant(&Determinant::Rng(value), epoch(42))
                .unwrap();
        }

        let delta = log.next_delta_for(consumer(0), epoch(42));
        assert_eq!(delta.offset(), 0);
        assert_eq!(delta.bytes().len(), 15);
        assert_eq!(delta.bytes(), &rng_bytes(&[7, 11, 13])[..]);

        // no further appends: the second read is empty
        let again = log.next_delta_for(consumer(0), epoch(42));
        assert!(again.is_empty());
    }

    #[test]
    fn delivery_is_a_prefix_continuation() {
        let mut log = local();
        log.append_determinant(&Determinant::Rng(1), epoch(0)).unwrap();
        let first = log.next_delta_for(consumer(9), epoch(0));
        log.append_determinant(&Determinant::Rng(2), epoch(0)).unwrap();
        log.append_determinant(&Determinant::Rng(3), epoch(0)).unwrap();
        let second = log.next_delta_for(consumer(9), epoch(0));

        assert_eq!(second.offset(), first.end_offset());
        let mut replayed = first.bytes().to_vec();
        replayed.extend_from_slice(second.bytes());
        assert_eq!(replayed, rng_bytes(&[1, 2, 3]));
    }

    #[test]
    fn epoch_rollover_and_reclamation() {
        let mut log = local();
        log.append_determinant(&Determinant::Rng(1), epoch(1)).unwrap();
        log.append_determinant(&Determinant::Rng(2), epoch(2)).unwrap();
        log.append_determinant(&Determinant::Rng(3), epoch(3)).unwrap();

        log.notify_checkpoint_complete(epoch(2));
        assert_eq!(log.store.slices.len(), 2);
        assert_eq!(log.store.earliest_retained(), epoch(2));
        assert_eq!(log.log_length(), 10);

        // a reclaimed epoch reads empty
        assert!(log.next_delta_for(consumer(0), epoch(1)).is_empty());
        let delta = log.next_delta_for(consumer(0), epoch(3));
        assert_eq!(delta.bytes(), &rng_bytes(&[3])[..]);
    }

    #[test]
    fn checkpoint_at_or_below_oldest_retained_is_a_noop() {
        let mut log = local();
        log.append_determinant(&Determinant::Rng(1), epoch(5)).unwrap();
        log.notify_checkpoint_complete(epoch(5));
        log.notify_checkpoint_complete(epoch(5));
        log.notify_checkpoint_complete(epoch(3));
        assert_eq!(log.store.slices.len(), 1);
        assert_eq!(log.log_length(), 5);
    }

    #[test]
    fn appends_behind_the_tip_are_rejected() {
        let mut log = local();
        log.append_determinant(&Determinant::Rng(1), epoch(4)).unwrap();
        let err = log
            .append_determinant(&Determinant::Rng(2), epoch(3))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThreadLog);

        log.notify_checkpoint_complete(epoch(4));
        let err = log
            .append_determinant(&Determinant::Rng(2), epoch(2))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThreadLog);
    }

    #[test]
    fn growth_preserves_bytes_and_cursors() {
        let mut log = LocalThreadLog {
            store: EpochStore::with_capacity(16, usize::MAX),
            cursors: CursorTable::new(),
            counters: counters(),
        };
        log.append_determinant(&Determinant::Rng(0), epoch(0)).unwrap();
        let first = log.next_delta_for(consumer(1), epoch(0));
        assert_eq!(first.bytes().len(), 5);

        // push the buffer through several doublings
        let values: Vec<u32> = (1..64).collect();
        for &value in &values {
            log.append_determinant(&Determinant::Rng(value), epoch(0))
                .unwrap();
        }

        let second = log.next_delta_for(consumer(1), epoch(0));
        assert_eq!(second.offset(), 5);
        assert_eq!(second.bytes(), &rng_bytes(&values)[..]);
    }

    #[test]
    fn wrapped_slices_read_contiguously() {
        let mut log = LocalThreadLog {
            store: EpochStore::with_capacity(16, usize::MAX),
            cursors: CursorTable::new(),
            counters: counters(),
        };
        log.append_determinant(&Determinant::Rng(1), epoch(1)).unwrap();
        log.append_determinant(&Determinant::Rng(2), epoch(1)).unwrap();
        log.append_determinant(&Determinant::Rng(3), epoch(2)).unwrap();
        log.notify_checkpoint_complete(epoch(2));

        // the epoch 2 slice now starts mid-buffer and wraps as it grows
        log.append_determinant(&Determinant::Rng(4), epoch(2)).unwrap();
        log.append_determinant(&Determinant::Rng(5), epoch(2)).unwrap();

        let delta = log.next_delta_for(consumer(0), epoch(2));
        assert_eq!(delta.bytes(), &rng_bytes(&[3, 4, 5])[..]);
    }

    #[test]
    fn capacity_exhaustion_surfaces_to_the_producer() {
        let mut log = LocalThreadLog::with_limit(8, counters());
        log.append_determinant(&Determinant::Rng(1), epoch(0)).unwrap();
        let err = log
            .append_determinant(&Determinant::Rng(2), epoch(0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
    }

    #[test]
    fn downstream_failure_replays_from_the_earliest_retained_epoch() {
        let mut log = local();
        log.append_determinant(&Determinant::Rng(1), epoch(5)).unwrap();
        log.append_determinant(&Determinant::Rng(2), epoch(6)).unwrap();
        log.append_determinant(&Determinant::Rng(3), epoch(7)).unwrap();
        for e in 5..=7 {
            log.next_delta_for(consumer(3), epoch(e));
        }
        assert!(log.next_delta_for(consumer(3), epoch(7)).is_empty());

        log.notify_downstream_failure(consumer(3));
        let mut replayed = Vec::new();
        for e in 5..=7 {
            let delta = log.next_delta_for(consumer(3), epoch(e));
            assert_eq!(delta.offset(), 0);
            replayed.extend_from_slice(delta.bytes());
        }
        assert_eq!(replayed, rng_bytes(&[1, 2, 3]));
    }

    #[test]
    fn closed_log_is_inert() {
        let mut log = local();
        log.append_determinant(&Determinant::Rng(1), epoch(0)).unwrap();
        log.close();
        log.close();
        assert_eq!(log.log_length(), 0);
        log.append_determinant(&Determinant::Rng(2), epoch(0)).unwrap();
        assert!(log.next_delta_for(consumer(0), epoch(0)).is_empty());
    }

    #[test]
    fn upstream_catch_up_is_idempotent_and_commutative() {
        let a = ThreadLogDelta::new(epoch(5), 0, vec![0x00, 0x01, 0x02, 0x03]);
        let b = ThreadLogDelta::new(epoch(5), 2, vec![0x02, 0x03, 0x04, 0x05]);
        let expected = vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05];

        for order in [[&a, &b], [&b, &a]] {
            let log = UpstreamThreadLog::new(counters());
            for delta in order {
                log.process_delta(delta).unwrap();
            }
            let merged = log.read_from(epoch(0)).unwrap();
            assert_eq!(merged.epoch_id(), epoch(5));
            assert_eq!(merged.bytes(), &expected[..]);
        }
    }

    #[test]
    fn upstream_catch_up_converges_under_any_permutation() {
        let fragments = [
            ThreadLogDelta::new(epoch(2), 0, vec![10, 11, 12]),
            ThreadLogDelta::new(epoch(2), 3, vec![13, 14]),
            ThreadLogDelta::new(epoch(2), 1, vec![11, 12, 13]),
        ];
        let expected = vec![10, 11, 12, 13, 14];

        let permutations = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for permutation in permutations {
            let log = UpstreamThreadLog::new(counters());
            for index in permutation {
                log.process_delta(&fragments[index]).unwrap();
            }
            let merged = log.read_from(epoch(0)).unwrap();
            assert_eq!(merged.bytes(), &expected[..], "order {:?}", permutation);
        }
    }

    #[test]
    fn upstream_discards_fully_stale_deltas() {
        let shared = counters();
        let log = UpstreamThreadLog::new(shared.clone());
        log.process_delta(&ThreadLogDelta::new(epoch(1), 0, vec![1, 2, 3]))
            .unwrap();
        log.process_delta(&ThreadLogDelta::new(epoch(1), 0, vec![1, 2]))
            .unwrap();
        log.process_delta(&ThreadLogDelta::new(epoch(1), 1, vec![2, 3]))
            .unwrap();
        assert_eq!(shared.stale_deltas(), 2);
        assert_eq!(log.log_length(), 3);
    }

    #[test]
    fn upstream_discards_deltas_for_reclaimed_epochs() {
        let shared = counters();
        let log = UpstreamThreadLog::new(shared.clone());
        log.process_delta(&ThreadLogDelta::new(epoch(3), 0, vec![7]))
            .unwrap();
        log.notify_checkpoint_complete(epoch(3));
        log.process_delta(&ThreadLogDelta::new(epoch(2), 0, vec![9]))
            .unwrap();
        assert_eq!(shared.stale_deltas(), 1);
        assert_eq!(log.log_length(), 1);
    }

    #[test]
    fn upstream_discards_deltas_that_would_tear_a_slice() {
        let shared = counters();
        let log = UpstreamThreadLog::new(shared.clone());
        log.process_delta(&ThreadLogDelta::new(epoch(1), 0, vec![1]))
            .unwrap();
        log.process_delta(&ThreadLogDelta::new(epoch(2), 0, vec![2]))
            .unwrap();
        // new bytes claimed for the closed epoch 1
        log.process_delta(&ThreadLogDelta::new(epoch(1), 0, vec![1, 9]))
            .unwrap();
        // an epoch behind the tip that never opened here
        log.process_delta(&ThreadLogDelta::new(epoch(0), 0, vec![9]))
            .unwrap();
        assert_eq!(shared.stale_deltas(), 2);
        assert_eq!(log.log_length(), 2);
    }

    #[test]
    fn parked_fragment_is_merged_once_its_gap_fills() {
        let log = UpstreamThreadLog::new(counters());
        log.process_delta(&ThreadLogDelta::new(epoch(4), 3, vec![3, 4, 5]))
            .unwrap();
        // nothing visible until the prefix arrives
        assert_eq!(log.log_length(), 0);

        log.process_delta(&ThreadLogDelta::new(epoch(4), 0, vec![0, 1, 2]))
            .unwrap();
        assert_eq!(log.store.read().epoch_len(epoch(4)), 6);
        let merged = log.read_from(epoch(4)).unwrap();
        assert_eq!(merged.bytes(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn upstream_delta_dispatch_tracks_cursors() {
        let log = UpstreamThreadLog::new(counters());
        log.process_delta(&ThreadLogDelta::new(epoch(1), 0, vec![1, 2]))
            .unwrap();
        let first = log.next_delta_for(consumer(0), epoch(1));
        assert_eq!(first.bytes(), &[1, 2]);

        log.process_delta(&ThreadLogDelta::new(epoch(1), 2, vec![3, 4]))
            .unwrap();
        let second = log.next_delta_for(consumer(0), epoch(1));
        assert_eq!(second.offset(), 2);
        assert_eq!(second.bytes(), &[3, 4]);
    }

    #[test]
    fn concurrent_catch_up_converges() {
        let log = Arc::new(UpstreamThreadLog::new(counters()));
        let full: Vec<u8> = (0..200).collect();

        let handles: Vec<_> = (0..4usize)
            .map(|t| {
                let log = Arc::clone(&log);
                let full = full.clone();
                std::thread::spawn(move || {
                    // each thread replays overlapping prefixes
                    let mut end = 25 * (t + 1);
                    while end <= full.len() {
                        let delta = ThreadLogDelta::new(epoch(1), 0, full[..end].to_vec());
                        log.process_delta(&delta).unwrap();
                        end += 100;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let merged = log.read_from(epoch(0)).unwrap();
        assert_eq!(merged.bytes(), &full[..]);
    }
}
