//! Vertex causal logs: the per-vertex composition of thread causal
//! logs, and per-consumer vertex delta assembly.
//!
//! A consumer is causally affected only by the subpartition it actually
//! reads plus the vertex's main thread determinants, so the local
//! flavor forwards exactly those two logs to each consumer. Upstream
//! content arrives pre-flattened from the producing replica, so the
//! upstream flavor forwards everything it accumulates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::causal::collections::{self, HashMap, OrderedMap};
use crate::causal::counters::LogCounters;
use crate::causal::delta::VertexLogDelta;
use crate::causal::determinant::Determinant;
use crate::causal::error::*;
use crate::causal::ordering::EpochId;
use crate::causal::thread::{LocalThreadLog, UpstreamThreadLog};
use crate::causal::{ConsumerId, PartitionId, PartitionKey, VertexId};

/// The causal log of this replica's own vertex: one main thread log
/// plus one log per (partition, subpartition) pair of its output
/// layout, which is fixed at construction.
///
/// All mutating access happens under the vertex-wide lock; the job log
/// enforces that by owning instances of this type behind it.
pub struct LocalVertexLog {
    vertex: VertexId,
    main: LocalThreadLog,
    subpartitions: OrderedMap<PartitionKey, LocalThreadLog>,
    consumer_partitions: HashMap<ConsumerId, PartitionKey>,
    counters: Arc<LogCounters>,
}

impl LocalVertexLog {
    /// Creates the log for `vertex`, with one subpartition log per
    /// entry of `layout`: each `(partition, subpartition count)` pair
    /// contributes that many keys. Source vertices may pass an empty
    /// layout.
    pub fn new(
        vertex: VertexId,
        layout: &[(PartitionId, u32)],
        counters: Arc<LogCounters>,
    ) -> Self {
        let mut subpartitions = collections::ordered_map();
        for &(partition, subs) in layout {
            for sub in 0..subs {
                subpartitions.insert(
                    PartitionKey::new(partition, sub),
                    LocalThreadLog::new(counters.clone()),
                );
            }
        }
        Self {
            vertex,
            main: LocalThreadLog::new(counters.clone()),
            subpartitions,
            consumer_partitions: collections::hash_map(),
            counters,
        }
    }

    /// The vertex this log belongs to.
    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    /// Appends a main thread determinant to `epoch`.
    pub fn append_determinant(&mut self, determinant: &Determinant, epoch: EpochId) -> Result<()> {
        self.main.append_determinant(determinant, epoch)
    }

    /// Appends a determinant produced while emitting to `key` to that
    /// subpartition's log.
    pub fn append_subpartition_determinant(
        &mut self,
        determinant: &Determinant,
        epoch: EpochId,
        key: PartitionKey,
    ) -> Result<()> {
        let log = self
            .subpartitions
            .get_mut(&key)
            .ok_or_else(|| Error::wrapped(ErrorKind::VertexLog, "Unknown subpartition"))?;
        log.append_determinant(determinant, epoch)
    }

    /// Records which subpartition `consumer` reads. Cursor creation is
    /// deferred to the first delta read.
    pub fn register_downstream_consumer(
        &mut self,
        consumer: ConsumerId,
        key: PartitionKey,
    ) -> Result<()> {
        if !self.subpartitions.contains_key(&key) {
            return Err("Unknown subpartition").wrapped(ErrorKind::VertexLog);
        }
        self.consumer_partitions.insert(consumer, key);
        Ok(())
    }

    /// Forgets the consumer's routing and any cursor it holds.
    pub fn unregister_downstream_consumer(&mut self, consumer: ConsumerId) {
        self.consumer_partitions.remove(&consumer);
        self.main.unregister_consumer(consumer);
        for log in self.subpartitions.values_mut() {
            log.unregister_consumer(consumer);
        }
    }

    /// Assembles the consumer's vertex delta for `epoch`: the main
    /// thread delta plus the one subpartition delta the consumer
    /// reads. Empty thread deltas are elided.
    pub fn next_delta_for(&mut self, consumer: ConsumerId, epoch: EpochId) -> VertexLogDelta {
        let mut delta = VertexLogDelta::empty(self.vertex);
        delta.set_main(self.main.next_delta_for(consumer, epoch));
        match self.consumer_partitions.get(&consumer).copied() {
            Some(key) => {
                // safe to use unwrap(): registration validated the key
                let log = self.subpartitions.get_mut(&key).unwrap();
                delta.insert_subpartition(key, log.next_delta_for(consumer, epoch));
            }
            None => {
                self.counters.count_unknown_consumer();
                debug!("vertex delta read by unrouted consumer {:?}", consumer);
            }
        }
        delta
    }

    /// Reclaims every epoch below `checkpoint` in every owned log.
    pub fn notify_checkpoint_complete(&mut self, checkpoint: EpochId) {
        self.main.notify_checkpoint_complete(checkpoint);
        for log in self.subpartitions.values_mut() {
            log.notify_checkpoint_complete(checkpoint);
        }
    }

    /// Rewinds the consumer to the earliest retained epoch of the logs
    /// it reads.
    pub fn notify_downstream_failure(&mut self, consumer: ConsumerId) {
        self.main.notify_downstream_failure(consumer);
        if let Some(key) = self.consumer_partitions.get(&consumer).copied() {
            // safe to use unwrap(): registration validated the key
            self.subpartitions
                .get_mut(&key)
                .unwrap()
                .notify_downstream_failure(consumer);
        }
    }

    /// Total live bytes across every owned log.
    pub fn log_length(&self) -> usize {
        self.main.log_length()
            + self
                .subpartitions
                .values()
                .map(LocalThreadLog::log_length)
                .sum::<usize>()
    }

    /// Closes every owned log. Idempotent.
    pub fn close(&mut self) {
        self.main.close();
        for log in self.subpartitions.values_mut() {
            log.close();
        }
        self.consumer_partitions.clear();
    }
}

/// The accumulated causal log of one upstream vertex, fed by deltas
/// from peer replicas.
///
/// One upstream thread log carries the main thread content; a sparse
/// table of further logs is populated lazily as subpartition deltas
/// arrive. Network I/O threads call every method concurrently.
pub struct UpstreamVertexLog {
    vertex: VertexId,
    main: UpstreamThreadLog,
    subpartitions: RwLock<OrderedMap<PartitionKey, Arc<UpstreamThreadLog>>>,
    counters: Arc<LogCounters>,
    closed: AtomicBool,
}

impl UpstreamVertexLog {
    /// Creates an empty accumulator for `vertex`.
    pub fn new(vertex: VertexId, counters: Arc<LogCounters>) -> Self {
        Self {
            vertex,
            main: UpstreamThreadLog::new(counters.clone()),
            subpartitions: RwLock::new(collections::ordered_map()),
            counters,
            closed: AtomicBool::new(false),
        }
    }

    /// The upstream vertex this log accumulates for.
    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    /// Applies one vertex delta received from a peer replica,
    /// creating subpartition logs as new keys appear.
    pub fn process_delta(&self, delta: &VertexLogDelta) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(main) = delta.main() {
            self.main.process_delta(main)?;
        }
        for (&key, sub) in delta.subpartitions() {
            self.subpartition(key).process_delta(sub)?;
        }
        Ok(())
    }

    /// Assembles the consumer's vertex delta for `epoch`: everything
    /// new across the main log and every subpartition log. Empty
    /// thread deltas are elided.
    pub fn next_delta_for(&self, consumer: ConsumerId, epoch: EpochId) -> VertexLogDelta {
        let mut delta = VertexLogDelta::empty(self.vertex);
        delta.set_main(self.main.next_delta_for(consumer, epoch));
        for (key, log) in self.snapshot() {
            delta.insert_subpartition(key, log.next_delta_for(consumer, epoch));
        }
        delta
    }

    /// Every determinant retained from `start_epoch` through the tip,
    /// across every owned log, for bulk recovery.
    pub fn read_from(&self, start_epoch: EpochId) -> VertexLogDelta {
        let mut delta = VertexLogDelta::empty(self.vertex);
        if let Some(main) = self.main.read_from(start_epoch) {
            delta.set_main(main);
        }
        for (key, log) in self.snapshot() {
            if let Some(sub) = log.read_from(start_epoch) {
                delta.insert_subpartition(key, sub);
            }
        }
        delta
    }

    /// Reclaims every epoch below `checkpoint` in every owned log.
    pub fn notify_checkpoint_complete(&self, checkpoint: EpochId) {
        self.main.notify_checkpoint_complete(checkpoint);
        for (_, log) in self.snapshot() {
            log.notify_checkpoint_complete(checkpoint);
        }
    }

    /// Rewinds the consumer to the earliest retained epoch of every
    /// owned log.
    pub fn notify_downstream_failure(&self, consumer: ConsumerId) {
        self.main.notify_downstream_failure(consumer);
        for (_, log) in self.snapshot() {
            log.notify_downstream_failure(consumer);
        }
    }

    /// Forgets the consumer's cursors.
    pub fn unregister_consumer(&self, consumer: ConsumerId) {
        self.main.unregister_consumer(consumer);
        for (_, log) in self.snapshot() {
            log.unregister_consumer(consumer);
        }
    }

    /// Total live bytes across every owned log.
    pub fn log_length(&self) -> usize {
        self.main.log_length()
            + self
                .snapshot()
                .into_iter()
                .map(|(_, log)| log.log_length())
                .sum::<usize>()
    }

    /// Closes every owned log and stops accepting deltas. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.main.close();
        for (_, log) in self.snapshot() {
            log.close();
        }
    }

    // the snapshot keeps delta application off the table lock
    fn snapshot(&self) -> Vec<(PartitionKey, Arc<UpstreamThreadLog>)> {
        self.subpartitions
            .read()
            .iter()
            .map(|(&key, log)| (key, Arc::clone(log)))
            .collect()
    }

    fn subpartition(&self, key: PartitionKey) -> Arc<UpstreamThreadLog> {
        if let Some(log) = self.subpartitions.read().get(&key) {
            return Arc::clone(log);
        }
        let mut subpartitions = self.subpartitions.write();
        Arc::clone(
            subpartitions
                .entry(key)
                .or_insert_with(|| Arc::new(UpstreamThreadLog::new(self.counters.clone()))),
        )
    }
}
