//! The job causal log: the top-level composition, threading and
//! protocol orchestration of the causal logging core.
//!
//! One instance per running task. It owns the local vertex's causal log
//! behind the vertex-wide lock shared with the operator runtime, a
//! concurrent table of upstream vertex logs fed by peer replicas, and
//! the sharing depth filter applied to both the delta stream and bulk
//! recovery.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::causal::collections::{self, HashMap};
use crate::causal::counters::LogCounters;
use crate::causal::delta::{DeterminantRequest, DeterminantResponse, VertexLogDelta};
use crate::causal::error::*;
use crate::causal::ordering::EpochId;
use crate::causal::vertex::{LocalVertexLog, UpstreamVertexLog};
use crate::causal::{ConsumerId, PartitionId, PartitionKey, VertexId};

/// Represents a configuration used to bootstrap a `JobLog`.
pub struct JobLogConfig {
    /// The id of the vertex this task runs.
    pub vertex: VertexId,
    /// The output layout of the vertex: one entry per intermediate
    /// result partition, with its subpartition count. Source vertices
    /// may leave it empty.
    pub layout: Vec<(PartitionId, u32)>,
    /// Topological distance from the local vertex to every other
    /// vertex in scope: negative upstream, positive downstream, zero
    /// for the vertex itself.
    pub distances: HashMap<VertexId, i32>,
    /// Determinant sharing depth `d`: a vertex is in the delta stream
    /// iff its distance is within `d` hops. `-1` means no limit, `0`
    /// means nothing is shared downstream.
    pub sharing_depth: i32,
}

/// Holds the vertex-wide lock, and with it the producer side of the
/// local vertex log.
///
/// The operator runtime keeps the guard for the duration of its
/// critical section; every `append_determinant*` call is a method of
/// the guarded log, so appending without the lock is unrepresentable,
/// and no second lock guards the same critical section.
pub struct VertexGuard<'a> {
    inner: MutexGuard<'a, LocalVertexLog>,
}

impl Deref for VertexGuard<'_> {
    type Target = LocalVertexLog;

    #[inline]
    fn deref(&self) -> &LocalVertexLog {
        &self.inner
    }
}

impl DerefMut for VertexGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut LocalVertexLog {
        &mut self.inner
    }
}

/// The causal logging core of one running task.
///
/// Producer appends go through [`JobLog::lock`]; everything else locks
/// internally and briefly, and may be called from network I/O threads
/// and the checkpoint coordinator concurrently.
pub struct JobLog {
    local: Mutex<LocalVertexLog>,
    upstream: RwLock<HashMap<VertexId, Arc<UpstreamVertexLog>>>,
    distances: HashMap<VertexId, i32>,
    sharing_depth: i32,
    counters: Arc<LogCounters>,
    closed: AtomicBool,
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog").finish_non_exhaustive()
    }
}

impl JobLog {
    /// Bootstraps the causal log of one task from its configuration.
    pub fn new(config: JobLogConfig) -> Result<Self> {
        if config.sharing_depth < -1 {
            return Err("Sharing depth below -1").wrapped(ErrorKind::Config);
        }
        let counters = Arc::new(LogCounters::new());
        let local = LocalVertexLog::new(config.vertex, &config.layout, counters.clone());
        Ok(Self {
            local: Mutex::new(local),
            upstream: RwLock::new(collections::hash_map()),
            distances: config.distances,
            sharing_depth: config.sharing_depth,
            counters,
            closed: AtomicBool::new(false),
        })
    }

    /// Acquires the vertex-wide lock, exposing the producer side of
    /// the local vertex log for the duration of the guard.
    pub fn lock(&self) -> VertexGuard<'_> {
        VertexGuard {
            inner: self.local.lock(),
        }
    }

    /// Routes one upstream vertex delta to the accumulator of its
    /// vertex, creating the accumulator on first contact. Safe to call
    /// from network I/O threads concurrently with producer appends.
    pub fn process_upstream_delta(&self, delta: &VertexLogDelta) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.upstream_log(delta.vertex()).process_delta(delta)
    }

    /// Registers a downstream consumer reading the given subpartition
    /// of the local vertex. Cursor creation is deferred to the first
    /// delta read, on the local log and on every upstream log alike.
    pub fn register_downstream_consumer(
        &self,
        consumer: ConsumerId,
        key: PartitionKey,
    ) -> Result<()> {
        self.local.lock().register_downstream_consumer(consumer, key)
    }

    /// Forgets a downstream consumer everywhere.
    pub fn unregister_downstream_consumer(&self, consumer: ConsumerId) {
        self.local.lock().unregister_downstream_consumer(consumer);
        for (_, log) in self.upstream_snapshot() {
            log.unregister_consumer(consumer);
        }
    }

    /// Assembles the delta stream for one consumer and one epoch:
    /// the local vertex delta plus one delta per upstream vertex
    /// within the sharing depth. Deltas with no updates are elided,
    /// and each delta is self-describing by vertex id.
    pub fn get_next_determinants_for_downstream(
        &self,
        consumer: ConsumerId,
        epoch: EpochId,
    ) -> Vec<VertexLogDelta> {
        if self.closed.load(Ordering::Acquire) {
            return Vec::new();
        }
        let mut deltas = Vec::new();
        if self.sharing_depth != 0 {
            let delta = self.local.lock().next_delta_for(consumer, epoch);
            if delta.has_updates() {
                deltas.push(delta);
            }
        }
        for (vertex, log) in self.upstream_snapshot() {
            if !self.within_depth(vertex) {
                continue;
            }
            let delta = log.next_delta_for(consumer, epoch);
            if delta.has_updates() {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Serves a bulk recovery request: every determinant retained for
    /// the requested vertex from its start epoch through the tip.
    ///
    /// Vertices outside the sharing depth are answered negatively, and
    /// the requester is expected to ask another replica. A first
    /// request for an in-scope vertex creates its empty accumulator,
    /// so that later streaming deltas land somewhere.
    pub fn respond_to_determinant_request(
        &self,
        request: &DeterminantRequest,
    ) -> DeterminantResponse {
        let vertex = request.vertex();
        if self.closed.load(Ordering::Acquire) {
            return DeterminantResponse::not_found(vertex);
        }
        if !self.within_depth(vertex) {
            self.counters.count_filtered_request();
            debug!(
                "refusing determinant request for out-of-depth vertex {:?}",
                vertex
            );
            return DeterminantResponse::not_found(vertex);
        }
        let payload = self.upstream_log(vertex).read_from(request.start_epoch());
        DeterminantResponse::new(vertex, payload)
    }

    /// Broadcasts checkpoint completion: the local log reclaims every
    /// epoch below `checkpoint`, upstream logs lag by one checkpoint
    /// because the remote producer's completion clock may trail.
    pub fn notify_checkpoint_complete(&self, checkpoint: EpochId) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.local.lock().notify_checkpoint_complete(checkpoint);
        if let Some(lagged) = checkpoint.prev() {
            for (_, log) in self.upstream_snapshot() {
                log.notify_checkpoint_complete(lagged);
            }
        }
    }

    /// Rewinds one consumer everywhere, so its replacement replica is
    /// replayed from the oldest in-scope determinant.
    pub fn notify_downstream_failure(&self, consumer: ConsumerId) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.local.lock().notify_downstream_failure(consumer);
        for (_, log) in self.upstream_snapshot() {
            log.notify_downstream_failure(consumer);
        }
    }

    /// Total live bytes across the local and every upstream log.
    pub fn log_length(&self) -> usize {
        self.local.lock().log_length()
            + self
                .upstream_snapshot()
                .into_iter()
                .map(|(_, log)| log.log_length())
                .sum::<usize>()
    }

    /// The anomaly counters shared by every component of this log.
    pub fn counters(&self) -> &LogCounters {
        &self.counters
    }

    /// Closes the local and every upstream log and stops accepting
    /// work. Idempotent; in-flight readers observe either the
    /// pre-close state or empty deltas.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.local.lock().close();
        for (_, log) in self.upstream_snapshot() {
            log.close();
        }
    }

    // depth filter: at unbounded depth everything is in scope, else a
    // vertex qualifies by the magnitude of its recorded distance
    fn within_depth(&self, vertex: VertexId) -> bool {
        if self.sharing_depth < 0 {
            return true;
        }
        match self.distances.get(&vertex) {
            Some(distance) => distance.unsigned_abs() <= self.sharing_depth as u32,
            None => false,
        }
    }

    fn upstream_snapshot(&self) -> Vec<(VertexId, Arc<UpstreamVertexLog>)> {
        self.upstream
            .read()
            .iter()
            .map(|(&vertex, log)| (vertex, Arc::clone(log)))
            .collect()
    }

    fn upstream_log(&self, vertex: VertexId) -> Arc<UpstreamVertexLog> {
        if let Some(log) = self.upstream.read().get(&vertex) {
            return Arc::clone(log);
        }
        let mut upstream = self.upstream.write();
        Arc::clone(upstream.entry(vertex).or_insert_with(|| {
            Arc::new(UpstreamVertexLog::new(vertex, self.counters.clone()))
        }))
    }
}
