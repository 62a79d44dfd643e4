//! State-sync commitment builder. Buffers root-chain events that arrive out
//! of order, releases them strictly by id, and cuts a batch when either the
//! configured size is reached or the oldest buffered event has waited out the
//! time window. Batches are always contiguous: `start_id` of the next batch
//! is exactly `end_id + 1` of the previous one.

use crate::metrics::BridgeMetrics;
use arbor_bridge_types::StateSyncEvent;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct CommitmentBuilder {
    /// Next id to release; everything below has been batched already.
    next_id: u64,
    pending: BTreeMap<u64, StateSyncEvent>,
    batch_size: usize,
    max_wait: Duration,
    window_started: Option<Instant>,
    metrics: Arc<BridgeMetrics>,
}

impl CommitmentBuilder {
    pub fn new(
        next_id: u64,
        batch_size: usize,
        max_wait: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            next_id,
            pending: BTreeMap::new(),
            batch_size: batch_size.max(1),
            max_wait,
            window_started: None,
            metrics,
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffers an observed event. Ids already batched are dropped as
    /// duplicates; out-of-order arrivals wait until the gap closes.
    pub fn observe(&mut self, event: StateSyncEvent) {
        if event.id < self.next_id {
            debug!(id = event.id, "dropping already-batched state sync event");
            return;
        }
        self.metrics.observed_state_sync_events.inc();
        if self.pending.insert(event.id, event).is_none() {
            self.metrics.buffered_state_sync_events.inc();
        }
        if self.window_started.is_none() {
            self.window_started = Some(Instant::now());
        }
    }

    /// The contiguous run available for batching right now.
    fn run_len(&self) -> usize {
        let mut expected = self.next_id;
        let mut len = 0;
        for id in self.pending.keys() {
            if *id != expected {
                break;
            }
            expected += 1;
            len += 1;
        }
        len
    }

    /// Whether a gap is currently blocking release: the lowest buffered id is
    /// ahead of the expected one. Returns `(expected, lowest_buffered)`.
    pub fn blocking_gap(&self) -> Option<(u64, u64)> {
        let lowest = *self.pending.keys().next()?;
        (lowest != self.next_id).then_some((self.next_id, lowest))
    }

    /// Age of the oldest buffered event's wait window.
    pub fn window_elapsed(&self) -> bool {
        self.window_started
            .map(|start| start.elapsed() >= self.max_wait)
            .unwrap_or(false)
    }

    /// Drains and returns the next batch when one is due: the contiguous run
    /// reached the batch size, or the window elapsed with at least one
    /// releasable event.
    pub fn ready_batch(&mut self) -> Option<Vec<StateSyncEvent>> {
        let run = self.run_len();
        if run == 0 {
            if self.window_elapsed() {
                if let Some((expected, got)) = self.blocking_gap() {
                    warn!(expected, got, "state sync stream stalled on a gap");
                }
            }
            return None;
        }
        if run < self.batch_size && !self.window_elapsed() {
            return None;
        }
        Some(self.drain_run(run.min(self.batch_size)))
    }

    /// Drains whatever contiguous run exists regardless of size or window.
    /// Used on shutdown so buffered events are not stranded.
    pub fn force_flush(&mut self) -> Option<Vec<StateSyncEvent>> {
        let run = self.run_len();
        (run > 0).then(|| self.drain_run(run))
    }

    fn drain_run(&mut self, len: usize) -> Vec<StateSyncEvent> {
        let mut batch = Vec::with_capacity(len);
        for _ in 0..len {
            let (_, event) = self
                .pending
                .remove_entry(&self.next_id)
                .expect("run length counted over contiguous keys");
            batch.push(event);
            self.next_id += 1;
            self.metrics.buffered_state_sync_events.dec();
        }
        self.window_started = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        batch
    }
}
