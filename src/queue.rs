//! Depth counters and the micro-batching queue (spec.md §4.D, §5).
//!
//! Grounded on the teacher's `forwarding.rs` fan-out helper combined with
//! the ordering discipline called out in spec.md §5/§9: the admission
//! check and the depth increment must share a critical section, with no
//! `await` between them, even though the request it admits may not
//! reach the worker (or even the queue) until well after the check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::policy::{check_admission, AdmissionResult};
use crate::worker::WorkerClient;

/// `pending + in_flight`, shared between the orchestrator and the queue.
#[derive(Debug, Default)]
pub struct Counters {
    pending: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> u64 {
        self.pending() + self.in_flight()
    }

    /// Atomic pre-increment-then-check for the direct (non-batch) path,
    /// where there is no queue mutex to hold across check+increment
    /// (spec.md §5 "atomic pre-increment and decrementing on reject").
    ///
    /// The admission decision and the degradation tier are both computed
    /// against the depth *already in the system*, i.e. the counter value
    /// before this request's own reservation -- `fetch_add` still
    /// serializes concurrent callers (each gets a distinct `before`), so
    /// this cannot overshoot: a request is only admitted if the depth it
    /// observed was itself within bounds, and a rejected reservation is
    /// rolled back before any other caller can observe it.
    pub fn try_admit_in_flight(&self, q_max: u32) -> (AdmissionResult, u64) {
        let before = self.in_flight.fetch_add(1, Ordering::SeqCst);
        let depth_before = self.pending() + before;
        let result = check_admission(depth_before, q_max);
        if !result.admitted {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        (result, depth_before)
    }

    /// As `try_admit_in_flight`, but reserves a `pending` slot instead --
    /// used by the batching path, where the reservation is made at
    /// admission time and the request itself is pushed onto the queue
    /// later, once degradation has been applied.
    pub fn try_admit_pending(&self, q_max: u32) -> (AdmissionResult, u64) {
        let before = self.pending.fetch_add(1, Ordering::SeqCst);
        let depth_before = before + self.in_flight();
        let result = check_admission(depth_before, q_max);
        if !result.admitted {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        (result, depth_before)
    }

    pub fn release_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn release_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn move_pending_to_in_flight(&self, n: u64) {
        self.pending.fetch_sub(n, Ordering::SeqCst);
        self.in_flight.fetch_add(n, Ordering::SeqCst);
    }

    fn release_in_flight_by(&self, n: u64) {
        self.in_flight.fetch_sub(n, Ordering::SeqCst);
    }
}

/// Decrements `in_flight` on every exit path from the direct-forward
/// branch of the orchestrator, including early returns and panics.
pub struct InFlightGuard<'a> {
    counters: &'a Counters,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    pub fn new(counters: &'a Counters) -> Self {
        Self {
            counters,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counters.release_in_flight();
        }
    }
}

/// One client response, as produced by a direct forward or a flush.
#[derive(Debug, Clone)]
pub struct FlushedResponse {
    pub status: StatusCode,
    pub body: Value,
}

struct PendingRequest {
    body: Value,
    #[allow(dead_code)] // kept for future latency instrumentation
    arrival: Instant,
    tx: oneshot::Sender<FlushedResponse>,
}

struct QueueState {
    items: Vec<PendingRequest>,
    flush_scheduled: bool,
}

/// Holds requests during the micro-batch window and fans them out in one
/// concurrent burst per window. `batch_window` of zero is never handed
/// to this type -- the orchestrator bypasses it entirely per spec.md §4.D.
pub struct BatchingQueue {
    state: Mutex<QueueState>,
    batch_window: Duration,
    client: Arc<WorkerClient>,
    counters: Arc<Counters>,
}

impl BatchingQueue {
    pub fn new(batch_window: Duration, client: Arc<WorkerClient>, counters: Arc<Counters>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: Vec::new(),
                flush_scheduled: false,
            }),
            batch_window,
            client,
            counters,
        })
    }

    /// Push an already-admitted request (its `pending` slot was reserved
    /// by `Counters::try_admit_pending` at the orchestrator's admission
    /// step, before the supervisor was touched -- spec.md §4.E) onto the
    /// queue, scheduling a flush if none is outstanding.
    pub async fn enqueue_reserved(self: &Arc<Self>, body: Value) -> oneshot::Receiver<FlushedResponse> {
        let (tx, rx) = oneshot::channel();
        let mut schedule = false;
        {
            let mut guard = self.state.lock().await;
            guard.items.push(PendingRequest {
                body,
                arrival: Instant::now(),
                tx,
            });
            if !guard.flush_scheduled {
                guard.flush_scheduled = true;
                schedule = true;
            }
        }

        if schedule {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(this.batch_window).await;
                this.flush().await;
            });
        }

        rx
    }

    /// Convenience wrapper combining admission and enqueue under the
    /// queue mutex, for callers (tests, and any non-orchestrator use)
    /// that have not already reserved a `pending` slot themselves.
    pub async fn enqueue(self: &Arc<Self>, body: Value) -> Result<oneshot::Receiver<FlushedResponse>, AdmissionResult> {
        self.enqueue_with_bound(body, u32::MAX).await
    }

    pub async fn enqueue_with_bound(
        self: &Arc<Self>,
        body: Value,
        q_max: u32,
    ) -> Result<oneshot::Receiver<FlushedResponse>, AdmissionResult> {
        let (admission, _depth) = self.counters.try_admit_pending(q_max);
        if !admission.admitted {
            return Err(admission);
        }
        Ok(self.enqueue_reserved(body).await)
    }

    /// Swap the batch out, release the mutex, then fan out concurrently.
    /// Per spec.md §9, a new flush may be scheduled (and may even
    /// complete) before this one finishes -- `flush_scheduled` is
    /// cleared before any `await` on the upstream calls.
    async fn flush(self: Arc<Self>) {
        let batch = {
            let mut guard = self.state.lock().await;
            guard.flush_scheduled = false;
            std::mem::take(&mut guard.items)
        };
        if batch.is_empty() {
            return;
        }

        let n = batch.len() as u64;
        self.counters.move_pending_to_in_flight(n);
        info!(batch_size = n, "flushing batch");

        let calls = batch.into_iter().map(|req| {
            let client = Arc::clone(&self.client);
            async move {
                let result = client.forward_chat_completions(&req.body).await;
                (req.tx, result)
            }
        });
        let results = futures::future::join_all(calls).await;

        for (tx, result) in results {
            let response = match result {
                Ok(forwarded) => FlushedResponse {
                    status: forwarded.status,
                    body: forwarded.body,
                },
                Err(e) => {
                    warn!(error = %e, "flush: upstream call failed");
                    FlushedResponse {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                        body: serde_json::json!({"error": e.to_string()}),
                    }
                }
            };
            let _ = tx.send(response);
        }

        self.counters.release_in_flight_by(n);
    }
}
