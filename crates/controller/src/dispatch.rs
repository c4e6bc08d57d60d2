//! Dispatch loop: coalescing work queue, bounded reconcile fan-out, per-key
//! serialization, requeues and error backoff.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use provis_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Controller, Outcome};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Upper bound on reconciles in flight at once (distinct keys only).
    pub max_concurrent: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

type Completion = (ObjectKey, anyhow::Result<Outcome>);

/// Spawn the dispatch loop for one controller. Runs until `token` fires.
pub fn spawn_dispatcher(
    controller: Arc<dyn Controller>,
    source: mpsc::Receiver<ObjectKey>,
    opts: Options,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        Dispatcher::new(controller, opts, token).run(source).await;
    })
}

struct Dispatcher {
    controller: Arc<dyn Controller>,
    opts: Options,
    token: CancellationToken,
    /// FIFO of keys ready to reconcile; `queued` mirrors it for dedup.
    ready: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    /// Keys with a reconcile in flight. A key is never in `ready` and here
    /// at once; that is what serializes reconciles per key.
    in_flight: FxHashSet<ObjectKey>,
    /// Keys that received an event while their reconcile was in flight.
    dirty: FxHashSet<ObjectKey>,
    /// Consecutive failures per key; cleared on success.
    failures: FxHashMap<ObjectKey, u32>,
    /// Future wakeups (requeues and backoff retries), earliest first.
    delayed: BinaryHeap<Reverse<(Instant, ObjectKey)>>,
}

impl Dispatcher {
    fn new(controller: Arc<dyn Controller>, opts: Options, token: CancellationToken) -> Self {
        Self {
            controller,
            opts,
            token,
            ready: VecDeque::new(),
            queued: FxHashSet::default(),
            in_flight: FxHashSet::default(),
            dirty: FxHashSet::default(),
            failures: FxHashMap::default(),
            delayed: BinaryHeap::new(),
        }
    }

    async fn run(mut self, mut source: mpsc::Receiver<ObjectKey>) {
        let name = self.controller.name();
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(self.opts.max_concurrent.max(1));
        let shutdown = self.token.clone();
        let mut source_open = true;
        debug!(controller = name, "dispatcher started");
        loop {
            self.launch_ready(&done_tx);
            let next_wakeup = self.delayed.peek().map(|Reverse((at, _))| *at);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some((key, res)) = done_rx.recv() => self.complete(key, res),
                maybe = source.recv(), if source_open => match maybe {
                    Some(key) => self.enqueue(key),
                    None => {
                        debug!(controller = name, "event source closed");
                        source_open = false;
                    }
                },
                _ = sleep_until(next_wakeup.unwrap_or_else(Instant::now)), if next_wakeup.is_some() => {
                    self.pop_due();
                }
            }
        }
        debug!(controller = name, "dispatcher stopped");
    }

    fn enqueue(&mut self, key: ObjectKey) {
        if self.in_flight.contains(&key) {
            // Re-run after the current pass completes; the later observation
            // wins without two reconciles for one key overlapping.
            self.dirty.insert(key);
            return;
        }
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    fn pop_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, _))) = self.delayed.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, key))) = self.delayed.pop() {
                self.enqueue(key);
            }
        }
    }

    fn launch_ready(&mut self, done_tx: &mpsc::Sender<Completion>) {
        while self.in_flight.len() < self.opts.max_concurrent {
            let Some(key) = self.ready.pop_front() else { break };
            self.queued.remove(&key);
            self.in_flight.insert(key.clone());
            let controller = Arc::clone(&self.controller);
            let done = done_tx.clone();
            let ctx = self.token.child_token();
            let name = controller.name();
            tokio::spawn(async move {
                let t0 = std::time::Instant::now();
                let res = controller.reconcile(&ctx, key.clone()).await;
                histogram!(
                    "reconcile_duration_ms",
                    t0.elapsed().as_secs_f64() * 1000.0,
                    "controller" => name
                );
                let _ = done.send((key, res)).await;
            });
        }
    }

    fn complete(&mut self, key: ObjectKey, res: anyhow::Result<Outcome>) {
        self.in_flight.remove(&key);
        let name = self.controller.name();
        match res {
            Ok(outcome) => {
                self.failures.remove(&key);
                counter!("reconcile_total", 1u64, "controller" => name, "result" => "ok");
                if self.dirty.remove(&key) {
                    self.enqueue(key);
                } else if let Some(after) = outcome.requeue_after {
                    self.schedule(key, after);
                }
            }
            Err(err) => {
                counter!("reconcile_total", 1u64, "controller" => name, "result" => "error");
                let attempts = self.failures.entry(key.clone()).or_insert(0);
                *attempts += 1;
                let attempt = *attempts;
                let delay = backoff_delay(&self.opts, attempt);
                warn!(
                    controller = name,
                    key = %key,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %err,
                    "reconcile failed; backing off"
                );
                // The retry re-reads authoritative state, so any event that
                // arrived mid-flight is covered by it.
                self.dirty.remove(&key);
                self.schedule(key, delay);
            }
        }
    }

    fn schedule(&mut self, key: ObjectKey, after: Duration) {
        self.delayed.push(Reverse((Instant::now() + after, key)));
    }
}

fn backoff_delay(opts: &Options, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    opts.backoff_base
        .saturating_mul(1u32 << exp)
        .min(opts.backoff_max)
}
