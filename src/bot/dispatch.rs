//! Query dispatcher.
//!
//! Every accepted query becomes one [`QueryUnit`]: completion, then shaping,
//! then a broadcast. Units are independent and may finish in any order.
//!
//! Two modes:
//! * `unbounded` (default): one task per query, nothing is ever refused.
//! * `pool`: a fixed set of workers drains a bounded FIFO queue. When the queue
//!   is full the [`OverflowPolicy`] decides: wait for space, refuse the new
//!   query, or discard the oldest waiting one.
//!
//! Stopping the bot never cancels units that are already running or queued.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};

use crate::bot::format::{shape, shape_error};
use crate::bot::parser::Query;
use crate::bot::sender::OutboundSender;
use crate::bot::state::ServiceHandle;
use crate::config::{DispatchConfig, DispatchMode, OverflowPolicy};
use crate::errors::{DispatchError, SendError};
use crate::logutil::escape_log;
use crate::metrics;

/// One query with everything needed to answer it.
pub struct QueryUnit {
    pub query: Query,
    pub service: ServiceHandle,
    pub sender: OutboundSender,
}

impl QueryUnit {
    pub async fn run(self) -> Result<(), SendError> {
        let QueryUnit {
            query,
            service,
            sender,
        } = self;
        let max_len = service.config.max_response_length;
        debug!(
            "Processing query from {}: '{}'",
            query.source_id,
            escape_log(&query.text)
        );
        let response = service.completion.complete(&query, &service.config).await;
        let reply = if response.was_error {
            shape_error(&response.text, max_len)
        } else {
            shape(&response.text, max_len)
        };
        let result = sender.broadcast(&reply).await;
        match &result {
            Ok(()) => info!(
                "Replied to {} ({} chars{})",
                query.source_id,
                reply.chars().count(),
                if response.was_error { ", error" } else { "" }
            ),
            Err(e) => warn!("Reply to {} not sent: {}", query.source_id, e),
        }
        result
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub completed: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub in_flight: usize,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Counters {
    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

struct Queued {
    unit: QueryUnit,
    /// Queue slot held while the unit waits
    _slot: OwnedSemaphorePermit,
}

struct Pool {
    queue: Mutex<VecDeque<Queued>>,
    slots: Arc<Semaphore>,
    work: Notify,
    policy: OverflowPolicy,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Pool {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        match self.queue.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum Mode {
    Unbounded,
    Pool(Arc<Pool>),
}

pub struct Dispatcher {
    mode: Mode,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn unbounded() -> Self {
        Self {
            mode: Mode::Unbounded,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start `workers` tasks draining a queue of at most `capacity` waiting units.
    pub fn pool(workers: usize, capacity: usize, policy: OverflowPolicy) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let pool = Arc::new(Pool {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            work: Notify::new(),
            policy,
            closed: AtomicBool::new(false),
            shutdown_tx,
        });
        let counters = Arc::new(Counters::default());
        for id in 0..workers.max(1) {
            let pool = pool.clone();
            let counters = counters.clone();
            let shutdown_rx = pool.shutdown_tx.subscribe();
            tokio::spawn(worker_loop(id, pool, counters, shutdown_rx));
        }
        info!(
            "Dispatcher pool started: {} workers, queue {}, overflow {:?}",
            workers.max(1),
            capacity.max(1),
            policy
        );
        Self {
            mode: Mode::Pool(pool),
            counters,
        }
    }

    pub fn from_config(cfg: &DispatchConfig) -> Self {
        match cfg.mode {
            DispatchMode::Unbounded => Self::unbounded(),
            DispatchMode::Pool => Self::pool(cfg.workers, cfg.queue_capacity, cfg.overflow),
        }
    }

    /// Hand a unit off for asynchronous execution.
    ///
    /// Returns once the unit is running or queued. Under the `block` policy this
    /// waits for a free queue slot.
    pub async fn dispatch(&self, unit: QueryUnit) -> Result<(), DispatchError> {
        match &self.mode {
            Mode::Unbounded => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
                metrics::inc_queries_dispatched();
                let counters = self.counters.clone();
                tokio::spawn(async move {
                    let _ = unit.run().await;
                    counters.finish();
                });
                Ok(())
            }
            Mode::Pool(pool) => self.enqueue(pool, unit).await,
        }
    }

    async fn enqueue(&self, pool: &Arc<Pool>, unit: QueryUnit) -> Result<(), DispatchError> {
        if pool.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        let slot = match pool.slots.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => match pool.policy {
                OverflowPolicy::Block => {
                    debug!("Dispatch queue full; waiting for space");
                    pool.slots
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| DispatchError::Closed)?
                }
                OverflowPolicy::RejectNewest => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_queries_rejected();
                    warn!(
                        "Dispatch queue full; query from {} rejected",
                        unit.query.source_id
                    );
                    return Err(DispatchError::QueueFull);
                }
                OverflowPolicy::DropOldest => {
                    let victim = pool.lock().pop_front();
                    match victim {
                        Some(old) => {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            metrics::inc_queries_rejected();
                            warn!(
                                "Dispatch queue full; dropped oldest query from {}",
                                old.unit.query.source_id
                            );
                            old._slot
                        }
                        // Workers emptied the queue in the meantime
                        None => pool
                            .slots
                            .clone()
                            .acquire_owned()
                            .await
                            .map_err(|_| DispatchError::Closed)?,
                    }
                }
            },
        };
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        metrics::inc_queries_dispatched();
        pool.lock().push_back(Queued { unit, _slot: slot });
        pool.work.notify_one();
        Ok(())
    }

    pub fn snapshot(&self) -> DispatchStats {
        let queued = match &self.mode {
            Mode::Unbounded => 0,
            Mode::Pool(pool) => pool.lock().len(),
        };
        DispatchStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            queued,
        }
    }

    fn is_idle(&self) -> bool {
        match &self.mode {
            Mode::Unbounded => self.counters.in_flight.load(Ordering::SeqCst) == 0,
            Mode::Pool(pool) => {
                let queue = pool.lock();
                queue.is_empty() && self.counters.in_flight.load(Ordering::SeqCst) == 0
            }
        }
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new units; queued ones still run.
    pub fn close(&self) {
        if let Mode::Pool(pool) = &self.mode {
            pool.closed.store(true, Ordering::SeqCst);
            pool.slots.close();
            let _ = pool.shutdown_tx.send(true);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

async fn worker_loop(
    id: usize,
    pool: Arc<Pool>,
    counters: Arc<Counters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("Dispatch worker {} started", id);
    loop {
        let next = {
            let mut queue = pool.lock();
            let next = queue.pop_front();
            if next.is_some() {
                counters.in_flight.fetch_add(1, Ordering::SeqCst);
            }
            next
        };
        match next {
            Some(Queued { unit, _slot }) => {
                drop(_slot);
                let _ = unit.run().await;
                counters.finish();
            }
            None => {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = pool.work.notified() => {}
                    res = shutdown_rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Dispatch worker {} exiting", id);
}
