//! Shared snapshot fan-out for streaming subscribers.
//!
//! One interval timer recomputes the snapshot and pushes it to every live
//! subscriber. Recomputes that overlap an in-flight one await the same
//! result instead of starting another. The timer only runs while somebody
//! is subscribed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ---

/// Per-subscriber queue depth; a subscriber this far behind misses snapshots.
const SUBSCRIBER_BUFFER: usize = 4;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Produces a fresh snapshot.
pub type Compute<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

pub struct BroadcastCoalescer<T> {
    compute: Compute<T>,
    interval: Duration,
    in_flight: Mutex<Option<Arc<OnceCell<Arc<T>>>>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<T>>>>,
    next_id: AtomicU64,
    timer: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    computations: AtomicU64,
}

/// Live registration; dropping it unsubscribes.
pub struct Subscription<T: Send + Sync + 'static> {
    id: u64,
    rx: mpsc::Receiver<Arc<T>>,
    owner: Weak<BroadcastCoalescer<T>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next snapshot; `None` once the coalescer has gone away.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.rx.recv().await
    }
}

impl<T: Send + Sync + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.unsubscribe(self.id);
        }
    }
}

impl<T: Send + Sync + 'static> BroadcastCoalescer<T> {
    // ---
    /// `shutdown` stops the timer for good; it is not restarted afterwards.
    pub fn new(compute: Compute<T>, interval: Duration, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            compute,
            interval: interval.max(Duration::from_millis(1)),
            in_flight: Mutex::new(None),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timer: Mutex::new(None),
            shutdown,
            computations: AtomicU64::new(0),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Number of snapshot computations actually executed.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Compute a snapshot, joining the in-flight computation if there is one.
    pub async fn recompute(&self) -> Arc<T> {
        // ---
        let cell = {
            let mut slot = self.in_flight.lock();
            Arc::clone(slot.get_or_insert_with(|| Arc::new(OnceCell::new())))
        };

        let snapshot = cell
            .get_or_init(|| async {
                self.computations.fetch_add(1, Ordering::Relaxed);
                Arc::new((self.compute)().await)
            })
            .await
            .clone();

        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            *slot = None;
        }
        snapshot
    }

    /// Register a subscriber, starting the timer if it was idle.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        // ---
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, tx);
            self.ensure_timer();
            subscribers.len()
        };
        debug!(id, subscribers = count, "stream subscriber registered");

        Subscription {
            id,
            rx,
            owner: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        // ---
        let remaining = {
            let mut subscribers = self.subscribers.lock();
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.stop_timer();
            }
            subscribers.len()
        };
        debug!(id, subscribers = remaining, "stream subscriber removed");
    }

    /// Recompute once and fan out, pruning closed subscribers.
    pub async fn tick(&self) {
        // ---
        {
            let subscribers = self.subscribers.lock();
            if subscribers.is_empty() {
                self.stop_timer();
                return;
            }
        }

        let snapshot = self.recompute().await;

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&snapshot)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(id, "stream subscriber lagging, snapshot dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            self.stop_timer();
        }
    }

    /// Caller holds the `subscribers` lock; `timer` is always taken after it.
    fn ensure_timer(self: &Arc<Self>) {
        // ---
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let stop = self.shutdown.child_token();
        *timer = Some(stop.clone());

        let owner = Arc::downgrade(self);
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = period.as_millis() as u64, "broadcast timer started");

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(coalescer) = owner.upgrade() else { break };
                        coalescer.tick().await;
                    }
                }
            }

            info!("broadcast timer stopped");
        });
    }

    /// Caller holds the `subscribers` lock.
    fn stop_timer(&self) {
        if let Some(stop) = self.timer.lock().take() {
            stop.cancel();
        }
    }
}
