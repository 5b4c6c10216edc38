//! Bulkhead admission control
//!
//! A bulkhead never queues: a call either gets capacity immediately or is
//! rejected with [`ResilienceError::BulkheadRejected`]. The capacity check
//! and the accounting update happen in one atomic or locked step.
//!
//! A `FixedPool` bulkhead owns a dedicated runtime with one worker thread per
//! slot. [`Bulkhead::dispatch`] runs owned work on those workers, while
//! [`Bulkhead::call`] runs borrowed work on the caller's task inside a slot.

use futures::FutureExt;
use log::{debug, error};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};

use crate::clock::{system_clock, SharedClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError};

/// Isolation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkheadStrategy {
    /// Numbered execution slots on dedicated worker threads, with panic containment
    FixedPool,
    /// Counting semaphore of concurrent permits
    Semaphore,
    /// Maximum admissions per sliding time window
    RateWindow,
}

impl std::fmt::Display for BulkheadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkheadStrategy::FixedPool => write!(f, "fixed_pool"),
            BulkheadStrategy::Semaphore => write!(f, "semaphore"),
            BulkheadStrategy::RateWindow => write!(f, "rate_window"),
        }
    }
}

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Isolation strategy
    pub strategy: BulkheadStrategy,

    /// Concurrent calls, or calls per window for `RateWindow`
    pub capacity: usize,

    /// Sliding window length, only used by `RateWindow`
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            strategy: BulkheadStrategy::Semaphore,
            capacity: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl BulkheadConfig {
    /// Semaphore bulkhead with `capacity` permits
    pub fn semaphore(capacity: usize) -> Self {
        Self {
            strategy: BulkheadStrategy::Semaphore,
            capacity,
            ..Self::default()
        }
    }

    /// Fixed pool with `capacity` slots
    pub fn fixed_pool(capacity: usize) -> Self {
        Self {
            strategy: BulkheadStrategy::FixedPool,
            capacity,
            ..Self::default()
        }
    }

    /// At most `capacity` calls per `window`
    pub fn rate_window(capacity: usize, window: Duration) -> Self {
        Self {
            strategy: BulkheadStrategy::RateWindow,
            capacity,
            window,
        }
    }

    /// Check ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("bulkhead", "capacity must be greater than 0"));
        }
        if self.strategy == BulkheadStrategy::RateWindow && self.window.is_zero() {
            return Err(ConfigError::invalid(
                "bulkhead",
                "window must be greater than 0 for rate_window",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a bulkhead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadSnapshot {
    /// Pool name
    pub pool: String,
    /// Isolation strategy
    pub strategy: BulkheadStrategy,
    /// Configured capacity
    pub capacity: usize,
    /// Calls currently executing
    pub in_flight: usize,
    /// Admissions still possible right now
    pub available: usize,
    /// Calls admitted since creation
    pub admitted_total: u64,
    /// Calls rejected for lack of capacity since creation
    pub rejected_total: u64,
    /// Panics contained by this pool since creation
    pub panics_total: u64,
    /// Completed calls per slot, `FixedPool` only
    pub slot_completions: Vec<u64>,
}

enum Admission {
    FixedPool {
        free_slots: Mutex<Vec<usize>>,
        completions: Vec<AtomicU64>,
        workers: SlotWorkers,
    },
    Semaphore(Arc<Semaphore>),
    RateWindow(Mutex<VecDeque<Instant>>),
}

struct BulkheadInner {
    name: String,
    config: BulkheadConfig,
    clock: SharedClock,
    admission: Admission,
    in_flight: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
    panics: AtomicU64,
}

/// Concurrency and throughput isolation for one pool
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.name)
            .field("strategy", &self.inner.config.strategy)
            .field("capacity", &self.inner.config.capacity)
            .finish()
    }
}

impl Bulkhead {
    /// Create a bulkhead
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, system_clock())
    }

    /// Create a bulkhead whose rate window reads time from `clock`
    pub fn with_clock(
        name: impl Into<String>,
        config: BulkheadConfig,
        clock: SharedClock,
    ) -> ConfigResult<Self> {
        config.validate()?;

        let name: String = name.into();

        let admission = match config.strategy {
            BulkheadStrategy::FixedPool => Admission::FixedPool {
                // Reversed so slot 0 is handed out first
                free_slots: Mutex::new((0..config.capacity).rev().collect()),
                completions: (0..config.capacity).map(|_| AtomicU64::new(0)).collect(),
                workers: SlotWorkers::start(&name, config.capacity)?,
            },
            BulkheadStrategy::Semaphore => {
                Admission::Semaphore(Arc::new(Semaphore::new(config.capacity)))
            }
            BulkheadStrategy::RateWindow => {
                Admission::RateWindow(Mutex::new(VecDeque::with_capacity(config.capacity)))
            }
        };

        Ok(Self {
            inner: Arc::new(BulkheadInner {
                name,
                config,
                clock,
                admission,
                in_flight: AtomicUsize::new(0),
                admitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                panics: AtomicU64::new(0),
            }),
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    /// Run plain work inside the bulkhead
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call(|| async move { f().await.map_err(ResilienceError::Operation) })
            .await
    }

    /// Run an already-layered call inside the bulkhead on the caller's task
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let permit = self.try_admit::<E>()?;

        let result = if permit.slot.is_some() {
            self.contain(async move { f().await }).await
        } else {
            f().await
        };
        drop(permit);
        result
    }

    /// Run owned work on the pool's dedicated worker threads
    ///
    /// Only `FixedPool` has workers; the other strategies behave exactly like
    /// [`Bulkhead::call`]. Dropping the returned future aborts the work and
    /// frees its slot.
    pub async fn dispatch<F, Fut, T, E>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let workers = match &self.inner.admission {
            Admission::FixedPool { workers, .. } => workers.handle.clone(),
            _ => return self.call(f).await,
        };

        let permit = self.try_admit::<E>()?;
        debug!(
            "Dispatching call to slot {:?} of pool '{}'",
            permit.slot(),
            self.inner.name
        );

        let task = AbortOnDrop(workers.spawn(async move {
            let result = f().await;
            drop(permit);
            result
        }));

        match task.await {
            Ok(result) => result,
            Err(error) if error.is_panic() => Err(self.panicked()),
            Err(_) => Err(ResilienceError::Cancelled),
        }
    }

    /// Whether calls admitted here are shielded from panics
    pub fn contains_panics(&self) -> bool {
        self.inner.config.strategy == BulkheadStrategy::FixedPool
    }

    /// Await `fut`, turning a panic into [`ResilienceError::Panicked`]
    pub(crate) async fn contain<Fut, T, E>(&self, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(self.panicked()),
        }
    }

    /// Reserve capacity for one call without running anything
    ///
    /// The returned permit releases its capacity when dropped.
    pub fn try_admit<E>(&self) -> Result<BulkheadPermit, ResilienceError<E>> {
        let inner = &self.inner;

        let (semaphore_permit, slot) = match &inner.admission {
            Admission::Semaphore(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => (Some(permit), None),
                Err(_) => return Err(self.reject()),
            },
            Admission::FixedPool { free_slots, .. } => {
                let free = free_slots.lock().pop();
                match free {
                    Some(index) => (
                        None,
                        Some(SlotGuard {
                            inner: Arc::clone(inner),
                            index,
                        }),
                    ),
                    None => return Err(self.reject()),
                }
            }
            Admission::RateWindow(entries) => {
                let now = inner.clock.now();
                let mut entries = entries.lock();
                prune_window(&mut entries, now, inner.config.window);
                if entries.len() >= inner.config.capacity {
                    drop(entries);
                    return Err(self.reject());
                }
                entries.push_back(now);
                (None, None)
            }
        };

        inner.admitted.fetch_add(1, Ordering::Relaxed);
        inner.in_flight.fetch_add(1, Ordering::AcqRel);

        Ok(BulkheadPermit {
            inner: Arc::clone(inner),
            _semaphore: semaphore_permit,
            slot,
        })
    }

    /// Snapshot of occupancy and counters
    pub fn snapshot(&self) -> BulkheadSnapshot {
        let inner = &self.inner;
        let capacity = inner.config.capacity;

        let (available, slot_completions) = match &inner.admission {
            Admission::Semaphore(semaphore) => (semaphore.available_permits(), Vec::new()),
            Admission::FixedPool {
                free_slots,
                completions,
                ..
            } => (
                free_slots.lock().len(),
                completions
                    .iter()
                    .map(|count| count.load(Ordering::Relaxed))
                    .collect(),
            ),
            Admission::RateWindow(entries) => {
                let mut entries = entries.lock();
                prune_window(&mut entries, inner.clock.now(), inner.config.window);
                (capacity.saturating_sub(entries.len()), Vec::new())
            }
        };

        BulkheadSnapshot {
            pool: inner.name.clone(),
            strategy: inner.config.strategy,
            capacity,
            in_flight: inner.in_flight.load(Ordering::Acquire),
            available,
            admitted_total: inner.admitted.load(Ordering::Relaxed),
            rejected_total: inner.rejected.load(Ordering::Relaxed),
            panics_total: inner.panics.load(Ordering::Relaxed),
            slot_completions,
        }
    }

    fn panicked<E>(&self) -> ResilienceError<E> {
        self.inner.panics.fetch_add(1, Ordering::Relaxed);
        error!("Call panicked inside bulkhead pool '{}'", self.inner.name);
        ResilienceError::Panicked {
            pool: self.inner.name.clone(),
        }
    }

    fn reject<E>(&self) -> ResilienceError<E> {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Bulkhead '{}' rejected call ({} capacity {})",
            self.inner.name, self.inner.config.strategy, self.inner.config.capacity
        );
        ResilienceError::BulkheadRejected {
            pool: self.inner.name.clone(),
            capacity: self.inner.config.capacity,
        }
    }
}

fn prune_window(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = entries.front() {
        if now.saturating_duration_since(oldest) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

/// Dedicated worker threads backing a fixed pool
struct SlotWorkers {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl SlotWorkers {
    fn start(pool: &str, threads: usize) -> ConfigResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(format!("{}-slot", pool))
            .enable_all()
            .build()
            .map_err(|e| {
                ConfigError::invalid("bulkhead", format!("failed to start pool workers: {}", e))
            })?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }
}

impl Drop for SlotWorkers {
    fn drop(&mut self) {
        // A blocking runtime drop panics when it happens inside async code
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Capacity held by one admitted call
pub struct BulkheadPermit {
    inner: Arc<BulkheadInner>,
    _semaphore: Option<OwnedSemaphorePermit>,
    slot: Option<SlotGuard>,
}

impl BulkheadPermit {
    /// Slot index for `FixedPool` admissions
    pub fn slot(&self) -> Option<usize> {
        self.slot.as_ref().map(|slot| slot.index)
    }
}

impl std::fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPermit")
            .field("pool", &self.inner.name)
            .field("slot", &self.slot())
            .finish()
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SlotGuard {
    inner: Arc<BulkheadInner>,
    index: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Admission::FixedPool {
            free_slots,
            completions,
            ..
        } = &self.inner.admission
        {
            completions[self.index].fetch_add(1, Ordering::Relaxed);
            free_slots.lock().push(self.index);
        }
    }
}
