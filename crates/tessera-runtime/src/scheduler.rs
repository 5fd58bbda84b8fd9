use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinSet};

use crate::error::SchedulerError;

/// Configuration for the worker pool
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Callbacks and tasks allowed to run at the same time
    pub worker_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 1024,
        }
    }
}

const TIMER_PENDING: u8 = 0;
const TIMER_FIRED: u8 = 1;
const TIMER_CANCELLED: u8 = 2;

/// Handle to a scheduled callback.
///
/// Dropping the handle does not cancel the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancels the timer if it has not fired yet.
    ///
    /// Returns `true` if this call prevented the callback from running.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(TIMER_PENDING, TIMER_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.abort.abort();
        }
        cancelled
    }

    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_FIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_CANCELLED
    }
}

/// What a graceful shutdown had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerShutdown {
    /// Timers that had not fired and were cancelled
    pub cancelled_timers: usize,
    /// Tasks still running when the quiet period ended, then aborted
    pub aborted_tasks: usize,
}

impl SchedulerShutdown {
    pub fn is_clean(&self) -> bool {
        self.aborted_tasks == 0
    }
}

struct Inner {
    handle: Handle,
    workers: Arc<Semaphore>,
    accepting: AtomicBool,
    timers: Mutex<JoinSet<()>>,
    tasks: Mutex<JoinSet<()>>,
    terminated: watch::Sender<bool>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Spawns `fut` behind a worker permit. If `give_up` completes while
    /// the task still waits for its permit, `fut` never runs.
    fn spawn_task<F, G>(&self, fut: F, give_up: G) -> Result<AbortHandle, SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
        G: Future<Output = ()> + Send + 'static,
    {
        let workers = self.workers.clone();
        let mut tasks = locked(&self.tasks);
        // Checked under the lock so shutdown cannot miss a task.
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        while tasks.try_join_next().is_some() {}

        Ok(tasks.spawn_on(
            async move {
                tokio::pin!(give_up);
                let _permit = tokio::select! {
                    biased;
                    permit = workers.acquire_owned() => permit.ok(),
                    () = &mut give_up => return,
                };
                fut.await;
            },
            &self.handle,
        ))
    }
}

/// Timer and worker pool for caller-facing work.
///
/// Built on the tokio runtime current at construction. Callbacks and tasks
/// wait for a worker permit before running, so at most
/// `worker_pool_size` of them make progress at once.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tessera_runtime::{Scheduler, SchedulerConfig};
///
/// # #[tokio::main]
/// # async fn main() {
/// let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
/// let timer = scheduler
///     .schedule(Duration::from_secs(60), || println!("never printed"))
///     .unwrap();
/// assert!(timer.cancel());
///
/// let report = scheduler.shutdown(Duration::from_millis(100)).await;
/// assert!(report.is_clean());
/// # }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let handle = Handle::try_current().map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;
        let (terminated, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
                accepting: AtomicBool::new(true),
                timers: Mutex::new(JoinSet::new()),
                tasks: Mutex::new(JoinSet::new()),
                terminated,
            }),
        })
    }

    /// Runs `callback` on the worker pool after `delay`.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> Result<TimerHandle, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(TIMER_PENDING));
        let timer_state = state.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let mut timers = locked(&self.inner.timers);
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        while timers.try_join_next().is_some() {}

        let abort = timers.spawn_on(
            async move {
                tokio::time::sleep(delay).await;
                if timer_state
                    .compare_exchange(TIMER_PENDING, TIMER_FIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
                let Some(inner) = weak.upgrade() else { return };
                if let Err(e) = inner.spawn_task(async move { callback() }, std::future::pending()) {
                    tracing::debug!(error = %e, "Timer fired during shutdown, callback dropped");
                }
            },
            &self.inner.handle,
        );

        Ok(TimerHandle { state, abort })
    }

    /// Runs `fut` on the worker pool.
    pub fn spawn<F>(&self, fut: F) -> Result<AbortHandle, SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn_task(fut, std::future::pending())
    }

    /// Runs `fut` on the worker pool, unless `give_up` completes first
    /// while the task is still waiting for a worker. `give_up` itself runs
    /// without a permit.
    pub fn spawn_or_give_up<F, G>(&self, fut: F, give_up: G) -> Result<AbortHandle, SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
        G: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn_task(fut, give_up)
    }

    pub fn is_shutdown(&self) -> bool {
        !self.inner.accepting.load(Ordering::Acquire)
    }

    /// Timers not yet fired or cancelled.
    pub fn pending_timers(&self) -> usize {
        let mut timers = locked(&self.inner.timers);
        while timers.try_join_next().is_some() {}
        timers.len()
    }

    /// Tasks and fired callbacks not yet finished.
    pub fn active_tasks(&self) -> usize {
        let mut tasks = locked(&self.inner.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Stops accepting work, cancels pending timers, waits up to
    /// `quiet_period` for running tasks and aborts whatever is left.
    ///
    /// Only the first call does the work; later calls wait for termination
    /// and report nothing.
    pub async fn shutdown(&self, quiet_period: Duration) -> SchedulerShutdown {
        let taken = {
            let mut tasks = locked(&self.inner.tasks);
            if self.inner.accepting.swap(false, Ordering::AcqRel) {
                Some(std::mem::take(&mut *tasks))
            } else {
                None
            }
        };
        let Some(mut tasks) = taken else {
            self.terminated().await;
            return SchedulerShutdown::default();
        };

        let mut timers = std::mem::take(&mut *locked(&self.inner.timers));
        while timers.try_join_next().is_some() {}
        let cancelled_timers = timers.len();
        timers.shutdown().await;

        let drained = tokio::time::timeout(quiet_period, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let aborted_tasks = if drained {
            0
        } else {
            let remaining = tasks.len();
            tracing::warn!(remaining, "Quiet period elapsed, aborting scheduler tasks");
            tasks.shutdown().await;
            remaining
        };

        self.inner.terminated.send_replace(true);
        tracing::debug!(cancelled_timers, aborted_tasks, "Scheduler terminated");

        SchedulerShutdown {
            cancelled_timers,
            aborted_tasks,
        }
    }

    /// Resolves once [`shutdown`](Self::shutdown) has completed.
    pub async fn terminated(&self) {
        let mut rx = self.inner.terminated.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("shutdown", &self.is_shutdown())
            .field("available_workers", &self.inner.workers.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            worker_pool_size: workers,
        })
        .unwrap()
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            Scheduler::new(SchedulerConfig::default()),
            Err(SchedulerError::NoRuntime(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let scheduler = scheduler(4);
        let (tx, rx) = oneshot::channel();
        let started = tokio::time::Instant::now();

        let timer = scheduler
            .schedule(Duration::from_millis(50), move || {
                let _ = tx.send(tokio::time::Instant::now());
            })
            .unwrap();

        let fired_at = rx.await.unwrap();
        let waited = fired_at - started;
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(60));
        assert!(timer.is_fired());
        assert!(!timer.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let scheduler = scheduler(4);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let timer = scheduler
            .schedule(Duration::from_millis(10), move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(timer.is_cancelled());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let scheduler = scheduler(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            scheduler
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_while_waiting_for_worker() {
        let scheduler = scheduler(1);
        scheduler
            .spawn(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
            })
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        let flag = ran.clone();
        let started = tokio::time::Instant::now();
        scheduler
            .spawn_or_give_up(async move { flag.store(true, Ordering::SeqCst) }, async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(tokio::time::Instant::now());
            })
            .unwrap();

        // resolved without waiting for the busy worker
        let gave_up_at = rx.await.unwrap();
        assert!(gave_up_at - started < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_is_ignored_once_running() {
        let scheduler = scheduler(1);
        let (tx, rx) = oneshot::channel();
        let gave_up = Arc::new(AtomicBool::new(false));
        let flag = gave_up.clone();

        scheduler
            .spawn_or_give_up(
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = tx.send(());
                },
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    flag.store(true, Ordering::SeqCst);
                },
            )
            .unwrap();

        rx.await.unwrap();
        assert!(!gave_up.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_tasks() {
        let scheduler = scheduler(4);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        scheduler
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.schedule(Duration::from_secs(3600), || {}).unwrap();

        let report = scheduler.shutdown(Duration::from_millis(100)).await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(report.cancelled_timers, 1);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_quiet_period() {
        let scheduler = scheduler(4);
        scheduler
            .spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();

        let started = tokio::time::Instant::now();
        let report = scheduler.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report.aborted_tasks, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_rejects_work_after_shutdown() {
        let scheduler = scheduler(4);
        scheduler.shutdown(Duration::from_millis(10)).await;

        assert!(scheduler.is_shutdown());
        assert_eq!(scheduler.spawn(async {}).unwrap_err(), SchedulerError::ShuttingDown);
        assert_eq!(
            scheduler.schedule(Duration::from_millis(1), || {}).unwrap_err(),
            SchedulerError::ShuttingDown
        );

        // second shutdown is a no-op
        assert_eq!(
            scheduler.shutdown(Duration::from_millis(10)).await,
            SchedulerShutdown::default()
        );
    }

    #[tokio::test]
    async fn test_terminated_signals_dependents() {
        let scheduler = scheduler(4);
        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.terminated().await })
        };

        scheduler.shutdown(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
