//! Worker pool running task loops.
//!
//! A pool is a dedicated multi-thread tokio runtime with exactly `threads`
//! worker threads. Task loops are spawned onto it and may outnumber the
//! threads; they cooperate by yielding between items.

use crate::errors::ShutdownError;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the pool owning the current thread, 0 outside any pool.
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

/// Counts live task loops and worker threads of one pool.
#[derive(Debug)]
pub(crate) struct Latch {
    pool_id: u64,
    state: Mutex<LatchState>,
    changed: Condvar,
    drained: Notify,
    closing: Notify,
}

#[derive(Debug, Default)]
struct LatchState {
    loops: usize,
    threads: usize,
    closing: bool,
    shut_down: bool,
}

impl Latch {
    fn new(pool_id: u64) -> Self {
        Self {
            pool_id,
            state: Mutex::default(),
            changed: Condvar::new(),
            drained: Notify::new(),
            closing: Notify::new(),
        }
    }

    /// Returns true when called from one of the pool's worker threads.
    pub(crate) fn owns_current_thread(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == self.pool_id
    }

    fn update(&self, f: impl FnOnce(&mut LatchState)) {
        let mut state = self.state.lock();
        f(&mut state);
        drop(state);
        self.changed.notify_all();
    }

    /// Number of task loops that have not exited yet.
    pub(crate) fn running_loops(&self) -> usize {
        self.state.lock().loops
    }

    fn loop_exited(&self) {
        let mut state = self.state.lock();
        state.loops = state.loops.saturating_sub(1);
        let drained = state.loops == 0;
        drop(state);
        self.changed.notify_all();
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Waits up to `timeout` until at most `limit` task loops are running.
    ///
    /// Returns the number of loops still running.
    pub(crate) fn wait_loops(&self, limit: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.loops > limit {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.loops
    }

    /// Resolves once no task loop of this pool is running.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.running_loops() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn begin_close(&self) {
        self.update(|s| s.closing = true);
        self.closing.notify_waiters();
    }

    /// Resolves once the pool has begun shutting down.
    async fn closed(&self) {
        loop {
            let notified = self.closing.notified();
            if self.state.lock().closing {
                return;
            }
            notified.await;
        }
    }

    /// Blocks until the pool was shut down and all its threads and loops exited.
    pub(crate) fn wait_terminated(&self) {
        let mut state = self.state.lock();
        while !(state.shut_down && state.loops == 0 && state.threads == 0) {
            self.changed.wait(&mut state);
        }
    }
}

/// Decrements the loop count when a task loop ends, even by panic or drop.
struct LoopGuard {
    latch: Arc<Latch>,
}

impl LoopGuard {
    fn new(latch: Arc<Latch>) -> Self {
        latch.update(|s| s.loops += 1);
        Self { latch }
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.latch.loop_exited();
    }
}

/// A fixed-size pool of execution threads.
pub(crate) struct WorkerPool {
    id: u64,
    runtime: Option<Runtime>,
    latch: Arc<Latch>,
    predecessors: Arc<[Arc<Latch>]>,
}

impl WorkerPool {
    /// Creates a pool with `threads` worker threads named after the pipeline.
    pub(crate) fn new(name: &str, threads: usize) -> io::Result<Self> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let latch = Arc::new(Latch::new(id));

        let on_start = Arc::clone(&latch);
        let on_stop = Arc::clone(&latch);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(format!("{name}-worker"))
            .on_thread_start(move || {
                CURRENT_POOL.with(|current| current.set(id));
                on_start.update(|s| s.threads += 1);
            })
            .on_thread_stop(move || {
                CURRENT_POOL.with(|current| current.set(0));
                on_stop.update(|s| s.threads = s.threads.saturating_sub(1));
            })
            .enable_time()
            .build()?;

        Ok(Self {
            id,
            runtime: Some(runtime),
            latch,
            predecessors: Vec::new().into(),
        })
    }

    /// Holds back every loop spawned on this pool until the loops of the
    /// given earlier pools have exited, so a task never has two owners.
    /// Loops still held back when the pool shuts down exit without running.
    pub(crate) fn after(mut self, predecessors: Vec<Arc<Latch>>) -> Self {
        self.predecessors = predecessors.into();
        self
    }

    /// Returns the latch tracking this pool's loops and threads.
    pub(crate) fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.latch)
    }

    /// Spawns a task loop onto the pool.
    pub(crate) fn spawn<F>(&self, task_loop: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(runtime) = &self.runtime {
            let guard = LoopGuard::new(Arc::clone(&self.latch));
            let predecessors = Arc::clone(&self.predecessors);
            let latch = Arc::clone(&self.latch);
            runtime.spawn(async move {
                let _guard = guard;
                let handed_over = async {
                    for previous in predecessors.iter() {
                        previous.drained().await;
                    }
                };
                let owned = tokio::select! {
                    () = handed_over => true,
                    () = latch.closed() => false,
                };
                if owned {
                    task_loop.await;
                }
            });
        }
    }

    fn is_current(&self) -> bool {
        self.latch.owns_current_thread()
    }

    /// Waits up to `grace` for all task loops to exit, then shuts the pool down.
    ///
    /// Loops still running after the grace period are detached: the runtime
    /// drops them at their next suspension point. Called from a worker thread
    /// of this same pool, the caller's own loop is left out of the wait since
    /// it can only exit after `shutdown` returns; the worker hands its other
    /// loops to a fresh thread while it waits.
    pub(crate) fn shutdown(mut self, grace: Duration) -> Result<(), ShutdownError> {
        self.latch.begin_close();
        let own = usize::from(self.is_current());
        let pending = if own == 0 {
            self.latch.wait_loops(0, grace)
        } else {
            tokio::task::block_in_place(|| self.latch.wait_loops(own, grace))
        };

        self.close();

        let pending = pending.saturating_sub(own);
        if pending == 0 {
            Ok(())
        } else {
            Err(ShutdownError {
                pending_loops: pending,
                grace,
            })
        }
    }

    fn close(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        self.latch.update(|s| s.shut_down = true);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("running_loops", &self.latch.running_loops())
            .finish()
    }
}
