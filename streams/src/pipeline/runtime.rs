//! The running pipeline: lifecycle, task loops, and the push entry point.

use super::builder::{Settings, Source, SourceMode};
use super::chain::{guarded, StageChain, SupplierFn};
use super::pool::{Latch, WorkerPool};
use crate::errors::{ProcessingError, ShutdownError, Stage, StreamsError};
use crate::events::{
    EventSink, HANDLER_PANICKED, ITEM_FAILED, PIPELINE_SHUTDOWN_TIMED_OUT, PIPELINE_STARTED, PIPELINE_STOPPED,
    PUSH_REJECTED,
};
use crate::partition::Partitioner;
use crate::queue::{QueueKind, TaskQueue};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

/// Pause between attempts to enqueue into a full bounded queue.
const PUSH_RETRY_INTERVAL: Duration = Duration::from_micros(100);

/// Callback receiving every item failure.
pub type ExceptionHandler = Arc<dyn Fn(&ProcessingError) + Send + Sync>;

struct TaskSlot<I> {
    queue: Box<dyn TaskQueue<I>>,
    ready: Notify,
}

/// State shared between the pipeline handle and its task loops.
struct Shared<I, O> {
    name: String,
    tasks: usize,
    threads: usize,
    idle_wait: Duration,
    shutdown_grace: Duration,
    push_timeout: Option<Duration>,
    queue: Option<QueueKind>,
    source: Source<I>,
    chain: StageChain<I, O>,
    partitioner: Option<Partitioner<I>>,
    slots: Vec<TaskSlot<I>>,
    running: AtomicBool,
    handler: RwLock<Option<ExceptionHandler>>,
    events: Arc<dyn EventSink>,
}

impl<I, O> Shared<I, O> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wakes every task loop parked on its queue.
    fn wake_all(&self) {
        for slot in &self.slots {
            slot.ready.notify_one();
        }
    }

    fn emit(&self, event_type: &str, mut data: Value) {
        if let Value::Object(fields) = &mut data {
            fields.insert("pipeline".to_string(), json!(self.name));
        }
        self.events.try_emit(event_type, Some(data));
    }

    fn reject(&self, reason: &str, task: Option<usize>) {
        self.emit(PUSH_REJECTED, json!({ "reason": reason, "task": task }));
    }

    /// Hands a failure to the registered handler, or reports it as an event.
    fn report(&self, error: &ProcessingError) {
        let handler = self.handler.read().clone();
        let failure = json!({
            "stage": error.stage,
            "task": error.task,
            "error": format!("{:#}", error.source),
        });

        match handler {
            Some(handler) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                    self.emit(HANDLER_PANICKED, failure);
                }
            }
            None => self.emit(ITEM_FAILED, failure),
        }
    }
}

impl<I, O> Shared<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    /// Runs one item through the stage chain and returns the push result.
    fn process(&self, item: I, task: usize) -> bool {
        match self.chain.run(item, task) {
            Ok(outcome) => {
                trace!(pipeline = %self.name, task, ?outcome, "item processed");
                outcome.accepted()
            }
            Err(error) => {
                self.report(&error);
                false
            }
        }
    }

    fn route(&self, item: &I) -> Result<usize, ProcessingError> {
        let tasks = self.tasks;
        let Some(partitioner) = &self.partitioner else {
            return Ok(0);
        };

        let task = guarded(Stage::Partition, 0, || Ok(partitioner(item, tasks)))?;
        if task < tasks {
            Ok(task)
        } else {
            Err(ProcessingError::new(
                Stage::Partition,
                0,
                anyhow::anyhow!("partitioner returned task {task}, but only {tasks} tasks exist"),
            ))
        }
    }

    fn enqueue(&self, item: I, deadline: Option<Instant>) -> bool {
        if matches!(self.source, Source::Pull(_)) {
            self.reject("pull pipelines do not accept pushed items", None);
            return false;
        }

        if self.slots.is_empty() {
            if !self.is_running() {
                self.reject("pipeline is stopped", None);
                return false;
            }
            return self.process(item, 0);
        }

        let task = match self.route(&item) {
            Ok(task) => task,
            Err(error) => {
                self.report(&error);
                return false;
            }
        };

        let slot = &self.slots[task];
        let mut item = item;
        loop {
            match slot.queue.offer(item) {
                Ok(()) => {
                    slot.ready.notify_one();
                    return true;
                }
                Err(rejected) => match deadline {
                    Some(deadline) if Instant::now() < deadline => {
                        item = rejected;
                        thread::sleep(PUSH_RETRY_INTERVAL);
                    }
                    _ => {
                        self.reject("queue is full", Some(task));
                        return false;
                    }
                },
            }
        }
    }
}

async fn pull_loop<I, O>(shared: Arc<Shared<I, O>>, supplier: SupplierFn<I>, task: usize)
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    while shared.is_running() {
        match guarded(Stage::Supply, task, || supplier(task)) {
            Ok(Some(item)) => {
                shared.process(item, task);
                tokio::task::yield_now().await;
            }
            Ok(None) => tokio::time::sleep(shared.idle_wait).await,
            Err(error) => {
                shared.report(&error);
                tokio::time::sleep(shared.idle_wait).await;
            }
        }
    }
    debug!(pipeline = %shared.name, task, "pull loop exited");
}

async fn queue_loop<I, O>(shared: Arc<Shared<I, O>>, task: usize)
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    let slot = &shared.slots[task];
    while shared.is_running() {
        match slot.queue.poll() {
            Some(item) => {
                shared.process(item, task);
                tokio::task::yield_now().await;
            }
            None => slot.ready.notified().await,
        }
    }
    debug!(pipeline = %shared.name, task, "queue loop exited");
}

#[derive(Default)]
struct Lifecycle {
    pool: Option<WorkerPool>,
    latch: Option<Arc<Latch>>,
    /// Latches of earlier activations whose loops had not all exited.
    retired: Vec<Arc<Latch>>,
    run_id: Option<Uuid>,
}

/// A built pipeline.
///
/// Created stopped. `start()` launches one task loop per task on a dedicated
/// pool of `threads` threads (none for a synchronous push pipeline), `stop()`
/// lets every loop finish its current item and exit. Items pushed to the same
/// task are processed in push order.
///
/// `push` takes `&self`; share the pipeline behind an `Arc` to feed it from
/// several threads or from another pipeline's sink.
pub struct Pipeline<I, O> {
    shared: Arc<Shared<I, O>>,
    lifecycle: Mutex<Lifecycle>,
    stopped: Condvar,
}

impl<I, O> Pipeline<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    pub(crate) fn new(settings: Settings<I>, source: Source<I>, chain: StageChain<I, O>) -> Self {
        let threads = settings.threads();
        // Pull loops ask their supplier directly, so only push pipelines get queues.
        let queue = match source {
            Source::Pull(_) => None,
            Source::Push => settings.queue,
        };
        let slots: Vec<TaskSlot<I>> = queue
            .map(|kind| {
                (0..settings.tasks)
                    .map(|_| TaskSlot {
                        queue: kind.create(),
                        ready: Notify::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            shared: Arc::new(Shared {
                name: settings.name,
                tasks: settings.tasks,
                threads,
                idle_wait: settings.idle_wait,
                shutdown_grace: settings.shutdown_grace,
                push_timeout: settings.push_timeout,
                queue,
                source,
                chain,
                partitioner: settings.partitioner,
                slots,
                running: AtomicBool::new(false),
                handler: RwLock::new(None),
                events: settings.events,
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            stopped: Condvar::new(),
        }
    }

    /// Starts the pipeline. Does nothing if it is already running.
    ///
    /// A pipeline may be started again after `stop()`; items left in its
    /// queues are picked up by the new task loops. New loops begin only once
    /// every loop of earlier activations has exited, including one still
    /// finishing its item after a timed-out `stop()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool could not be created.
    pub fn start(&self) -> Result<&Self, StreamsError> {
        let shared = &self.shared;
        let mut lifecycle = self.lifecycle.lock();
        if shared.is_running() {
            return Ok(self);
        }

        let needs_pool = matches!(shared.source, Source::Pull(_)) || !shared.slots.is_empty();
        let mut predecessors = lifecycle.retired.clone();
        predecessors.extend(lifecycle.latch.clone());
        predecessors.retain(|latch| latch.running_loops() > 0);

        let pool = if needs_pool {
            Some(WorkerPool::new(&shared.name, shared.threads)?.after(predecessors.clone()))
        } else {
            None
        };

        shared.running.store(true, Ordering::SeqCst);

        if let Some(pool) = &pool {
            for task in 0..shared.tasks {
                match &shared.source {
                    Source::Pull(supplier) => {
                        pool.spawn(pull_loop(Arc::clone(shared), Arc::clone(supplier), task));
                    }
                    Source::Push => pool.spawn(queue_loop(Arc::clone(shared), task)),
                }
            }
        }

        let run_id = Uuid::new_v4();
        lifecycle.latch = pool.as_ref().map(WorkerPool::latch);
        lifecycle.retired = predecessors;
        lifecycle.pool = pool;
        lifecycle.run_id = Some(run_id);
        drop(lifecycle);

        shared.emit(
            PIPELINE_STARTED,
            json!({
                "run_id": run_id.to_string(),
                "source": shared.source.mode(),
                "tasks": shared.tasks,
                "threads": shared.threads,
                "queue": shared.queue.map(|kind| kind.to_string()),
            }),
        );
        Ok(self)
    }

    /// Stops the pipeline. Does nothing if it is not running.
    ///
    /// Every task loop finishes the item it is processing and exits; queued
    /// items stay in their queues. Loops still busy after the shutdown grace
    /// period are detached and dropped by the pool at their next suspension
    /// point. Called from one of the pipeline's own stage functions, it waits
    /// for every other loop; the calling loop exits once its item completes.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] if task loops were still running when the
    /// grace period elapsed.
    pub fn stop(&self) -> Result<(), ShutdownError> {
        let shared = &self.shared;
        let (pool, run_id) = {
            let mut lifecycle = self.lifecycle.lock();
            if !shared.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            shared.wake_all();
            (lifecycle.pool.take(), lifecycle.run_id)
        };
        self.stopped.notify_all();

        let result = pool.map_or(Ok(()), |pool| pool.shutdown(shared.shutdown_grace));
        let run_id = run_id.map(|id| id.to_string());

        match &result {
            Ok(()) => shared.emit(
                PIPELINE_STOPPED,
                json!({ "run_id": run_id, "pending_items": self.size() }),
            ),
            Err(error) => shared.emit(
                PIPELINE_SHUTDOWN_TIMED_OUT,
                json!({
                    "run_id": run_id,
                    "pending_loops": error.pending_loops,
                    "grace_ms": u64::try_from(error.grace.as_millis()).unwrap_or(u64::MAX),
                }),
            ),
        }
        result
    }

    /// Blocks for up to `timeout`, returning early once the pipeline stops.
    ///
    /// A polling aid for callers synchronizing with in-flight work, not a
    /// completion barrier. Returns immediately if the pipeline is stopped.
    pub fn wait(&self, timeout: Duration) -> &Self {
        let mut lifecycle = self.lifecycle.lock();
        let shared = &self.shared;
        let _ = self
            .stopped
            .wait_while_for(&mut lifecycle, |_| shared.is_running(), timeout);
        self
    }

    /// Blocks until the last activation's worker threads have all exited.
    ///
    /// Returns immediately if the pipeline never started a pool, or when
    /// called from one of its own worker threads.
    pub fn join(&self) {
        let latch = self.lifecycle.lock().latch.clone();
        if let Some(latch) = latch {
            if !latch.owns_current_thread() {
                latch.wait_terminated();
            }
        }
    }

    /// Offers an item to the pipeline.
    ///
    /// Without a queue, runs the whole stage chain on the calling thread and
    /// returns the sink result; filtered or dropped items count as success.
    /// With queues, routes the item to a task and returns whether it was
    /// enqueued. Returns false for pull pipelines, for a stopped synchronous
    /// pipeline, and when the partitioner fails. A configured push timeout
    /// makes this wait for space in a full bounded queue.
    pub fn push(&self, item: I) -> bool {
        let deadline = self.shared.push_timeout.map(|timeout| Instant::now() + timeout);
        self.shared.enqueue(item, deadline)
    }

    /// Like [`push`](Self::push), waiting up to `timeout` for queue space.
    ///
    /// The wait blocks the calling thread. When the caller is a stage function
    /// of an upstream pipeline, that blocks one of the upstream pool's worker
    /// threads for as long as the downstream queue stays full, so keep the
    /// timeout short for chained pipelines.
    pub fn push_timeout(&self, item: I, timeout: Duration) -> bool {
        self.shared.enqueue(item, Some(Instant::now() + timeout))
    }
}

impl<I, O> Pipeline<I, O> {
    /// Number of items waiting in task queues.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.slots.iter().map(|slot| slot.queue.len()).sum()
    }

    /// Registers the handler for item failures, replacing any previous one.
    ///
    /// The handler runs on whichever thread caught the failure. Without a
    /// handler, failures are reported as `item.failed` events.
    pub fn on_exception<F>(&self, handler: F) -> &Self
    where
        F: Fn(&ProcessingError) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(handler));
        self
    }

    /// Returns true between `start()` and `stop()`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The number of task partitions.
    #[must_use]
    pub fn tasks(&self) -> usize {
        self.shared.tasks
    }

    /// The number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.shared.threads
    }

    /// Where items come from.
    #[must_use]
    pub fn source_mode(&self) -> SourceMode {
        self.shared.source.mode()
    }

    /// The queue backing each task, `None` for synchronous push and pull pipelines.
    #[must_use]
    pub fn queue_kind(&self) -> Option<QueueKind> {
        self.shared.queue
    }
}

impl<I, O> Drop for Pipeline<I, O> {
    fn drop(&mut self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.wake_all();
            self.shared.emit(PIPELINE_STOPPED, json!({ "dropped": true }));
        }
        // Dropping the pool detaches any loop still running.
        self.lifecycle.get_mut().pool.take();
    }
}

impl<I, O> std::fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.shared.name)
            .field("source", &self.shared.source.mode())
            .field("tasks", &self.shared.tasks)
            .field("threads", &self.shared.threads)
            .field("queue", &self.shared.queue)
            .field("running", &self.is_running())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::builder;
    use crate::testing::{wait_until, Counter, Recorder};
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_sync_push_runs_on_caller() {
        let seen = Recorder::new();
        let sink = seen.clone();
        let pipeline = builder::<i32>()
            .from_push()
            .to(move |v| {
                sink.record((*v, thread::current().id()));
                Ok(*v > 0)
            })
            .build()
            .unwrap();

        pipeline.start().unwrap();
        assert!(pipeline.push(1));
        assert!(!pipeline.push(-1));
        assert_eq!(pipeline.size(), 0);
        assert!(seen.items().iter().all(|(_, id)| *id == thread::current().id()));
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_sync_push_rejected_while_stopped() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .from_push()
            .to(|_| Ok(true))
            .build()
            .unwrap();

        assert!(!pipeline.push(1));
        assert_eq!(events.count(PUSH_REJECTED), 1);
    }

    #[test]
    fn test_pull_pipeline_rejects_push() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .from_pull(|_| Ok(None))
            .to(|_| Ok(true))
            .build()
            .unwrap();

        assert!(!pipeline.push(1));
        assert_eq!(events.count(PUSH_REJECTED), 1);
        assert_eq!(pipeline.source_mode(), SourceMode::Pull);
        assert_eq!(pipeline.queue_kind(), None);
    }

    #[test]
    fn test_queued_push_while_stopped_is_kept() {
        let delivered = Counter::new();
        let sink = delivered.clone();
        let pipeline = builder::<i32>()
            .queue(QueueKind::Unbounded)
            .unwrap()
            .from_push()
            .to(move |_| {
                sink.increment();
                Ok(true)
            })
            .build()
            .unwrap();

        assert!(pipeline.push(1));
        assert!(pipeline.push(2));
        assert_eq!(pipeline.size(), 2);

        pipeline.start().unwrap();
        assert!(wait_until(WAIT, || delivered.get() == 2));
        assert_eq!(pipeline.size(), 0);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_bounded_queue_full() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .queue(QueueKind::Bounded { capacity: 2 })
            .unwrap()
            .from_push()
            .to(|_| Ok(true))
            .build()
            .unwrap();

        assert!(pipeline.push(1));
        assert!(pipeline.push(2));
        assert!(!pipeline.push(3));
        assert!(!pipeline.push_timeout(4, Duration::from_millis(20)));
        assert_eq!(pipeline.size(), 2);
        assert_eq!(events.count(PUSH_REJECTED), 2);
    }

    #[test]
    fn test_push_timeout_waits_for_space() {
        let pipeline = Arc::new(
            builder::<i32>()
                .queue(QueueKind::Bounded { capacity: 1 })
                .unwrap()
                .from_push()
                .to(|_| Ok(true))
                .build()
                .unwrap(),
        );

        assert!(pipeline.push(1));
        let starter = Arc::clone(&pipeline);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            starter.start().map(|_| ()).map_err(|e| e.to_string())
        });

        assert!(pipeline.push_timeout(2, WAIT));
        handle.join().unwrap().unwrap();
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_chained_push_to_full_queue_gives_up_after_timeout() {
        let downstream = Arc::new(
            builder::<i32>()
                .queue(QueueKind::Bounded { capacity: 1 })
                .unwrap()
                .from_push()
                .to(|_| Ok(true))
                .build()
                .unwrap(),
        );
        assert!(downstream.push(0));

        let forwarded = Recorder::new();
        let (target, seen) = (Arc::clone(&downstream), forwarded.clone());
        let upstream = builder::<i32>()
            .queue(QueueKind::Unbounded)
            .unwrap()
            .from_push()
            .to(move |v| {
                let began = Instant::now();
                let accepted = target.push_timeout(*v, Duration::from_millis(30));
                seen.record((accepted, began.elapsed()));
                Ok(accepted)
            })
            .build()
            .unwrap();

        upstream.start().unwrap();
        upstream.push(1);
        upstream.push(2);

        assert!(wait_until(WAIT, || forwarded.len() == 2));
        for (accepted, waited) in forwarded.items() {
            assert!(!accepted);
            assert!(waited >= Duration::from_millis(30));
        }
        assert_eq!(downstream.size(), 1);
        upstream.stop().unwrap();
    }

    #[test]
    fn test_partition_out_of_range_reported() {
        let failures = Recorder::new();
        let seen = failures.clone();
        let pipeline = builder::<i32>()
            .tasks(2)
            .unwrap()
            .queue(QueueKind::Unbounded)
            .unwrap()
            .partitioner(|_, _| 7)
            .from_push()
            .to(|_| Ok(true))
            .build()
            .unwrap();

        pipeline.on_exception(move |e| seen.record((e.stage, e.task, e.to_string())));
        assert!(!pipeline.push(1));

        let items = failures.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, Stage::Partition);
        assert_eq!(items[0].1, 0);
        assert!(items[0].2.contains("task 7"));
    }

    #[test]
    fn test_failure_without_handler_emits_event() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .from_push()
            .to(|_| Err(anyhow!("storage unavailable")))
            .build()
            .unwrap();

        pipeline.start().unwrap();
        assert!(!pipeline.push(1));

        let failed = events.events_of_type(ITEM_FAILED);
        assert_eq!(failed.len(), 1);
        let data = failed[0].1.clone().unwrap();
        assert_eq!(data["stage"], "sink");
        assert_eq!(data["pipeline"], "pipeline");
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .from_push()
            .to(|_| Err(anyhow!("boom")))
            .build()
            .unwrap();

        pipeline.start().unwrap();
        pipeline.on_exception(|_| panic!("handler bug"));
        assert!(!pipeline.push(1));
        assert!(!pipeline.push(2));
        assert_eq!(events.count(HANDLER_PANICKED), 2);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .queue(QueueKind::Unbounded)
            .unwrap()
            .from_push()
            .to(|_| Ok(true))
            .build()
            .unwrap();

        pipeline.start().unwrap().start().unwrap();
        assert!(pipeline.is_running());
        pipeline.stop().unwrap();
        pipeline.stop().unwrap();
        assert!(!pipeline.is_running());

        assert_eq!(events.count(PIPELINE_STARTED), 1);
        assert_eq!(events.count(PIPELINE_STOPPED), 1);
    }

    #[test]
    fn test_restart_after_stop() {
        let delivered = Counter::new();
        let sink = delivered.clone();
        let pipeline = builder::<i32>()
            .queue(QueueKind::Unbounded)
            .unwrap()
            .from_push()
            .to(move |_| {
                sink.increment();
                Ok(true)
            })
            .build()
            .unwrap();

        pipeline.start().unwrap();
        pipeline.push(1);
        assert!(wait_until(WAIT, || delivered.get() == 1));
        pipeline.stop().unwrap();
        pipeline.join();

        pipeline.push(2);
        pipeline.start().unwrap();
        assert!(wait_until(WAIT, || delivered.get() == 2));
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_stop_times_out_on_stuck_item() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .shutdown_grace(Duration::from_millis(20))
            .queue(QueueKind::Unbounded)
            .unwrap()
            .from_push()
            .to(|_| {
                thread::sleep(Duration::from_millis(300));
                Ok(true)
            })
            .build()
            .unwrap();

        pipeline.start().unwrap();
        pipeline.push(1);
        thread::sleep(Duration::from_millis(50));

        let err = pipeline.stop().unwrap_err();
        assert_eq!(err.pending_loops, 1);
        assert_eq!(events.count(PIPELINE_SHUTDOWN_TIMED_OUT), 1);

        pipeline.join();
    }

    #[test]
    fn test_stop_from_inside_sink() {
        let handle: Arc<OnceLock<Weak<Pipeline<i32, i32>>>> = Arc::new(OnceLock::new());
        let stop_result = Recorder::new();
        let (slot, result) = (Arc::clone(&handle), stop_result.clone());

        let pipeline = Arc::new(
            builder::<i32>()
                .queue(QueueKind::Unbounded)
                .unwrap()
                .from_push()
                .to(move |_| {
                    if let Some(pipeline) = slot.get().and_then(Weak::upgrade) {
                        result.record(pipeline.stop().is_ok());
                    }
                    Ok(true)
                })
                .build()
                .unwrap(),
        );
        let _ = handle.set(Arc::downgrade(&pipeline));

        pipeline.start().unwrap();
        pipeline.push(1);

        assert!(wait_until(WAIT, || !stop_result.is_empty()));
        assert_eq!(stop_result.items(), vec![true]);
        assert!(!pipeline.is_running());
        pipeline.join();
    }

    /// Sink that tracks how many calls overlap on the same task.
    fn overlap_tracker(active: &Arc<AtomicUsize>, widest: &Arc<AtomicUsize>, hold: Duration) {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        widest.fetch_max(now, Ordering::SeqCst);
        thread::sleep(hold);
        active.fetch_sub(1, Ordering::SeqCst);
    }

    #[test]
    fn test_restart_from_inside_sink_keeps_one_owner_per_task() {
        let handle: Arc<OnceLock<Weak<Pipeline<i32, i32>>>> = Arc::new(OnceLock::new());
        let restarts = Recorder::new();
        let delivered = Recorder::new();
        let active = Arc::new(AtomicUsize::new(0));
        let widest = Arc::new(AtomicUsize::new(0));
        let (slot, restart, seen) = (Arc::clone(&handle), restarts.clone(), delivered.clone());
        let (busy, max_busy) = (Arc::clone(&active), Arc::clone(&widest));

        let pipeline = Arc::new(
            builder::<i32>()
                .tasks(2)
                .unwrap()
                .threads(2)
                .unwrap()
                .queue(QueueKind::Unbounded)
                .unwrap()
                .partitioner(crate::partition::modulo(|v: &i32| u64::from(v.unsigned_abs())))
                .from_push()
                .to(move |v| {
                    if *v % 2 == 1 {
                        overlap_tracker(&busy, &max_busy, Duration::from_millis(300));
                        seen.record(*v);
                    } else if let Some(pipeline) = slot.get().and_then(Weak::upgrade) {
                        let began = Instant::now();
                        let stopped = pipeline.stop().is_ok();
                        let waited = began.elapsed();
                        let restarted = pipeline.start().is_ok();
                        restart.record((stopped, waited, restarted));
                    }
                    Ok(true)
                })
                .build()
                .unwrap(),
        );
        let _ = handle.set(Arc::downgrade(&pipeline));

        pipeline.start().unwrap();
        assert!(pipeline.push(1));
        thread::sleep(Duration::from_millis(50));
        assert!(pipeline.push(0));
        assert!(pipeline.push(3));

        assert!(wait_until(WAIT, || delivered.len() == 2));
        let outcome = restarts.items();
        assert_eq!(outcome.len(), 1);
        let (stopped, waited, restarted) = outcome[0];
        assert!(stopped);
        assert!(restarted);
        assert!(waited >= Duration::from_millis(150), "stop returned after {waited:?}");
        assert_eq!(delivered.items(), vec![1, 3]);
        assert_eq!(widest.load(Ordering::SeqCst), 1);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_restart_after_timed_out_stop_waits_for_old_loop() {
        let delivered = Recorder::new();
        let active = Arc::new(AtomicUsize::new(0));
        let widest = Arc::new(AtomicUsize::new(0));
        let (seen, busy, max_busy) = (delivered.clone(), Arc::clone(&active), Arc::clone(&widest));

        let pipeline = builder::<i32>()
            .shutdown_grace(Duration::from_millis(20))
            .queue(QueueKind::Unbounded)
            .unwrap()
            .from_push()
            .to(move |v| {
                overlap_tracker(&busy, &max_busy, Duration::from_millis(if *v == 1 { 300 } else { 1 }));
                seen.record(*v);
                Ok(true)
            })
            .build()
            .unwrap();

        pipeline.start().unwrap();
        pipeline.push(1);
        thread::sleep(Duration::from_millis(50));
        assert!(pipeline.stop().is_err());

        pipeline.push(2);
        pipeline.start().unwrap();

        assert!(wait_until(WAIT, || delivered.len() == 2));
        assert_eq!(delivered.items(), vec![1, 2]);
        assert_eq!(widest.load(Ordering::SeqCst), 1);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_wait_returns_early_on_stop() {
        let pipeline = Arc::new(
            builder::<i32>()
                .queue(QueueKind::Unbounded)
                .unwrap()
                .from_push()
                .to(|_| Ok(true))
                .build()
                .unwrap(),
        );
        pipeline.start().unwrap();

        let stopper = Arc::clone(&pipeline);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.stop().map_err(|e| e.to_string())
        });

        let started = Instant::now();
        pipeline.wait(Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_drop_running_pipeline() {
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = builder::<i32>()
            .events(events.clone())
            .from_pull(|_| Ok(Some(1)))
            .to(|_| Ok(true))
            .build()
            .unwrap();

        pipeline.start().unwrap();
        drop(pipeline);
        assert_eq!(events.count(PIPELINE_STOPPED), 1);
    }

    #[test]
    fn test_accessors() {
        let pipeline = builder::<i32>()
            .name("replicator")
            .tasks(3)
            .unwrap()
            .from_push()
            .to(|_| Ok(true))
            .build()
            .unwrap();

        assert_eq!(pipeline.name(), "replicator");
        assert_eq!(pipeline.tasks(), 3);
        assert_eq!(pipeline.threads(), 3);
        assert_eq!(pipeline.source_mode(), SourceMode::Push);
        assert!(!pipeline.is_running());
    }
}
