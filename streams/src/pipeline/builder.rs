//! Typestate pipeline builders.
//!
//! Each stage of assembly has its own builder type exposing only the calls
//! that are legal at that point:
//!
//! ```text
//! SourceBuilder --from_pull/from_push--> FilterBuilder --process--> ProcessBuilder
//!                                              |                        |
//!                                              +----------to------------+
//!                                                         v
//!                                                    SinkBuilder --post--> PostBuilder
//! ```
//!
//! Every call borrows the builder and returns a new value, so several
//! pipelines can branch from a shared prefix without affecting each other.

use super::chain::{
    and_filter, identity, then_post, then_sink, then_transform, FilterFn, PostFn, SinkFn, StageChain,
    SupplierFn, TransformFn,
};
use super::runtime::Pipeline;
use crate::config::PipelineConfig;
use crate::errors::{ConfigResult, ConfigurationError};
use crate::events::{EventSink, LoggingEventSink};
use crate::partition::Partitioner;
use crate::queue::QueueKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_NAME: &str = "pipeline";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Starts assembling a pipeline over inputs of type `I`.
#[must_use]
pub fn builder<I>() -> SourceBuilder<I>
where
    I: Clone + Send + Sync + 'static,
{
    SourceBuilder::new()
}

/// Where a pipeline's items come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Task loops ask a supplier for their next item.
    Pull,
    /// Items are handed in through `push()`.
    Push,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pull => write!(f, "pull"),
            Self::Push => write!(f, "push"),
        }
    }
}

pub(crate) enum Source<I> {
    Pull(SupplierFn<I>),
    Push,
}

impl<I> Source<I> {
    pub(crate) const fn mode(&self) -> SourceMode {
        match self {
            Self::Pull(_) => SourceMode::Pull,
            Self::Push => SourceMode::Push,
        }
    }
}

impl<I> Clone for Source<I> {
    fn clone(&self) -> Self {
        match self {
            Self::Pull(supplier) => Self::Pull(Arc::clone(supplier)),
            Self::Push => Self::Push,
        }
    }
}

/// Execution settings shared by every builder stage.
pub(crate) struct Settings<I> {
    pub(crate) name: String,
    pub(crate) threads: Option<usize>,
    pub(crate) tasks: usize,
    pub(crate) queue: Option<QueueKind>,
    pub(crate) partitioner: Option<Partitioner<I>>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) shutdown_grace: Duration,
    pub(crate) idle_wait: Duration,
    pub(crate) push_timeout: Option<Duration>,
}

impl<I> Default for Settings<I> {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            threads: None,
            tasks: 1,
            queue: None,
            partitioner: None,
            events: Arc::new(LoggingEventSink::default()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            idle_wait: DEFAULT_IDLE_WAIT,
            push_timeout: None,
        }
    }
}

impl<I> Clone for Settings<I> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            threads: self.threads,
            tasks: self.tasks,
            queue: self.queue,
            partitioner: self.partitioner.clone(),
            events: Arc::clone(&self.events),
            shutdown_grace: self.shutdown_grace,
            idle_wait: self.idle_wait,
            push_timeout: self.push_timeout,
        }
    }
}

impl<I> Settings<I> {
    /// Thread count, defaulting to one thread per task.
    pub(crate) fn threads(&self) -> usize {
        self.threads.unwrap_or(self.tasks)
    }
}

/// First builder stage: execution settings and the item source.
pub struct SourceBuilder<I> {
    settings: Settings<I>,
}

impl<I> Clone for SourceBuilder<I> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
        }
    }
}

impl<I> fmt::Debug for SourceBuilder<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBuilder")
            .field("name", &self.settings.name)
            .field("tasks", &self.settings.tasks)
            .field("threads", &self.settings.threads())
            .field("queue", &self.settings.queue)
            .finish_non_exhaustive()
    }
}

impl<I> Default for SourceBuilder<I>
where
    I: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> SourceBuilder<I>
where
    I: Clone + Send + Sync + 'static,
{
    /// Creates a builder with one task, no queue and the logging event sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
        }
    }

    fn with(&self, f: impl FnOnce(&mut Settings<I>)) -> Self {
        let mut settings = self.settings.clone();
        f(&mut settings);
        Self { settings }
    }

    /// Names the pipeline. Used for worker thread names and in every event.
    #[must_use]
    pub fn name(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.with(|s| s.name = name)
    }

    /// Sets the number of execution threads. Defaults to the task count.
    ///
    /// # Errors
    ///
    /// Returns an error if `threads` is zero.
    pub fn threads(&self, threads: usize) -> ConfigResult<Self> {
        if threads == 0 {
            return Err(ConfigurationError::positive("threads", threads));
        }
        Ok(self.with(|s| s.threads = Some(threads)))
    }

    /// Sets the number of task partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if `tasks` is zero.
    pub fn tasks(&self, tasks: usize) -> ConfigResult<Self> {
        if tasks == 0 {
            return Err(ConfigurationError::positive("tasks", tasks));
        }
        Ok(self.with(|s| s.tasks = tasks))
    }

    /// Backs every task with a queue of the given kind.
    ///
    /// Without a queue, a push pipeline runs the whole stage chain on the
    /// pushing thread. Pull pipelines ignore the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a bounded kind has zero capacity.
    pub fn queue(&self, kind: QueueKind) -> ConfigResult<Self> {
        kind.validate()?;
        Ok(self.with(|s| s.queue = Some(kind)))
    }

    /// Sets the function routing pushed items to tasks.
    ///
    /// Required for a queued push pipeline with more than one task.
    #[must_use]
    pub fn partitioner<P>(&self, partitioner: P) -> Self
    where
        P: Fn(&I, usize) -> usize + Send + Sync + 'static,
    {
        let partitioner: Partitioner<I> = Arc::new(partitioner);
        self.with(|s| s.partitioner = Some(partitioner))
    }

    /// Sets the sink receiving lifecycle and failure events.
    #[must_use]
    pub fn events(&self, events: Arc<dyn EventSink>) -> Self {
        self.with(|s| s.events = events)
    }

    /// Sets how long `stop()` waits for task loops before detaching them.
    #[must_use]
    pub fn shutdown_grace(&self, grace: Duration) -> Self {
        self.with(|s| s.shutdown_grace = grace)
    }

    /// Sets the pause between pull attempts that returned nothing.
    #[must_use]
    pub fn idle_wait(&self, idle: Duration) -> Self {
        self.with(|s| s.idle_wait = idle)
    }

    /// Makes `push()` wait up to `timeout` for space in a full bounded queue.
    ///
    /// See [`Pipeline::push_timeout`] for how the wait blocks the pushing thread.
    #[must_use]
    pub fn push_timeout(&self, timeout: Duration) -> Self {
        self.with(|s| s.push_timeout = Some(timeout))
    }

    /// Applies a serializable configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn configure(&self, config: &PipelineConfig) -> ConfigResult<Self> {
        config.validate()?;
        let queue = config.queue.kind()?;
        Ok(self.with(|s| {
            s.threads = Some(config.threads);
            s.tasks = config.tasks;
            s.queue = queue;
            s.push_timeout = Some(config.push_timeout());
            s.shutdown_grace = config.shutdown_grace();
            s.idle_wait = config.idle_wait();
        }))
    }

    /// Drives the pipeline by asking `supplier` for items, once per task loop.
    ///
    /// The supplier receives the calling loop's task index. `Ok(None)` means
    /// nothing is available yet; the loop idles briefly and asks again.
    #[must_use]
    pub fn from_pull<F>(&self, supplier: F) -> FilterBuilder<I>
    where
        F: Fn(usize) -> anyhow::Result<Option<I>> + Send + Sync + 'static,
    {
        FilterBuilder {
            draft: Draft::new(self.settings.clone(), Source::Pull(Arc::new(supplier))),
        }
    }

    /// Drives the pipeline through `push()`.
    #[must_use]
    pub fn from_push(&self) -> FilterBuilder<I> {
        FilterBuilder {
            draft: Draft::new(self.settings.clone(), Source::Push),
        }
    }
}

/// The pipeline assembled so far, shared by every post-source stage.
struct Draft<I, O> {
    settings: Settings<I>,
    source: Source<I>,
    filter: Option<FilterFn<I>>,
    transform: TransformFn<I, O>,
    sink: Option<SinkFn<O>>,
    post: Option<PostFn<I>>,
}

impl<I, O> Clone for Draft<I, O> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            source: self.source.clone(),
            filter: self.filter.clone(),
            transform: Arc::clone(&self.transform),
            sink: self.sink.clone(),
            post: self.post.clone(),
        }
    }
}

impl<I> Draft<I, I>
where
    I: Clone + Send + Sync + 'static,
{
    fn new(settings: Settings<I>, source: Source<I>) -> Self {
        Self {
            settings,
            source,
            filter: None,
            transform: identity(),
            sink: None,
            post: None,
        }
    }
}

impl<I, O> Draft<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    fn filter(&self, predicate: FilterFn<I>) -> Self {
        Self {
            filter: Some(and_filter(self.filter.clone(), predicate)),
            ..self.clone()
        }
    }

    fn process<T: 'static>(&self, f: TransformFn<O, T>) -> Draft<I, T> {
        Draft {
            settings: self.settings.clone(),
            source: self.source.clone(),
            filter: self.filter.clone(),
            transform: then_transform(Arc::clone(&self.transform), f),
            sink: None,
            post: None,
        }
    }

    fn to(&self, sink: SinkFn<O>) -> Self {
        Self {
            sink: Some(then_sink(self.sink.clone(), sink)),
            ..self.clone()
        }
    }

    fn post(&self, post: PostFn<I>) -> Self {
        Self {
            post: Some(then_post(self.post.clone(), post)),
            ..self.clone()
        }
    }

    fn build(&self) -> ConfigResult<Pipeline<I, O>> {
        let Some(sink) = self.sink.clone() else {
            return Err(ConfigurationError::new("a pipeline needs at least one sink").with_field("to"));
        };

        let queued = self.settings.queue.is_some();
        if matches!(self.source, Source::Push)
            && queued
            && self.settings.tasks > 1
            && self.settings.partitioner.is_none()
        {
            return Err(ConfigurationError::new(format!(
                "a queued push pipeline with {} tasks needs a partitioner",
                self.settings.tasks
            ))
            .with_field("partitioner"));
        }

        let chain = StageChain {
            filter: self.filter.clone(),
            transform: Arc::clone(&self.transform),
            sink,
            post: self.post.clone(),
        };

        Ok(Pipeline::new(self.settings.clone(), self.source.clone(), chain))
    }
}

/// Source chosen; filters, transforms and sinks may follow.
pub struct FilterBuilder<I> {
    draft: Draft<I, I>,
}

/// At least one transform added; more transforms or the first sink may follow.
pub struct ProcessBuilder<I, O> {
    draft: Draft<I, O>,
}

/// At least one sink added; more sinks, post hooks, or `build()` may follow.
pub struct SinkBuilder<I, O> {
    draft: Draft<I, O>,
}

/// At least one post hook added; more post hooks or `build()` may follow.
pub struct PostBuilder<I, O> {
    draft: Draft<I, O>,
}

macro_rules! builder_common {
    ($name:ident <$($p:ident),+>) => {
        impl<$($p),+> Clone for $name<$($p),+> {
            fn clone(&self) -> Self {
                Self {
                    draft: self.draft.clone(),
                }
            }
        }

        impl<$($p),+> fmt::Debug for $name<$($p),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("name", &self.draft.settings.name)
                    .field("source", &self.draft.source.mode())
                    .field("filter", &self.draft.filter.is_some())
                    .field("post", &self.draft.post.is_some())
                    .finish_non_exhaustive()
            }
        }
    };
}

builder_common!(FilterBuilder<I>);
builder_common!(ProcessBuilder<I, O>);
builder_common!(SinkBuilder<I, O>);
builder_common!(PostBuilder<I, O>);

impl<I> FilterBuilder<I>
where
    I: Clone + Send + Sync + 'static,
{
    /// Adds a predicate; an item passes only if every predicate accepts it.
    ///
    /// Predicates run in the order added and stop at the first rejection.
    #[must_use]
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&I) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            draft: self.draft.filter(Arc::new(predicate)),
        }
    }

    /// Adds a transform. Returning `Ok(None)` drops the item from here on.
    #[must_use]
    pub fn process<T, F>(&self, f: F) -> ProcessBuilder<I, T>
    where
        T: 'static,
        F: Fn(I) -> anyhow::Result<Option<T>> + Send + Sync + 'static,
    {
        ProcessBuilder {
            draft: self.draft.process(Arc::new(f)),
        }
    }

    /// Adds an infallible transform that never drops items.
    #[must_use]
    pub fn map<T, F>(&self, f: F) -> ProcessBuilder<I, T>
    where
        T: 'static,
        F: Fn(I) -> T + Send + Sync + 'static,
    {
        self.process(move |input| Ok(Some(f(input))))
    }

    /// Adds the first sink.
    #[must_use]
    pub fn to<F>(&self, sink: F) -> SinkBuilder<I, I>
    where
        F: Fn(&I) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        SinkBuilder {
            draft: self.draft.to(Arc::new(sink)),
        }
    }
}

impl<I, O> ProcessBuilder<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    /// Adds a transform, skipped for items an earlier transform dropped.
    #[must_use]
    pub fn process<T, F>(&self, f: F) -> ProcessBuilder<I, T>
    where
        T: 'static,
        F: Fn(O) -> anyhow::Result<Option<T>> + Send + Sync + 'static,
    {
        ProcessBuilder {
            draft: self.draft.process(Arc::new(f)),
        }
    }

    /// Adds an infallible transform that never drops items.
    #[must_use]
    pub fn map<T, F>(&self, f: F) -> ProcessBuilder<I, T>
    where
        T: 'static,
        F: Fn(O) -> T + Send + Sync + 'static,
    {
        self.process(move |output| Ok(Some(f(output))))
    }

    /// Adds the first sink.
    #[must_use]
    pub fn to<F>(&self, sink: F) -> SinkBuilder<I, O>
    where
        F: Fn(&O) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        SinkBuilder {
            draft: self.draft.to(Arc::new(sink)),
        }
    }
}

impl<I, O> SinkBuilder<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    /// Adds a sink, run only if every earlier sink returned true.
    #[must_use]
    pub fn to<F>(&self, sink: F) -> Self
    where
        F: Fn(&O) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            draft: self.draft.to(Arc::new(sink)),
        }
    }

    /// Adds a post hook over the original input and the task index.
    #[must_use]
    pub fn post<F>(&self, post: F) -> PostBuilder<I, O>
    where
        F: Fn(&I, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        PostBuilder {
            draft: self.draft.post(Arc::new(post)),
        }
    }

    /// Builds a stopped pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if a queued push pipeline has several tasks and no
    /// partitioner.
    pub fn build(&self) -> ConfigResult<Pipeline<I, O>> {
        self.draft.build()
    }
}

impl<I, O> PostBuilder<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: 'static,
{
    /// Adds a post hook, run after every earlier one.
    #[must_use]
    pub fn post<F>(&self, post: F) -> Self
    where
        F: Fn(&I, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            draft: self.draft.post(Arc::new(post)),
        }
    }

    /// Builds a stopped pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if a queued push pipeline has several tasks and no
    /// partitioner.
    pub fn build(&self) -> ConfigResult<Pipeline<I, O>> {
        self.draft.build()
    }
}
