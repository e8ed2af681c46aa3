//! Stage chains: the composed filter, transform, sink and post functions of a
//! pipeline, and the per-item execution that runs them.

use crate::errors::{ProcessingError, Stage};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Filter predicate over the original input.
pub(crate) type FilterFn<I> = Arc<dyn Fn(&I) -> anyhow::Result<bool> + Send + Sync>;
/// Transform from the input to the current output; `None` drops the item.
pub(crate) type TransformFn<I, O> = Arc<dyn Fn(I) -> anyhow::Result<Option<O>> + Send + Sync>;
/// Sink over the transformed output.
pub(crate) type SinkFn<O> = Arc<dyn Fn(&O) -> anyhow::Result<bool> + Send + Sync>;
/// Post hook over the original input and the task index.
pub(crate) type PostFn<I> = Arc<dyn Fn(&I, usize) -> anyhow::Result<()> + Send + Sync>;
/// Pull supplier keyed by task index; `None` means nothing available yet.
pub(crate) type SupplierFn<I> = Arc<dyn Fn(usize) -> anyhow::Result<Option<I>> + Send + Sync>;

/// Runs user code, turning both errors and panics into a [`ProcessingError`].
pub(crate) fn guarded<T>(
    stage: Stage,
    task: usize,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, ProcessingError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ProcessingError::new(stage, task, error)),
        Err(payload) => Err(ProcessingError::from_panic(stage, task, payload.as_ref())),
    }
}

pub(crate) fn identity<I: 'static>() -> TransformFn<I, I> {
    Arc::new(|input| Ok(Some(input)))
}

/// Conjunction of `prev` and `next`; `next` is never evaluated once `prev` rejects.
pub(crate) fn and_filter<I: 'static>(prev: Option<FilterFn<I>>, next: FilterFn<I>) -> FilterFn<I> {
    match prev {
        None => next,
        Some(prev) => Arc::new(move |input| Ok(prev(input)? && next(input)?)),
    }
}

/// `prev`, then `next` on its output unless `prev` dropped the item.
pub(crate) fn then_transform<I, O, T>(
    prev: TransformFn<I, O>,
    next: TransformFn<O, T>,
) -> TransformFn<I, T>
where
    I: 'static,
    O: 'static,
    T: 'static,
{
    Arc::new(move |input| match prev(input)? {
        Some(output) => next(output),
        None => Ok(None),
    })
}

/// `prev`, then `next` only if every earlier sink returned true.
pub(crate) fn then_sink<O: 'static>(prev: Option<SinkFn<O>>, next: SinkFn<O>) -> SinkFn<O> {
    match prev {
        None => next,
        Some(prev) => Arc::new(move |output| Ok(prev(output)? && next(output)?)),
    }
}

/// `prev` unconditionally, then `next`.
pub(crate) fn then_post<I: 'static>(prev: Option<PostFn<I>>, next: PostFn<I>) -> PostFn<I> {
    match prev {
        None => next,
        Some(prev) => Arc::new(move |input, task| {
            prev(input, task)?;
            next(input, task)
        }),
    }
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The filter rejected the item.
    Filtered,
    /// A transform returned `None`; no sink ran.
    Dropped,
    /// The sink chain ran and returned this result.
    Delivered(bool),
}

impl Outcome {
    /// Result reported to a pusher. Filtered and dropped items count as handled.
    pub(crate) const fn accepted(self) -> bool {
        match self {
            Self::Filtered | Self::Dropped => true,
            Self::Delivered(result) => result,
        }
    }
}

/// The immutable bundle of stage functions a pipeline runs for each item.
pub(crate) struct StageChain<I, O> {
    pub(crate) filter: Option<FilterFn<I>>,
    pub(crate) transform: TransformFn<I, O>,
    pub(crate) sink: SinkFn<O>,
    pub(crate) post: Option<PostFn<I>>,
}

impl<I, O> Clone for StageChain<I, O> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            transform: Arc::clone(&self.transform),
            sink: Arc::clone(&self.sink),
            post: self.post.clone(),
        }
    }
}

impl<I: Clone, O> StageChain<I, O> {
    /// Runs one item through filter, transform, sink and post.
    ///
    /// Post hooks see the original input and run whether or not the sink
    /// chain was reached, but not after a stage failed.
    pub(crate) fn run(&self, input: I, task: usize) -> Result<Outcome, ProcessingError> {
        if let Some(filter) = &self.filter {
            if !guarded(Stage::Filter, task, || filter(&input))? {
                return Ok(Outcome::Filtered);
            }
        }

        let output = guarded(Stage::Process, task, || (self.transform)(input.clone()))?;

        let outcome = match output {
            Some(output) => Outcome::Delivered(guarded(Stage::Sink, task, || (self.sink)(&output))?),
            None => Outcome::Dropped,
        };

        if let Some(post) = &self.post {
            guarded(Stage::Post, task, || post(&input, task))?;
        }

        Ok(outcome)
    }
}

impl<I, O> std::fmt::Debug for StageChain<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageChain")
            .field("filter", &self.filter.is_some())
            .field("post", &self.post.is_some())
            .finish_non_exhaustive()
    }
}
