//! Pipeline composition and evaluation

use crate::error::Result;
use crate::sequence::{Fuse, IterSequence, ResultSequence, Sequence};
use crate::stage::{Sink, Source, Transform};

/// A lazily evaluated chain of stages
///
/// A pipeline owns no data. Building it is O(1) per stage; elements only move
/// when a sink (or the caller, through `Sequence`/`Iterator`) pulls.
///
/// ```
/// use pullflow_core::prelude::*;
///
/// let out = Pipeline::from_source(Range::new(0, 10))?
///     .then(Filter::new(|x: &i64| *x > 5))
///     .then(Take::new(3))
///     .drain(Collect::new())?;
/// assert_eq!(out, vec![6, 7, 8]);
/// # Ok::<(), pullflow_core::Error>(())
/// ```
#[derive(Debug)]
pub struct Pipeline<S> {
    seq: Fuse<S>,
}

impl<S: Sequence> Pipeline<S> {
    /// Start a pipeline from an existing sequence
    pub fn new(seq: S) -> Self {
        Self {
            seq: Fuse::new(seq),
        }
    }

    /// Extend the chain with a transform
    pub fn then<T>(self, transform: T) -> Pipeline<T::Output>
    where
        T: Transform<Self>,
    {
        Pipeline::new(transform.apply(self))
    }

    /// Evaluate the chain with a sink and return its result
    ///
    /// Every stage of the chain is dropped, and its background resources torn
    /// down, before this returns.
    pub fn drain<K>(self, sink: K) -> Result<K::Output>
    where
        K: Sink<Self>,
    {
        sink.drain(self)
    }

    /// Stop evaluation early and release every resource held by the chain
    pub fn close(self) {
        drop(self);
    }

    /// Whether end of sequence has been reached
    pub fn is_exhausted(&self) -> bool {
        self.seq.is_exhausted()
    }
}

impl<S> Pipeline<S>
where
    S: Sequence,
{
    /// Start a pipeline from a source stage
    pub fn from_source<Src>(source: Src) -> Result<Pipeline<Src::Output>>
    where
        Src: Source<Output = S>,
    {
        Ok(Pipeline::new(source.open()?))
    }
}

impl<I> Pipeline<IterSequence<I>>
where
    I: Iterator + Send,
{
    /// Start a pipeline from anything iterable
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Pipeline::new(IterSequence::new(iter))
    }
}

impl<I, T> Pipeline<ResultSequence<I>>
where
    I: Iterator<Item = Result<T>> + Send,
{
    /// Start a pipeline from an iterator of results; failures keep their slot
    pub fn from_results<R>(iter: R) -> Self
    where
        R: IntoIterator<IntoIter = I>,
    {
        Pipeline::new(ResultSequence::new(iter))
    }
}

impl<S: Sequence> Sequence for Pipeline<S> {
    type Item = S::Item;

    fn next_item(&mut self) -> Result<Option<Self::Item>> {
        self.seq.next_item()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.seq.size_hint()
    }
}

impl<S: Sequence> Iterator for Pipeline<S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        self.seq.next_item().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.seq.size_hint()
    }
}
