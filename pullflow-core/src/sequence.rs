//! The element sequence protocol every stage produces and consumes

use tracing::trace;

use crate::error::Result;

/// A single-pass, possibly infinite, ordered sequence of values
///
/// Each pull has three outcomes: `Ok(Some(value))`, `Ok(None)` for end of
/// sequence, and `Err(error)` for a failure in that slot. A failure consumes
/// exactly one slot; pulling again asks the upstream for the next one.
pub trait Sequence: Send {
    /// The type of elements produced
    type Item;

    /// Pull the next element
    fn next_item(&mut self) -> Result<Option<Self::Item>>;

    /// Bounds on the number of remaining elements, like `Iterator::size_hint`
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}

impl<S: Sequence + ?Sized> Sequence for &mut S {
    type Item = S::Item;

    fn next_item(&mut self) -> Result<Option<Self::Item>> {
        (**self).next_item()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (**self).size_hint()
    }
}

impl<S: Sequence + ?Sized> Sequence for Box<S> {
    type Item = S::Item;

    fn next_item(&mut self) -> Result<Option<Self::Item>> {
        (**self).next_item()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (**self).size_hint()
    }
}

/// A sequence over the elements of an infallible iterator
#[derive(Debug, Clone)]
pub struct IterSequence<I> {
    iter: I,
}

impl<I> IterSequence<I> {
    /// Wrap an iterator
    pub fn new<T>(iter: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I> Sequence for IterSequence<I>
where
    I: Iterator + Send,
{
    type Item = I::Item;

    fn next_item(&mut self) -> Result<Option<Self::Item>> {
        Ok(self.iter.next())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// A sequence over an iterator whose elements may already be failures
#[derive(Debug, Clone)]
pub struct ResultSequence<I> {
    iter: I,
}

impl<I> ResultSequence<I> {
    /// Wrap an iterator of results
    pub fn new<T>(iter: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I, T> Sequence for ResultSequence<I>
where
    I: Iterator<Item = Result<T>> + Send,
{
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>> {
        self.iter.next().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// A sequence driven by a generator closure
pub struct FromFn<F> {
    generate: F,
}

impl<F> FromFn<F> {
    /// Create a sequence that calls `generate` on every pull
    pub fn new(generate: F) -> Self {
        Self { generate }
    }
}

impl<F, T> Sequence for FromFn<F>
where
    F: FnMut() -> Result<Option<T>> + Send,
{
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>> {
        (self.generate)()
    }
}

impl<F> std::fmt::Debug for FromFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FromFn").finish_non_exhaustive()
    }
}

/// Guards the single-pass contract: after end of sequence, stays ended
#[derive(Debug)]
pub struct Fuse<S> {
    inner: Option<S>,
}

impl<S: Sequence> Fuse<S> {
    /// Fuse a sequence
    pub fn new(inner: S) -> Self {
        Self { inner: Some(inner) }
    }

    /// Whether end of sequence has been observed, or the upstream was closed
    pub fn is_exhausted(&self) -> bool {
        self.inner.is_none()
    }

    /// Drop the upstream now; later pulls report end of sequence
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            trace!("sequence closed before its end");
        }
    }
}

impl<S: Sequence> Sequence for Fuse<S> {
    type Item = S::Item;

    fn next_item(&mut self) -> Result<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        match inner.next_item() {
            Ok(None) => {
                // Release upstream resources as soon as the end is seen.
                self.inner = None;
                trace!("end of sequence");
                Ok(None)
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.as_ref().map_or((0, Some(0)), |s| s.size_hint())
    }
}
