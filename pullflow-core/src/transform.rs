//! Transform stages: one sequence in, one sequence out
//!
//! Every transform here is single-threaded and pulls its upstream exactly
//! once per demanded element, in upstream order. Failures pass through in
//! their slot unless a stage states otherwise.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::sequence::Sequence;
use crate::stage::Transform;

/// Apply a function to every element
#[derive(Clone)]
pub struct Map<F> {
    func: F,
}

impl<F> Map<F> {
    /// Create a new map stage
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<I, O, F> Transform<I> for Map<F>
where
    I: Sequence,
    F: FnMut(I::Item) -> O + Send,
{
    type Output = MapSequence<I, F>;

    fn apply(self, input: I) -> Self::Output {
        MapSequence {
            input,
            func: self.func,
        }
    }
}

/// Sequence produced by [`Map`]
pub struct MapSequence<I, F> {
    input: I,
    func: F,
}

impl<I, O, F> Sequence for MapSequence<I, F>
where
    I: Sequence,
    F: FnMut(I::Item) -> O + Send,
{
    type Item = O;

    fn next_item(&mut self) -> Result<Option<O>> {
        Ok(self.input.next_item()?.map(&mut self.func))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

/// Apply a fallible function to every element; an `Err` fails that slot
#[derive(Clone)]
pub struct TryMap<F> {
    func: F,
}

impl<F> TryMap<F> {
    /// Create a new fallible map stage
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<I, O, F> Transform<I> for TryMap<F>
where
    I: Sequence,
    F: FnMut(I::Item) -> Result<O> + Send,
{
    type Output = TryMapSequence<I, F>;

    fn apply(self, input: I) -> Self::Output {
        TryMapSequence {
            input,
            func: self.func,
        }
    }
}

/// Sequence produced by [`TryMap`]
pub struct TryMapSequence<I, F> {
    input: I,
    func: F,
}

impl<I, O, F> Sequence for TryMapSequence<I, F>
where
    I: Sequence,
    F: FnMut(I::Item) -> Result<O> + Send,
{
    type Item = O;

    fn next_item(&mut self) -> Result<Option<O>> {
        match self.input.next_item()? {
            Some(item) => (self.func)(item).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

/// Keep only elements matching a predicate
#[derive(Clone)]
pub struct Filter<P> {
    predicate: P,
}

impl<P> Filter<P> {
    /// Create a new filter stage
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }
}

impl<I, P> Transform<I> for Filter<P>
where
    I: Sequence,
    P: FnMut(&I::Item) -> bool + Send,
{
    type Output = FilterSequence<I, P>;

    fn apply(self, input: I) -> Self::Output {
        FilterSequence {
            input,
            predicate: self.predicate,
        }
    }
}

/// Sequence produced by [`Filter`]
pub struct FilterSequence<I, P> {
    input: I,
    predicate: P,
}

impl<I, P> Sequence for FilterSequence<I, P>
where
    I: Sequence,
    P: FnMut(&I::Item) -> bool + Send,
{
    type Item = I::Item;

    fn next_item(&mut self) -> Result<Option<I::Item>> {
        while let Some(item) = self.input.next_item()? {
            if (self.predicate)(&item) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.input.size_hint().1)
    }
}

/// Deliver at most `n` slots, then stop pulling
///
/// A failed slot counts towards `n`.
#[derive(Debug, Clone, Copy)]
pub struct Take {
    n: usize,
}

impl Take {
    /// Create a new take stage
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl<I: Sequence> Transform<I> for Take {
    type Output = TakeSequence<I>;

    fn apply(self, input: I) -> Self::Output {
        TakeSequence {
            input,
            remaining: self.n,
        }
    }
}

/// Sequence produced by [`Take`]
#[derive(Debug)]
pub struct TakeSequence<I> {
    input: I,
    remaining: usize,
}

impl<I: Sequence> Sequence for TakeSequence<I> {
    type Item = I::Item;

    fn next_item(&mut self) -> Result<Option<I::Item>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.input.next_item()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lower, upper) = self.input.size_hint();
        let upper = upper.map_or(self.remaining, |u| u.min(self.remaining));
        (lower.min(self.remaining), Some(upper))
    }
}

/// Discard the first `n` elements
#[derive(Debug, Clone, Copy)]
pub struct Skip {
    n: usize,
}

impl Skip {
    /// Create a new skip stage
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl<I: Sequence> Transform<I> for Skip {
    type Output = SkipSequence<I>;

    fn apply(self, input: I) -> Self::Output {
        SkipSequence {
            input,
            to_skip: self.n,
        }
    }
}

/// Sequence produced by [`Skip`]
#[derive(Debug)]
pub struct SkipSequence<I> {
    input: I,
    to_skip: usize,
}

impl<I: Sequence> Sequence for SkipSequence<I> {
    type Item = I::Item;

    fn next_item(&mut self) -> Result<Option<I::Item>> {
        while self.to_skip > 0 {
            self.to_skip -= 1;
            if self.input.next_item()?.is_none() {
                self.to_skip = 0;
                return Ok(None);
            }
        }
        self.input.next_item()
    }
}

/// Call a function on a reference to every element and pass it on unchanged
#[derive(Clone)]
pub struct Inspect<F> {
    func: F,
}

impl<F> Inspect<F> {
    /// Create a new inspect stage
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<I, F> Transform<I> for Inspect<F>
where
    I: Sequence,
    F: FnMut(&I::Item) + Send,
{
    type Output = InspectSequence<I, F>;

    fn apply(self, input: I) -> Self::Output {
        InspectSequence {
            input,
            func: self.func,
        }
    }
}

/// Sequence produced by [`Inspect`]
pub struct InspectSequence<I, F> {
    input: I,
    func: F,
}

impl<I, F> Sequence for InspectSequence<I, F>
where
    I: Sequence,
    F: FnMut(&I::Item) + Send,
{
    type Item = I::Item;

    fn next_item(&mut self) -> Result<Option<I::Item>> {
        let item = self.input.next_item()?;
        if let Some(item) = item.as_ref() {
            (self.func)(item);
        }
        Ok(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

/// Turn per-element failures into values instead of propagating them
///
/// The output element type is `Result<T>`; the stream keeps going past a
/// failed slot.
///
/// ```
/// use pullflow_core::prelude::*;
///
/// let out = Pipeline::from_results(vec![Ok(1), Err(Error::msg("bad")), Ok(3)])
///     .then(Try)
///     .drain(Collect::new())?;
/// assert_eq!(out.len(), 3);
/// assert!(out[1].is_err());
/// # Ok::<(), pullflow_core::Error>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Try;

impl<I: Sequence> Transform<I> for Try {
    type Output = TrySequence<I>;

    fn apply(self, input: I) -> Self::Output {
        TrySequence { input }
    }
}

/// Sequence produced by [`Try`]
#[derive(Debug)]
pub struct TrySequence<I> {
    input: I,
}

impl<I: Sequence> Sequence for TrySequence<I> {
    type Item = Result<I::Item>;

    fn next_item(&mut self) -> Result<Option<Self::Item>> {
        match self.input.next_item() {
            Ok(Some(item)) => Ok(Some(Ok(item))),
            Ok(None) => Ok(None),
            Err(err) => Ok(Some(Err(err))),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

/// Thread-safe pass-through counter
///
/// Clones share the same value, so a counter can be composed into a pipeline
/// and read (or reset) from outside afterwards. Intended for monitoring and
/// tests.
#[derive(Debug, Clone)]
pub struct Counter {
    /// Name shown by `Display`
    name: Arc<str>,

    /// Shared count
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Create a counter starting at zero
    pub fn new(name: &str) -> Self {
        Self::with_value(name, 0)
    }

    /// Create a counter starting at `value`
    pub fn with_value(name: &str, value: u64) -> Self {
        Self {
            name: Arc::from(name),
            value: Arc::new(AtomicU64::new(value)),
        }
    }

    /// Name of the counter
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current count
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Reset the count to `value`
    pub fn reset(&self, value: u64) {
        let previous = self.value.swap(value, Ordering::SeqCst);
        debug!(counter = %self.name, previous, value, "counter reset");
    }

    /// Add one to the count, for use outside a pipeline (e.g. inside a map function)
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    /// A stage counting only elements that match `predicate`, sharing this count
    pub fn when<P>(&self, predicate: P) -> CountWhen<P> {
        CountWhen {
            counter: self.clone(),
            predicate,
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value())
    }
}

impl<I: Sequence> Transform<I> for Counter {
    type Output = CountSequence<I, fn(&I::Item) -> bool>;

    fn apply(self, input: I) -> Self::Output {
        CountSequence {
            input,
            counter: self,
            predicate: |_| true,
        }
    }
}

/// Counting stage created by [`Counter::when`]
#[derive(Clone)]
pub struct CountWhen<P> {
    counter: Counter,
    predicate: P,
}

impl<I, P> Transform<I> for CountWhen<P>
where
    I: Sequence,
    P: FnMut(&I::Item) -> bool + Send,
{
    type Output = CountSequence<I, P>;

    fn apply(self, input: I) -> Self::Output {
        CountSequence {
            input,
            counter: self.counter,
            predicate: self.predicate,
        }
    }
}

/// Sequence produced by [`Counter`] and [`CountWhen`]
pub struct CountSequence<I, P> {
    input: I,
    counter: Counter,
    predicate: P,
}

impl<I, P> Sequence for CountSequence<I, P>
where
    I: Sequence,
    P: FnMut(&I::Item) -> bool + Send,
{
    type Item = I::Item;

    fn next_item(&mut self) -> Result<Option<I::Item>> {
        let item = self.input.next_item()?;
        if let Some(item) = item.as_ref() {
            if (self.predicate)(item) {
                self.counter.increment();
            }
        }
        Ok(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pipeline::Pipeline;
    use crate::sink::Collect;

    fn failing_at_three() -> Pipeline<impl Sequence<Item = i32>> {
        Pipeline::from_iter(1..=5).then(TryMap::new(|x: i32| {
            if x == 3 {
                Err(Error::msg("three is not allowed"))
            } else {
                Ok(x)
            }
        }))
    }

    #[test]
    fn test_map_and_filter() {
        let out = Pipeline::from_iter(1..=10)
            .then(Map::new(|x: i32| x * x))
            .then(Filter::new(|x: &i32| x % 2 == 1))
            .drain(Collect::new())
            .unwrap();
        assert_eq!(out, vec![1, 9, 25, 49, 81]);
    }

    #[test]
    fn test_try_map_failure_is_lazy() {
        let mut pipeline = failing_at_three();
        assert_eq!(pipeline.next_item().unwrap(), Some(1));
        assert_eq!(pipeline.next_item().unwrap(), Some(2));
        assert!(pipeline.next_item().is_err());
        assert_eq!(pipeline.next_item().unwrap(), Some(4));
    }

    #[test]
    fn test_try_wraps_failures() {
        let out = failing_at_three().then(Try).drain(Collect::new()).unwrap();
        assert_eq!(out.len(), 5);
        assert!(out[2].is_err());
        let ok: Vec<i32> = out.into_iter().filter_map(std::result::Result::ok).collect();
        assert_eq!(ok, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_take_stops_pulling() {
        let pulled = Counter::new("pulled");
        let out = Pipeline::from_iter(0..100)
            .then(pulled.clone())
            .then(Take::new(3))
            .drain(Collect::new())
            .unwrap();
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(pulled.value(), 3);
    }

    #[test]
    fn test_take_counts_failed_slot() {
        let out = failing_at_three().then(Take::new(3)).then(Try).drain(Collect::new()).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[2].is_err());
    }

    #[test]
    fn test_skip() {
        let out = Pipeline::from_iter(0..5).then(Skip::new(3)).drain(Collect::new()).unwrap();
        assert_eq!(out, vec![3, 4]);

        let out = Pipeline::from_iter(0..2).then(Skip::new(5)).drain(Collect::new()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_inspect() {
        let mut seen = Vec::new();
        let out = Pipeline::from_iter(vec![1, 2])
            .then(Inspect::new(|x: &i32| seen.push(*x)))
            .drain(Collect::new())
            .unwrap();
        assert_eq!(out, vec![1, 2]);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_counter_when_and_reset() {
        let small = Counter::with_value("smallerthan3", 1);
        Pipeline::from_iter(0..10)
            .then(small.when(|x: &i32| *x < 3))
            .drain(Collect::new())
            .unwrap();
        assert_eq!(small.value(), 4);
        assert_eq!(small.to_string(), "smallerthan3 = 4");

        small.reset(0);
        assert_eq!(small.value(), 0);
        assert_eq!(small.name(), "smallerthan3");
    }

    mod properties {
        use super::*;
        use proptest::prelude::{any, proptest};
        use proptest::{collection, prop_assert_eq};

        proptest! {
            #[test]
            fn prop_skip_filter_take_match_iterator(
                values in collection::vec(any::<i32>(), 0..64),
                skip in 0usize..10,
                take in 0usize..80,
            ) {
                let _ = tracing_subscriber::fmt().with_test_writer().try_init();
                let out = Pipeline::from_iter(values.clone())
                    .then(Skip::new(skip))
                    .then(Filter::new(|x: &i32| x % 3 != 0))
                    .then(Take::new(take))
                    .drain(Collect::new())
                    .unwrap();
                let expected: Vec<i32> = values.into_iter().skip(skip).filter(|x| x % 3 != 0).take(take).collect();
                prop_assert_eq!(out, expected);
            }
        }
    }
}
