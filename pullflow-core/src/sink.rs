//! Sink stages: drive a sequence to a final value or side effect
//!
//! A sink stops at the first failed slot and returns that failure. Elements
//! pulled before it have already been delivered.

use crate::error::Result;
use crate::sequence::Sequence;
use crate::stage::Sink;

/// Upper bound on capacity reserved up front from a size hint
const PREALLOCATE_LIMIT: usize = 1 << 16;

/// A sink that collects items in memory
#[derive(Debug, Clone, Copy, Default)]
pub struct Collect {
    /// Maximum number of items to collect
    max_items: Option<usize>,
}

impl Collect {
    /// Create a new collecting sink with no limit
    pub fn new() -> Self {
        Self { max_items: None }
    }

    /// Create a collecting sink that stops pulling after `max_items`
    pub fn with_limit(max_items: usize) -> Self {
        Self {
            max_items: Some(max_items),
        }
    }
}

impl<I: Sequence> Sink<I> for Collect {
    type Output = Vec<I::Item>;

    fn drain(self, mut input: I) -> Result<Self::Output> {
        let (lower, _) = input.size_hint();
        let capacity = self.max_items.map_or(lower, |max| max.min(lower)).min(PREALLOCATE_LIMIT);
        let mut items = Vec::with_capacity(capacity);
        while self.max_items.map_or(true, |max| items.len() < max) {
            match input.next_item()? {
                Some(item) => items.push(item),
                None => break,
            }
        }
        Ok(items)
    }
}

/// Collect the first `n` elements, then stop pulling
#[derive(Debug, Clone, Copy)]
pub struct Head {
    n: usize,
}

impl Head {
    /// Create a new head sink
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl<I: Sequence> Sink<I> for Head {
    type Output = Vec<I::Item>;

    fn drain(self, input: I) -> Result<Self::Output> {
        Collect::with_limit(self.n).drain(input)
    }
}

/// Pull and discard elements, for pipelines run only for their side effects
#[derive(Debug, Clone, Copy, Default)]
pub struct Consume {
    /// Stop after this many elements
    limit: Option<usize>,
}

impl Consume {
    /// Consume everything
    pub fn new() -> Self {
        Self { limit: None }
    }

    /// Consume at most `n` elements
    pub fn first(n: usize) -> Self {
        Self { limit: Some(n) }
    }
}

impl<I: Sequence> Sink<I> for Consume {
    type Output = ();

    fn drain(self, mut input: I) -> Result<()> {
        let mut consumed = 0;
        while self.limit.map_or(true, |limit| consumed < limit) {
            if input.next_item()?.is_none() {
                break;
            }
            consumed += 1;
        }
        Ok(())
    }
}

/// Count the elements of a sequence
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl Count {
    /// Create a new counting sink
    pub fn new() -> Self {
        Self
    }
}

impl<I: Sequence> Sink<I> for Count {
    type Output = usize;

    fn drain(self, mut input: I) -> Result<usize> {
        let mut count = 0;
        while input.next_item()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

/// Call a function on every element
pub struct ForEach<F> {
    func: F,
}

impl<F> ForEach<F> {
    /// Create a new side-effect sink
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<I, F> Sink<I> for ForEach<F>
where
    I: Sequence,
    F: FnMut(I::Item),
{
    type Output = ();

    fn drain(mut self, mut input: I) -> Result<()> {
        while let Some(item) = input.next_item()? {
            (self.func)(item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pipeline::Pipeline;
    use crate::transform::Counter;
    use test_case::test_case;

    #[test_case(None, 10 ; "unbounded")]
    #[test_case(Some(3), 3 ; "bounded")]
    #[test_case(Some(0), 0 ; "zero")]
    #[test_case(Some(50), 10 ; "limit above length")]
    fn test_collect_limit(limit: Option<usize>, expected: usize) {
        let sink = limit.map_or_else(Collect::new, Collect::with_limit);
        let out = Pipeline::from_iter(0..10).drain(sink).unwrap();
        assert_eq!(out.len(), expected);
    }

    #[test]
    fn test_head_stops_pulling() {
        let pulled = Counter::new("pulled");
        let out = Pipeline::from_iter(0..).then(pulled.clone()).drain(Head::new(4)).unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(pulled.value(), 4);
    }

    #[test]
    fn test_consume_first() {
        let pulled = Counter::new("pulled");
        Pipeline::from_iter(0..10).then(pulled.clone()).drain(Consume::first(5)).unwrap();
        assert_eq!(pulled.value(), 5);
    }

    #[test]
    fn test_for_each_keeps_side_effects_before_failure() {
        let mut seen = Vec::new();
        let result = Pipeline::from_results(vec![Ok(1), Ok(2), Err(Error::msg("boom")), Ok(4)])
            .drain(ForEach::new(|x: i32| seen.push(x)));
        assert!(result.is_err());
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_count() {
        assert_eq!(Pipeline::from_iter("hello".chars()).drain(Count::new()).unwrap(), 5);
    }
}
