//! Source stages: sequences manufactured from nothing

use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::sequence::{IterSequence, Sequence};
use crate::stage::Source;

/// Integer range `start..end` with a step, like Python's `range`
#[derive(Debug, Clone, Copy)]
pub struct Range {
    /// First value
    start: i64,

    /// Exclusive bound
    end: i64,

    /// Distance between consecutive values, never zero
    step: i64,
}

impl Range {
    /// Range from `start` up to (excluding) `end`
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            step: 1,
        }
    }

    /// Range from zero up to (excluding) `end`
    pub fn to(end: i64) -> Self {
        Self::new(0, end)
    }

    /// Set the step; negative steps count down
    pub fn step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }
}

impl Source for Range {
    type Output = RangeSequence;

    fn open(self) -> Result<Self::Output> {
        if self.step == 0 {
            return Err(Error::InvalidArgument("range step must not be zero".into()));
        }
        Ok(RangeSequence {
            next: self.start,
            end: self.end,
            step: self.step,
        })
    }
}

/// Sequence produced by [`Range`]
#[derive(Debug)]
pub struct RangeSequence {
    next: i64,
    end: i64,
    step: i64,
}

impl RangeSequence {
    fn remaining(&self) -> usize {
        // Spans can exceed i64::MAX, so count in i128.
        let span = if self.step > 0 {
            i128::from(self.end) - i128::from(self.next)
        } else {
            i128::from(self.next) - i128::from(self.end)
        };
        if span <= 0 {
            return 0;
        }
        let step = i128::from(self.step.unsigned_abs());
        usize::try_from((span + step - 1) / step).unwrap_or(usize::MAX)
    }
}

impl Sequence for RangeSequence {
    type Item = i64;

    fn next_item(&mut self) -> Result<Option<i64>> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let value = self.next;
        self.next = self.next.saturating_add(self.step);
        Ok(Some(value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

/// A source with no elements
#[derive(Debug)]
pub struct Empty<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Empty<T> {
    /// Create an empty source
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Empty<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Empty<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Source for Empty<T> {
    type Output = Empty<T>;

    fn open(self) -> Result<Self::Output> {
        Ok(self)
    }
}

impl<T> Sequence for Empty<T> {
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>> {
        Ok(None)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(0))
    }
}

/// A source over any collection or iterator
#[derive(Debug, Clone)]
pub struct Iter<T> {
    items: T,
}

impl<T> Iter<T>
where
    T: IntoIterator,
    T::IntoIter: Send,
{
    /// Wrap a collection or iterator
    pub fn new(items: T) -> Self {
        Self { items }
    }
}

impl<T> Source for Iter<T>
where
    T: IntoIterator,
    T::IntoIter: Send,
{
    type Output = IterSequence<T::IntoIter>;

    fn open(self) -> Result<Self::Output> {
        Ok(IterSequence::new(self.items))
    }
}

/// A source repeating one value, forever or a fixed number of times
#[derive(Debug, Clone)]
pub struct Repeat<T> {
    /// The value handed out on every pull
    value: T,

    /// How many times to repeat, `None` for forever
    times: Option<usize>,
}

impl<T: Clone + Send> Repeat<T> {
    /// Repeat forever
    pub fn new(value: T) -> Self {
        Self { value, times: None }
    }

    /// Repeat exactly `times` times
    pub fn times(value: T, times: usize) -> Self {
        Self {
            value,
            times: Some(times),
        }
    }
}

impl<T: Clone + Send> Source for Repeat<T> {
    type Output = Repeat<T>;

    fn open(self) -> Result<Self::Output> {
        Ok(self)
    }
}

impl<T: Clone + Send> Sequence for Repeat<T> {
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>> {
        match self.times.as_mut() {
            Some(0) => Ok(None),
            Some(n) => {
                *n -= 1;
                Ok(Some(self.value.clone()))
            }
            None => Ok(Some(self.value.clone())),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.times {
            Some(n) => (n, Some(n)),
            None => (usize::MAX, None),
        }
    }
}
