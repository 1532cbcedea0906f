//! Stage traits: the three capability variants of a pipeline unit

use crate::error::Result;
use crate::sequence::Sequence;

/// A stage that manufactures a sequence from nothing
pub trait Source {
    /// The sequence this source produces
    type Output: Sequence;

    /// Open the source. Must not pull any element.
    fn open(self) -> Result<Self::Output>;
}

/// A stage that lazily turns one sequence into another
///
/// `apply` only wraps its input; elements are pulled when the returned
/// sequence is pulled.
pub trait Transform<I: Sequence> {
    /// The sequence produced from the input
    type Output: Sequence;

    /// Wrap the input sequence
    fn apply(self, input: I) -> Self::Output;
}

/// A stage that drives a sequence to a final value or side effect
pub trait Sink<I: Sequence> {
    /// The final value
    type Output;

    /// Pull from the input until done, or until the sink decides to stop
    fn drain(self, input: I) -> Result<Self::Output>;
}

/// Two transforms composed into one, applied first `A` then `B`
#[derive(Debug, Clone)]
pub struct Chain<A, B> {
    /// The first transform in the chain
    first: A,

    /// The transform applied to the output of `first`
    second: B,
}

impl<A, B> Chain<A, B> {
    /// Create a new transform chain
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    /// Extend the chain with another transform
    pub fn then<C>(self, next: C) -> Chain<Self, C> {
        Chain::new(self, next)
    }
}

impl<I, A, B> Transform<I> for Chain<A, B>
where
    I: Sequence,
    A: Transform<I>,
    B: Transform<A::Output>,
{
    type Output = B::Output;

    fn apply(self, input: I) -> Self::Output {
        self.second.apply(self.first.apply(input))
    }
}
