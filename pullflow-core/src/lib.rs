//! Core sequence protocol, stage traits and pipeline composer
//!
//! This crate provides the foundational pieces every pullflow pipeline is
//! built from: the single-pass [`Sequence`] protocol, the three stage
//! capability traits ([`Source`], [`Transform`], [`Sink`]), the [`Pipeline`]
//! composer, and a small set of basic stages. The concurrency-bearing stages
//! live in `pullflow-parallel` and `pullflow-cache`.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod sequence;
pub mod sink;
pub mod source;
pub mod stage;
pub mod transform;

// Re-export key types for convenience
pub use config::StageConfig;
pub use error::{BoxError, Error, Result};
pub use pipeline::Pipeline;
pub use sequence::{FromFn, Fuse, IterSequence, ResultSequence, Sequence};
pub use stage::{Chain, Sink, Source, Transform};

/// Everything needed to build and run a pipeline
pub mod prelude {
    pub use crate::config::StageConfig;
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::Pipeline;
    pub use crate::sequence::Sequence;
    pub use crate::sink::{Collect, Consume, Count, ForEach, Head};
    pub use crate::source::{Empty, Iter, Range, Repeat};
    pub use crate::stage::{Chain, Sink, Source, Transform};
    pub use crate::transform::{Counter, Filter, Inspect, Map, Skip, Take, Try, TryMap};
}
