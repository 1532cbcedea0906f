//! Persistent caching for pullflow pipelines
//!
//! A [`CacheStore`] owns a root directory of write-once entries, each
//! identified by a [`Fingerprint`] over a caller-chosen key, a version, the
//! element type and the input. The [`CacheStage`] transform replays a valid
//! entry without touching its upstream, or passes the upstream through and
//! commits it once the stream ends cleanly.
//!
//! ```
//! use pullflow_cache::CacheStore;
//! use pullflow_core::prelude::*;
//!
//! let dir = tempfile::tempdir()?;
//! let store = CacheStore::open(dir.path())?;
//!
//! let first = store
//!     .memoize("squares", 1, vec![1u64, 2, 3], |input| input.then(Map::new(|x: u64| x * x)))?
//!     .drain(Collect::new())?;
//! assert_eq!(first, vec![1, 4, 9]);
//!
//! // Replayed from disk; the build closure is not called.
//! let again = store
//!     .memoize("squares", 1, vec![1u64, 2, 3], |_| -> Pipeline<pullflow_core::IterSequence<std::vec::IntoIter<u64>>> {
//!         unreachable!()
//!     })?
//!     .drain(Collect::new())?;
//! assert_eq!(first, again);
//! # Ok::<(), pullflow_core::Error>(())
//! ```

#![warn(missing_docs)]

pub mod fingerprint;
pub mod format;
pub mod stage;
pub mod store;

pub use fingerprint::{Fingerprint, FingerprintBuilder, FINGERPRINT_LEN};
pub use stage::{CacheSequence, CacheStage};
pub use store::{CacheStore, ENTRIES_DIR, ENTRY_EXTENSION};
