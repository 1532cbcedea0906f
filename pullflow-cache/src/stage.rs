//! The caching transform
//!
//! On the first pull the stage looks for a valid entry. On a hit the entry is
//! replayed lazily and the upstream is dropped without ever being pulled. On
//! a miss elements pass through unchanged while being staged, and the entry
//! is committed only when the upstream ends without any failed slot.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use pullflow_core::{Error, Result, Sequence, Transform};

use crate::fingerprint::Fingerprint;
use crate::store::{CacheStore, Replay, Staging};

/// Cache the stream passing through under one fingerprint
pub struct CacheStage<T> {
    store: CacheStore,
    fingerprint: Fingerprint,
    _element: PhantomData<fn() -> T>,
}

impl<T> CacheStage<T> {
    /// Stage writing to and replaying from `store`
    pub fn new(store: CacheStore, fingerprint: Fingerprint) -> Self {
        Self {
            store,
            fingerprint,
            _element: PhantomData,
        }
    }

    /// Identity of the cached stream
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl<I, T> Transform<I> for CacheStage<T>
where
    I: Sequence<Item = T>,
    T: Serialize + DeserializeOwned + Send,
{
    type Output = CacheSequence<I, T>;

    fn apply(self, input: I) -> Self::Output {
        CacheSequence {
            mode: Mode::Pending {
                store: self.store,
                fingerprint: self.fingerprint,
                upstream: input,
            },
            _element: PhantomData,
        }
    }
}

enum Mode<S> {
    /// Not pulled yet; hit or miss undecided
    Pending {
        store: CacheStore,
        fingerprint: Fingerprint,
        upstream: S,
    },

    /// Hit
    Replay(Replay),

    /// Miss; `staging` is `None` once poisoned
    Record { upstream: S, staging: Option<Staging> },

    /// Exhausted
    Done,
}

/// Sequence produced by [`CacheStage`] and [`CacheStore::memoize`]
pub struct CacheSequence<S, T> {
    mode: Mode<S>,
    _element: PhantomData<fn() -> T>,
}

impl<S, T> CacheSequence<S, T>
where
    S: Sequence<Item = T>,
    T: Serialize + DeserializeOwned + Send,
{
    pub(crate) fn replaying(replay: Replay) -> Self {
        Self {
            mode: Mode::Replay(replay),
            _element: PhantomData,
        }
    }

    pub(crate) fn recording(store: CacheStore, fingerprint: Fingerprint, upstream: S) -> Self {
        Self {
            mode: record(&store, &fingerprint, upstream),
            _element: PhantomData,
        }
    }

    /// Whether elements come from a cache entry; `false` before the first pull
    pub fn is_replaying(&self) -> bool {
        matches!(self.mode, Mode::Replay(_))
    }

    /// Whether a miss is still being staged for commit
    pub fn is_recording(&self) -> bool {
        matches!(self.mode, Mode::Record { staging: Some(_), .. })
    }

    fn resolve(&mut self) {
        if let Mode::Pending { .. } = self.mode {
            let Mode::Pending {
                store,
                fingerprint,
                upstream,
            } = std::mem::replace(&mut self.mode, Mode::Done)
            else {
                return;
            };
            self.mode = match store.lookup(&fingerprint) {
                Some(replay) => Mode::Replay(replay),
                None => record(&store, &fingerprint, upstream),
            };
        }
    }

    fn next_replayed(&mut self) -> Result<Option<T>> {
        let Mode::Replay(replay) = &mut self.mode else {
            return Ok(None);
        };
        match replay.reader.next_frame() {
            Ok(Some(frame)) => {
                replay.remaining = replay.remaining.saturating_sub(1);
                bincode::deserialize(&frame)
                    .map(Some)
                    .map_err(|err| Error::CacheCorrupt(format!("undecodable cached element: {err}")))
            }
            Ok(None) => {
                self.mode = Mode::Done;
                Ok(None)
            }
            Err(err) => {
                // The frame boundaries are lost; nothing after this can be trusted.
                warn!(error = %err, "cache entry changed during replay");
                self.mode = Mode::Done;
                Err(err)
            }
        }
    }

    fn next_recorded(&mut self) -> Result<Option<T>> {
        let Mode::Record { upstream, staging } = &mut self.mode else {
            return Ok(None);
        };
        match upstream.next_item() {
            Ok(Some(item)) => {
                if let Some(entry) = staging {
                    if let Err(err) = entry.write(&item) {
                        warn!(error = %err, "cache staging failed, entry will not be committed");
                        *staging = None;
                    }
                }
                Ok(Some(item))
            }
            Ok(None) => {
                let staged = staging.take();
                self.mode = Mode::Done;
                if let Some(entry) = staged {
                    if let Err(err) = entry.commit() {
                        warn!(error = %err, "cache commit failed");
                    }
                }
                Ok(None)
            }
            Err(err) => {
                if staging.take().is_some() {
                    debug!("upstream failure, discarding staged cache entry");
                }
                Err(err)
            }
        }
    }
}

fn record<S>(store: &CacheStore, fingerprint: &Fingerprint, upstream: S) -> Mode<S> {
    let staging = match store.begin(fingerprint) {
        Ok(staging) => Some(staging),
        Err(err) => {
            warn!(error = %err, "cannot stage cache entry, passing through");
            None
        }
    };
    Mode::Record { upstream, staging }
}

impl<S, T> Sequence for CacheSequence<S, T>
where
    S: Sequence<Item = T>,
    T: Serialize + DeserializeOwned + Send,
{
    type Item = T;

    fn next_item(&mut self) -> Result<Option<T>> {
        self.resolve();
        match self.mode {
            Mode::Replay(_) => self.next_replayed(),
            Mode::Record { .. } => self.next_recorded(),
            Mode::Pending { .. } | Mode::Done => Ok(None),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.mode {
            Mode::Pending { upstream, .. } | Mode::Record { upstream, .. } => upstream.size_hint(),
            Mode::Replay(replay) => {
                let remaining = usize::try_from(replay.remaining).unwrap_or(usize::MAX);
                (remaining, Some(remaining))
            }
            Mode::Done => (0, Some(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullflow_core::prelude::*;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_miss_then_hit() {
        let (_dir, store) = store();
        let fp = Fingerprint::builder("words").build::<String>();
        let words = vec!["a".to_string(), "bb".to_string()];

        let first = Pipeline::from_iter(words.clone()).then(store.stage(fp)).drain(Collect::new()).unwrap();
        assert_eq!(first, words);
        assert!(store.contains(&fp));

        let pulled = Counter::new("pulled");
        let mut seq = pulled.clone().apply(pullflow_core::IterSequence::new(vec!["zzz".to_string()]));
        let mut replay = store.stage::<String>(fp).apply(&mut seq);
        assert!(!replay.is_replaying());
        assert_eq!(replay.size_hint(), (1, Some(1)));
        assert_eq!(replay.next_item().unwrap().as_deref(), Some("a"));
        assert!(replay.is_replaying());
        assert_eq!(replay.size_hint(), (1, Some(1)));
        assert_eq!(replay.next_item().unwrap().as_deref(), Some("bb"));
        assert_eq!(replay.next_item().unwrap(), None);
        assert_eq!(pulled.value(), 0);
    }

    #[test]
    fn test_failure_prevents_commit() {
        let (_dir, store) = store();
        let fp = Fingerprint::builder("failing").build::<i32>();
        let out: Vec<_> = Pipeline::from_results(vec![Ok(1), Err(Error::msg("boom")), Ok(3)])
            .then(store.stage(fp))
            .collect();
        assert_eq!(out.len(), 3);
        assert!(out[1].is_err());
        assert!(!store.contains(&fp));
    }

    #[test]
    fn test_early_termination_prevents_commit() {
        let (_dir, store) = store();
        let fp = Fingerprint::builder("partial").build::<i32>();
        let head = Pipeline::from_iter(0..10).then(store.stage(fp)).drain(Head::new(3)).unwrap();
        assert_eq!(head, vec![0, 1, 2]);
        assert!(!store.contains(&fp));
        assert_eq!(std::fs::read_dir(store.entries_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_undecodable_element_fails_its_slot() {
        let (_dir, store) = store();
        let fp = Fingerprint::builder("typed").build::<bool>();
        Pipeline::from_iter(vec![1u8, 7, 0])
            .then(CacheStage::<u8>::new(store.clone(), fp))
            .drain(Consume::new())
            .unwrap();
        // Same fingerprint read back as `bool`: 7 is not a valid encoding.
        let out: Vec<_> = Pipeline::from_iter(Vec::<bool>::new()).then(store.stage::<bool>(fp)).collect();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().ok(), Some(&true));
        assert!(matches!(out[1], Err(Error::CacheCorrupt(_))));
        assert_eq!(out[2].as_ref().ok(), Some(&false));
    }
}
