//! Cache root directory management
//!
//! Every committed entry is one file `<root>/entries/<fingerprint hex>.pfc`.
//! Entries are written once through a staging file in the same directory and
//! never modified afterwards, so readers need no locking. Clearing swaps the
//! `entries` directory for an empty one; the root itself is never moved.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use pullflow_core::{Error, IterSequence, Pipeline, Result, Sequence, StageConfig};

use crate::fingerprint::Fingerprint;
use crate::format::{self, EntryReader, EntryWriter};
use crate::stage::{CacheSequence, CacheStage};

/// File extension of committed entries
pub const ENTRY_EXTENSION: &str = "pfc";

/// Subdirectory of the root holding committed entries
pub const ENTRIES_DIR: &str = "entries";

const STAGING_PREFIX: &str = ".pfc-staging-";
const TOMBSTONE_PREFIX: &str = ".cleared-";

/// Handle on a cache root; cloning is cheap
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Arc<Path>,
    entries: Arc<Path>,

    /// Owned root of a temporary store, removed when the last clone drops
    temporary: Option<Arc<TempDir>>,
}

impl CacheStore {
    /// Open the cache at `root`, creating the directory if needed
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let entries = root.join(ENTRIES_DIR);
        fs::create_dir_all(&entries)?;
        remove_tombstones(root);
        debug!(root = %root.display(), "cache store opened");
        Ok(Self {
            root: Arc::from(root),
            entries: Arc::from(entries.as_path()),
            temporary: None,
        })
    }

    /// Open a store in a fresh temporary directory
    ///
    /// The directory and every entry in it are deleted when the last clone
    /// of the returned store is dropped.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("pullflow-cache-").tempdir()?;
        let mut store = Self::open(dir.path())?;
        store.temporary = Some(Arc::new(dir));
        Ok(store)
    }

    /// Open the store named by `cache_path`, clearing it first if `cache_clear` is set
    pub fn from_config(config: &StageConfig) -> Result<Self> {
        let Some(path) = &config.cache_path else {
            return Err(Error::InvalidArgument("cache_path is not set".into()));
        };
        let store = Self::open(path)?;
        if config.cache_clear {
            store.clear()?;
        }
        Ok(store)
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding committed entries
    pub fn entries_dir(&self) -> &Path {
        &self.entries
    }

    /// Whether the store lives in a directory it deletes on drop
    pub fn is_temporary(&self) -> bool {
        self.temporary.is_some()
    }

    /// Path of the entry for `fingerprint`, whether or not it exists
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.entries.join(format!("{}.{ENTRY_EXTENSION}", fingerprint.to_hex()))
    }

    /// Whether a committed entry exists for `fingerprint`; its content is not checked
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entry_path(fingerprint).is_file()
    }

    /// Fingerprints of all committed entries, sorted
    pub fn entries(&self) -> Result<Vec<Fingerprint>> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.entries)? {
            let path = dirent?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(fingerprint) = path.file_stem().and_then(|stem| stem.to_str()?.parse().ok()) {
                entries.push(fingerprint);
            }
        }
        entries.sort_unstable();
        Ok(entries)
    }

    /// Delete the entry for `fingerprint`; returns whether one existed
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        match fs::remove_file(self.entry_path(fingerprint)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Empty the cache
    ///
    /// The entries directory is renamed to a tombstone inside the root and
    /// recreated before the tombstone is deleted, so it never shows a partly
    /// deleted state. Staging files of in-progress writers go with the
    /// tombstone and their commits are discarded.
    pub fn clear(&self) -> Result<()> {
        let tombstone = self.root.join(format!("{TOMBSTONE_PREFIX}{}", uuid::Uuid::new_v4()));
        match fs::rename(&self.entries, &tombstone) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.entries)?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.entries)?;
        match fs::remove_dir_all(&tombstone) {
            Ok(()) => {}
            // Another handle opening the root swept it first.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        info!(root = %self.root.display(), "cache cleared");
        Ok(())
    }

    /// Caching stage for the stream identified by `fingerprint`
    pub fn stage<T>(&self, fingerprint: Fingerprint) -> CacheStage<T> {
        CacheStage::new(self.clone(), fingerprint)
    }

    /// Replay the cached result of `build` over `inputs`, or compute and cache it
    ///
    /// `build` is only called on a miss. The fingerprint covers `key`,
    /// `version`, the element type and the serialized `inputs`.
    pub fn memoize<In, T, S, F>(
        &self,
        key: &str,
        version: u32,
        inputs: Vec<In>,
        build: F,
    ) -> Result<Pipeline<CacheSequence<Pipeline<S>, T>>>
    where
        In: Serialize + Send,
        S: Sequence<Item = T>,
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(Pipeline<IterSequence<std::vec::IntoIter<In>>>) -> Pipeline<S>,
    {
        let fingerprint = Fingerprint::builder(key).version(version).input(&inputs)?.build::<T>();
        if let Some(replay) = self.lookup(&fingerprint) {
            return Ok(Pipeline::new(CacheSequence::replaying(replay)));
        }
        let upstream = build(Pipeline::from_iter(inputs));
        Ok(Pipeline::new(CacheSequence::recording(self.clone(), fingerprint, upstream)))
    }

    /// Open a validated entry positioned at its first frame
    ///
    /// A missing entry is a miss. An entry that fails validation is removed
    /// and also reported as a miss.
    pub(crate) fn lookup(&self, fingerprint: &Fingerprint) -> Option<Replay> {
        let path = self.entry_path(fingerprint);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "cache entry unreadable, treating as miss");
                }
                return None;
            }
        };
        let mut input = BufReader::new(file);
        let count = match format::validate(&mut input, fingerprint) {
            Ok(count) => count,
            Err(err @ Error::CacheCorrupt(_)) => {
                warn!(path = %path.display(), error = %err, "removing invalid cache entry");
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "could not remove invalid cache entry");
                }
                return None;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache entry unreadable, treating as miss");
                return None;
            }
        };
        let reader = match input.seek(SeekFrom::Start(0)) {
            Ok(_) => EntryReader::open(input, fingerprint),
            Err(err) => Err(err.into()),
        };
        match reader {
            Ok(reader) => {
                debug!(fingerprint = %fingerprint, count, "cache hit");
                Some(Replay { reader, remaining: count })
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache entry unreadable, treating as miss");
                None
            }
        }
    }

    /// Start a staging file for `fingerprint`
    pub(crate) fn begin(&self, fingerprint: &Fingerprint) -> Result<Staging> {
        let file = tempfile::Builder::new().prefix(STAGING_PREFIX).tempfile_in(&self.entries)?;
        let writer = EntryWriter::new(BufWriter::new(file), fingerprint)?;
        debug!(fingerprint = %fingerprint, "cache miss, staging");
        Ok(Staging {
            writer,
            target: self.entry_path(fingerprint),
        })
    }
}

/// A validated entry being replayed
pub(crate) struct Replay {
    pub(crate) reader: EntryReader<BufReader<File>>,
    pub(crate) remaining: u64,
}

/// An entry being written; dropping it discards the staging file
pub(crate) struct Staging {
    writer: EntryWriter<BufWriter<NamedTempFile>>,
    target: PathBuf,
}

impl Staging {
    pub(crate) fn write<T: Serialize>(&mut self, item: &T) -> Result<()> {
        self.writer.write_item(item)
    }

    /// Seal the entry and move it into place unless another writer got there first
    pub(crate) fn commit(self) -> Result<()> {
        let count = self.writer.count();
        let file = self.writer.finish()?.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.as_file().sync_all()?;
        match file.persist_noclobber(&self.target) {
            Ok(_) => {
                sync_parent(&self.target);
                info!(path = %self.target.display(), count, "cache entry committed");
                Ok(())
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %self.target.display(), "cache entry already committed by another writer");
                Ok(())
            }
            Err(err) => Err(err.error.into()),
        }
    }
}

/// Delete tombstones left behind by a `clear` that was interrupted
fn remove_tombstones(root: &Path) {
    let Ok(dirents) = fs::read_dir(root) else {
        return;
    };
    for dirent in dirents.flatten() {
        if !dirent.file_name().to_string_lossy().starts_with(TOMBSTONE_PREFIX) {
            continue;
        }
        let path = dirent.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale cache tombstone"),
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove stale cache tombstone"),
        }
    }
}

/// Make the new directory entry durable
fn sync_parent(path: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Some(parent) = path.parent() {
        if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(error = %err, "could not sync cache directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(key: &str) -> Fingerprint {
        Fingerprint::builder(key).build::<u32>()
    }

    fn commit(store: &CacheStore, key: &str, items: &[u32]) {
        let mut staging = store.begin(&fingerprint(key)).unwrap();
        for item in items {
            staging.write(item).unwrap();
        }
        staging.commit().unwrap();
    }

    #[test]
    fn test_open_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("cache");
        let store = CacheStore::open(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn test_commit_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        commit(&store, "a", &[1, 2, 3]);
        assert!(store.contains(&fingerprint("a")));
        assert_eq!(store.lookup(&fingerprint("a")).unwrap().remaining, 3);
        assert!(store.lookup(&fingerprint("b")).is_none());
        assert_eq!(store.entries().unwrap(), vec![fingerprint("a")]);
    }

    #[test]
    fn test_dropped_staging_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let mut staging = store.begin(&fingerprint("a")).unwrap();
        staging.write(&7u32).unwrap();
        drop(staging);
        assert!(!store.contains(&fingerprint("a")));
        assert_eq!(fs::read_dir(store.entries_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_first_committer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let fp = fingerprint("race");
        let mut first = store.begin(&fp).unwrap();
        let mut second = store.begin(&fp).unwrap();
        first.write(&1u32).unwrap();
        second.write(&2u32).unwrap();
        second.write(&3u32).unwrap();
        second.commit().unwrap();
        first.commit().unwrap();
        assert_eq!(store.lookup(&fp).unwrap().remaining, 2);
        assert_eq!(fs::read_dir(store.entries_dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_entry_removed_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        commit(&store, "a", &[1, 2]);
        let path = store.entry_path(&fingerprint("a"));
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();
        assert!(store.lookup(&fingerprint("a")).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let store = CacheStore::open(&root).unwrap();
        commit(&store, "a", &[1]);
        commit(&store, "b", &[2]);
        assert!(store.remove(&fingerprint("a")).unwrap());
        assert!(!store.remove(&fingerprint("a")).unwrap());

        store.clear().unwrap();
        assert!(root.is_dir());
        assert!(store.entries().unwrap().is_empty());
        // The tombstone is gone; only the recreated entries directory is left.
        let names: Vec<_> = fs::read_dir(&root).unwrap().map(|d| d.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from(ENTRIES_DIR)]);
    }

    #[test]
    fn test_clear_keeps_root_in_place() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "not cache data").unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        commit(&store, "a", &[1]);
        store.clear().unwrap();
        assert!(store.entries().unwrap().is_empty());
        assert!(dir.path().join("notes.txt").is_file());
        commit(&store, "b", &[2]);
        assert_eq!(store.entries().unwrap(), vec![fingerprint("b")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_clear_through_symlinked_root() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let store = CacheStore::open(&link).unwrap();
        commit(&store, "a", &[1]);
        assert_eq!(fs::read_dir(real.join(ENTRIES_DIR)).unwrap().count(), 1);
        store.clear().unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_dir(real.join(ENTRIES_DIR)).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&real).unwrap().count(), 1);
    }

    #[test]
    fn test_open_sweeps_interrupted_clear() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(format!("{TOMBSTONE_PREFIX}left-over"));
        fs::create_dir_all(stale.join("inner")).unwrap();
        CacheStore::open(dir.path()).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_temporary_store_removed_with_last_clone() {
        let store = CacheStore::temporary().unwrap();
        assert!(store.is_temporary());
        let root = store.root().to_path_buf();
        commit(&store, "a", &[1, 2]);

        let clone = store.clone();
        drop(store);
        assert!(clone.contains(&fingerprint("a")));
        drop(clone);
        assert!(!root.exists());

        let dir = tempfile::tempdir().unwrap();
        assert!(!CacheStore::open(dir.path()).unwrap().is_temporary());
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        commit(&store, "a", &[1]);

        let config = StageConfig::default().with_cache_path(dir.path());
        assert_eq!(CacheStore::from_config(&config).unwrap().entries().unwrap().len(), 1);
        let config = config.with_cache_clear(true);
        assert!(CacheStore::from_config(&config).unwrap().entries().unwrap().is_empty());
        assert!(CacheStore::from_config(&StageConfig::default()).is_err());
    }
}
