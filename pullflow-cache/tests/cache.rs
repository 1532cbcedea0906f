use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use pullflow_cache::{CacheStore, Fingerprint};
use pullflow_core::prelude::*;
use pullflow_parallel::ParallelMap;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn replay_equals_first_run(input in prop::collection::vec(".{0,12}", 0..50)) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let fp = Fingerprint::from_parts::<String, _>("strings", 1, &input).unwrap();

        let first = Pipeline::from_iter(input.clone()).then(store.stage(fp)).drain(Collect::new()).unwrap();
        prop_assert!(store.contains(&fp));
        let second = Pipeline::from_iter(Vec::<String>::new()).then(store.stage(fp)).drain(Collect::new()).unwrap();
        prop_assert_eq!(&first, &input);
        prop_assert_eq!(second, first);
    }
}

#[test]
fn second_run_does_not_reinvoke_upstream() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    let calls = Counter::new("calls");

    let run = |calls: &Counter| {
        let calls = calls.clone();
        store
            .memoize("doubled", 1, (0..20).collect::<Vec<u32>>(), move |input| {
                input.then(Map::new(move |x: u32| {
                    calls.increment();
                    x * 2
                }))
            })
            .unwrap()
            .drain(Collect::new())
            .unwrap()
    };

    let first = run(&calls);
    assert_eq!(calls.value(), 20);
    let second = run(&calls);
    assert_eq!(calls.value(), 20);
    assert_eq!(first, second);
}

#[test]
fn failing_then_fixed_then_replayed() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    let input = vec![1i64, 2, 3, 4, 5];
    let fp = Fingerprint::from_parts::<i64, _>("squares", 1, &input).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let square = {
        let calls = Arc::clone(&calls);
        move |x: i64| {
            calls.fetch_add(1, Ordering::SeqCst);
            x * x
        }
    };
    let broken = |x: i64| if x == 3 { Err(Error::msg("cannot square 3")) } else { Ok(x * x) };

    // Run 1: element 3 fails, nothing is committed.
    let result = Pipeline::from_iter(input.clone())
        .then(TryMap::new(broken))
        .then(store.stage(fp))
        .drain(Collect::new());
    assert!(result.is_err());
    assert!(!store.contains(&fp));

    // Run 2: fixed function recomputes everything and commits.
    let second = Pipeline::from_iter(input.clone())
        .then(Map::new(square.clone()))
        .then(store.stage(fp))
        .drain(Collect::new())
        .unwrap();
    assert_eq!(second, vec![1, 4, 9, 16, 25]);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(store.contains(&fp));

    // Run 3: replayed, the function is not called.
    let third = Pipeline::from_iter(input)
        .then(Map::new(square))
        .then(store.stage(fp))
        .drain(Collect::new())
        .unwrap();
    assert_eq!(third, second);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn corrupt_entry_is_recomputed() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    let fp = Fingerprint::builder("corrupt").version(3).build::<u16>();

    Pipeline::from_iter(0u16..100).then(store.stage(fp)).drain(Consume::new()).unwrap();
    let path = store.entry_path(&fp);
    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x5a;
    fs::write(&path, bytes).unwrap();

    let pulled = Counter::new("pulled");
    let out = Pipeline::from_iter(0u16..100)
        .then(pulled.clone())
        .then(store.stage(fp))
        .drain(Collect::new())
        .unwrap();
    assert_eq!(out, (0..100).collect::<Vec<_>>());
    assert_eq!(pulled.value(), 100);

    // The recomputed entry replaces the corrupt one.
    pulled.reset(0);
    Pipeline::from_iter(0u16..100).then(pulled.clone()).then(store.stage(fp)).drain(Consume::new()).unwrap();
    assert_eq!(pulled.value(), 0);
}

#[test]
fn early_termination_leaves_no_entry() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    let fp = Fingerprint::builder("infinite").build::<u64>();

    let head = Pipeline::from_iter(0u64..)
        .then(ParallelMap::new(|x: u64| x + 1).workers(2))
        .then(store.stage(fp))
        .drain(Head::new(5))
        .unwrap();
    assert_eq!(head, vec![1, 2, 3, 4, 5]);
    assert!(!store.contains(&fp));
    assert_eq!(fs::read_dir(store.entries_dir()).unwrap().count(), 0);
}

#[test]
fn clear_forces_recomputation() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path().join("cache")).unwrap();
    let fp = Fingerprint::builder("cleared").build::<i32>();

    Pipeline::from_iter(vec![1, 2, 3]).then(store.stage(fp)).drain(Consume::new()).unwrap();
    assert_eq!(store.entries().unwrap(), vec![fp]);

    store.clear().unwrap();
    assert!(store.entries().unwrap().is_empty());

    let pulled = Counter::new("pulled");
    Pipeline::from_iter(vec![1, 2, 3]).then(pulled.clone()).then(store.stage(fp)).drain(Consume::new()).unwrap();
    assert_eq!(pulled.value(), 3);
    assert!(store.contains(&fp));
}

#[test]
fn cloned_store_handles_share_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    let other = store.clone();
    let fp = Fingerprint::builder("shared").build::<u8>();

    let writer = std::thread::spawn(move || {
        Pipeline::from_iter(vec![9u8, 8, 7]).then(other.stage(fp)).drain(Consume::new())
    });
    writer.join().unwrap().unwrap();

    let replay = Pipeline::from_iter(Vec::<u8>::new()).then(store.stage(fp)).drain(Collect::new()).unwrap();
    assert_eq!(replay, vec![9, 8, 7]);
}

#[test]
fn temporary_store_lives_for_its_scope() {
    init_tracing();
    let root = {
        let store = CacheStore::temporary().unwrap();
        let first = store
            .memoize("doubled", 1, vec![1u32, 2, 3], |input| input.then(Map::new(|x: u32| x * 2)))
            .unwrap()
            .drain(Collect::new())
            .unwrap();
        let calls = Counter::new("calls");
        let second = store
            .memoize("doubled", 1, vec![1u32, 2, 3], |input| {
                input.then(calls.clone()).then(Map::new(|x: u32| x * 2))
            })
            .unwrap()
            .drain(Collect::new())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.value(), 0);
        store.root().to_path_buf()
    };
    assert!(!root.exists());
}
