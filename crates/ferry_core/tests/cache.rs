mod common;

use std::sync::Arc;

use common::{float_column, int_column, kv_batch};
use ferry_core::cache::MemoryBacking;
use ferry_core::config::{CacheConfig, ExecutionConfig};
use ferry_core::expr::{col, lit, sum, SortKey};
use ferry_core::{CacheStorage, DataFusionBackend, ExecutionBackend, FerryError, KeyStrategy, Plan};

fn summarize(t: &Plan) -> Plan {
    t.filter(col("v").gt(lit(0.0)))
        .unwrap()
        .aggregate(["k"], [("total", sum(col("v")))])
        .unwrap()
        .order_by([SortKey::asc("k")])
        .unwrap()
}

#[tokio::test]
async fn modification_strategy_invalidates_on_source_change() {
    logutil::init_test();

    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1, 1, 2], &[1.0, 2.0, 5.0])])
        .unwrap();
    let storage = CacheStorage::source(&backend.context());

    let expr = summarize(&t);
    let cached = expr.cache(&storage).unwrap();
    assert!(!storage.exists(&expr).await.unwrap());

    // Miss: computed once.
    let first = cached.execute().await.unwrap();
    assert_eq!(1, backend.scan_count("t"));
    assert!(storage.exists(&expr).await.unwrap());
    assert_eq!(vec![1, 2], int_column(&first, 0));
    assert_eq!(vec![3.0, 5.0], float_column(&first, 1));

    // Hit: the source isn't touched.
    let second = cached.execute().await.unwrap();
    assert_eq!(1, backend.scan_count("t"));
    assert_eq!(float_column(&first, 1), float_column(&second, 1));

    // Mutating the source changes the key.
    backend
        .append_batches("t", vec![kv_batch(&[2], &[10.0])])
        .await
        .unwrap();
    assert!(!storage.exists(&expr).await.unwrap());

    let third = cached.execute().await.unwrap();
    assert_eq!(2, backend.scan_count("t"));
    assert_eq!(vec![3.0, 15.0], float_column(&third, 1));
}

#[tokio::test]
async fn snapshot_strategy_ignores_source_change() {
    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1, 2], &[1.0, 2.0])])
        .unwrap();
    let storage = CacheStorage::snapshot(&backend.context());

    let expr = summarize(&t);
    let cached = expr.cache(&storage).unwrap();
    let first = cached.execute().await.unwrap();

    backend
        .append_batches("t", vec![kv_batch(&[1], &[100.0])])
        .await
        .unwrap();
    assert!(storage.exists(&expr).await.unwrap());

    let second = cached.execute().await.unwrap();
    assert_eq!(1, backend.scan_count("t"));
    assert_eq!(float_column(&first, 1), float_column(&second, 1));
}

#[tokio::test]
async fn parquet_backing_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1, 2, 2], &[1.0, 2.0, 3.0])])
        .unwrap();
    let storage = CacheStorage::parquet(&backend.context(), dir.path());

    let expr = summarize(&t);
    let cached = expr.cache(&storage).unwrap();

    let first = cached.execute().await.unwrap();
    let key = storage.key_of(&expr).unwrap();
    assert!(dir.path().join(format!("{key}.parquet")).exists());

    let second = cached.execute().await.unwrap();
    assert_eq!(1, backend.scan_count("t"));
    assert_eq!(vec![1.0, 5.0], float_column(&first, 1));
    assert_eq!(float_column(&first, 1), float_column(&second, 1));

    assert!(storage.remove(&expr).await.unwrap());
    assert!(!storage.exists(&expr).await.unwrap());
    assert!(!storage.remove(&expr).await.unwrap());
}

#[tokio::test]
async fn memory_backing_round_trip() {
    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1, 2], &[1.0, 2.0])])
        .unwrap();
    let backing = Arc::new(MemoryBacking::new());
    let storage = CacheStorage::new(backend.context(), backing.clone(), KeyStrategy::Modification);

    let cached = summarize(&t).cache(&storage).unwrap();
    cached.execute().await.unwrap();
    cached.execute().await.unwrap();

    assert_eq!(1, backing.len());
    assert_eq!(1, backend.scan_count("t"));
}

#[tokio::test]
async fn set_default_is_idempotent() {
    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1, 2], &[1.0, 2.0])])
        .unwrap();
    let storage = CacheStorage::source(&backend.context());
    let config = ExecutionConfig::default();
    let expr = summarize(&t);

    let err = storage.get(&expr).await.unwrap_err();
    assert!(matches!(err, FerryError::NotFound(_)));

    let set = storage.set_default(&expr, &config).await.unwrap();
    let got = storage.get(&expr).await.unwrap();
    assert_eq!(set, got);

    let again = storage.set_default(&expr, &config).await.unwrap();
    assert_eq!(set, again);
    assert_eq!(1, backend.scan_count("t"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_set_default_computes_once() {
    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1, 2], &[1.0, 2.0])])
        .unwrap();
    let storage = CacheStorage::source(&backend.context());
    let expr = summarize(&t);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let storage = storage.clone();
            let expr = expr.clone();
            tokio::spawn(async move {
                storage
                    .set_default(&expr, &ExecutionConfig::default())
                    .await
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(1, backend.scan_count("t"));
}

#[tokio::test]
async fn keys_use_configured_prefix() {
    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1], &[1.0])])
        .unwrap();
    let expr = summarize(&t);

    let default = CacheStorage::source(&backend.context());
    assert!(default.key_of(&expr).unwrap().as_str().starts_with("ferry_cache-"));

    let custom = CacheStorage::with_config(
        backend.context(),
        Arc::new(MemoryBacking::new()),
        KeyStrategy::Snapshot,
        CacheConfig {
            key_prefix: "letters".to_string(),
        },
    );
    assert!(custom.key_of(&expr).unwrap().as_str().starts_with("letters-"));

    // The key depends on the computation, not the storage.
    let other = CacheStorage::source(&backend.context());
    assert_eq!(default.key_of(&expr).unwrap(), other.key_of(&expr).unwrap());
    assert_ne!(
        default.key_of(&expr).unwrap(),
        default.key_of(&expr.limit(1).unwrap()).unwrap()
    );
}

#[tokio::test]
async fn nested_caches_reuse_inner_entries() {
    let backend = DataFusionBackend::new("source");
    let t = backend
        .create_table("t", vec![kv_batch(&[1, 2, 3], &[1.0, 2.0, 3.0])])
        .unwrap();
    let storage = CacheStorage::source(&backend.context());

    let inner = t.filter(col("k").gt(lit(1))).unwrap().cache(&storage).unwrap();
    let outer = inner.limit(1).unwrap().cache(&storage).unwrap();

    outer.execute().await.unwrap();
    assert_eq!(1, backend.scan_count("t"));

    // A different expression over the same inner cache hits it.
    let sibling = inner.limit(2).unwrap();
    let out = sibling.execute().await.unwrap();
    assert_eq!(2, common::total_rows(&out));
    assert_eq!(1, backend.scan_count("t"));

    let keys: Vec<_> = backend
        .list_tables()
        .into_iter()
        .filter(|t| t.starts_with("ferry_cache-"))
        .collect();
    assert_eq!(2, keys.len());
}
