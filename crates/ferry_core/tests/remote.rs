mod common;

use common::{float_column, int_column, kv_batch, total_rows};
use ferry_core::cache::unwrap_caches;
use ferry_core::config::ExecutionConfig;
use ferry_core::expr::{col, lit, SortKey};
use ferry_core::materialize::materialize_remotes;
use ferry_core::{CacheStorage, DataFusionBackend, ExecutionBackend, LogicalOperator, Plan};

fn is_marker(plan: &Plan) -> bool {
    matches!(
        plan.op(),
        LogicalOperator::Cache(_) | LogicalOperator::Remote(_)
    )
}

#[tokio::test]
async fn one_pull_fans_out_to_every_site() {
    logutil::init_test();

    let source = DataFusionBackend::new("source");
    let left = DataFusionBackend::new("left");
    let right = DataFusionBackend::new("right");

    let t = source
        .create_table("t", vec![kv_batch(&[1, 2, 3], &[1.0, 2.0, 3.0])])
        .unwrap();
    let expr = t.filter(col("v").gt(lit(1.5))).unwrap();

    let in_left = expr.into_backend(&left.context(), Some("shared")).unwrap();
    let in_right = expr.into_backend(&right.context(), Some("shared")).unwrap();

    // Two sites in `left`, one in `right`.
    let root = in_left
        .union(&in_left.limit(10).unwrap())
        .unwrap()
        .union(&in_right)
        .unwrap();

    let materialized = materialize_remotes(&root, &ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(1, source.scan_count("t"));
    assert_eq!(3, materialized.tables.len());
    let in_left_count = materialized
        .tables
        .iter()
        .filter(|(_, ctx)| *ctx == left.context())
        .count();
    assert_eq!(2, in_left_count);
    assert!(materialized.plan.find(is_marker).is_empty());

    for (name, ctx) in &materialized.tables {
        let out = ctx.table(name).unwrap().execute().await.unwrap();
        assert_eq!(2, total_rows(&out), "table {name}");
    }
}

#[tokio::test]
async fn temporary_tables_are_dropped_after_execution() {
    let source = DataFusionBackend::new("source");
    let sink = DataFusionBackend::new("sink");

    let t = source
        .create_table("t", vec![kv_batch(&[1, 2, 3], &[1.0, 2.0, 3.0])])
        .unwrap();
    let remote = t.into_backend(&sink.context(), Some("moved")).unwrap();
    let plan = remote
        .union(&remote.filter(col("k").eq(lit(2))).unwrap())
        .unwrap()
        .order_by([SortKey::asc("k")])
        .unwrap();

    let out = plan.execute().await.unwrap();
    assert_eq!(vec![1, 2, 2, 3], int_column(&out, 0));
    assert_eq!(1, source.scan_count("t"));
    assert!(sink.list_tables().is_empty());
}

#[tokio::test]
async fn failed_pull_leaves_no_tables_behind() {
    let source = DataFusionBackend::new("source");
    let sink = DataFusionBackend::new("sink");

    let t = source
        .create_table("t", vec![kv_batch(&[1], &[1.0])])
        .unwrap();
    let good = t.into_backend(&sink.context(), Some("good")).unwrap();

    // Not bound to any context, so pulling it fails.
    let bad = Plan::unbound("nowhere", t.schema().clone())
        .into_backend(&sink.context(), Some("bad"))
        .unwrap();

    let root = good.union(&bad).unwrap();
    materialize_remotes(&root, &ExecutionConfig::default())
        .await
        .unwrap_err();
    assert!(sink.list_tables().is_empty());
}

#[tokio::test]
async fn nested_remotes_are_pulled_inner_first() {
    let a = DataFusionBackend::new("a");
    let b = DataFusionBackend::new("b");
    let c = DataFusionBackend::new("c");

    let t = a
        .create_table("t", vec![kv_batch(&[1, 2, 3, 4], &[1.0, 2.0, 3.0, 4.0])])
        .unwrap();
    let in_b = t
        .into_backend(&b.context(), None)
        .unwrap()
        .filter(col("k").gt(lit(1)))
        .unwrap();
    let in_c = in_b
        .into_backend(&c.context(), None)
        .unwrap()
        .order_by([SortKey::desc("k")])
        .unwrap();

    let out = in_c.execute().await.unwrap();
    assert_eq!(vec![4.0, 3.0, 2.0], float_column(&out, 1));
    assert!(b.list_tables().is_empty());
    assert!(c.list_tables().is_empty());
}

#[tokio::test]
async fn shared_cache_over_remote_materializes_once() {
    let source = DataFusionBackend::new("source");
    let sink = DataFusionBackend::new("sink");

    let t = source
        .create_table("t", vec![kv_batch(&[1, 2, 3], &[1.0, 2.0, 3.0])])
        .unwrap();
    let storage = CacheStorage::source(&sink.context());

    // The expression lives in `source`, so caching in `sink` moves it there.
    let cached = t.filter(col("k").lt(lit(3))).unwrap().cache(&storage).unwrap();
    let root = cached.union(&cached.limit(1).unwrap()).unwrap();

    let out = root.execute().await.unwrap();
    assert_eq!(3, total_rows(&out));
    assert_eq!(1, source.scan_count("t"));

    root.execute().await.unwrap();
    assert_eq!(1, source.scan_count("t"));
}

#[tokio::test]
async fn distinct_caches_over_one_remote_pull_once() {
    let source = DataFusionBackend::new("source");
    let sink = DataFusionBackend::new("sink");

    let t = source
        .create_table("t", vec![kv_batch(&[1, 2, 3], &[1.0, 2.0, 3.0])])
        .unwrap();
    let remote = t.into_backend(&sink.context(), Some("moved")).unwrap();

    let all = remote.cache(&CacheStorage::source(&sink.context())).unwrap();
    let some = remote
        .filter(col("k").gt(lit(1)))
        .unwrap()
        .cache(&CacheStorage::snapshot(&sink.context()))
        .unwrap();

    let out = all.union(&some).unwrap().execute().await.unwrap();
    assert_eq!(5, total_rows(&out));
    assert_eq!(1, source.scan_count("t"));

    // Pulls are only shared within a run.
    remote.execute().await.unwrap();
    remote.execute().await.unwrap();
    assert_eq!(3, source.scan_count("t"));
}

#[tokio::test]
async fn compile_time_unwrap_removes_markers() {
    let source = DataFusionBackend::new("source");
    let sink = DataFusionBackend::new("sink");
    let t = source
        .create_table("t", vec![kv_batch(&[1], &[1.0])])
        .unwrap();

    let source_cache = CacheStorage::source(&source.context());
    let sink_cache = CacheStorage::snapshot(&sink.context());

    // Cache of cache, cache of remote, and a remote of a cache.
    let plan = t
        .filter(col("v").gt(lit(0.0)))
        .unwrap()
        .cache(&source_cache)
        .unwrap()
        .cache(&source_cache)
        .unwrap()
        .cache(&sink_cache)
        .unwrap()
        .limit(3)
        .unwrap()
        .into_backend(&source.context(), None)
        .unwrap();
    assert!(!plan.find(is_marker).is_empty());

    let unwrapped = unwrap_caches(&plan).unwrap();
    assert!(unwrapped.find(is_marker).is_empty());
    assert_eq!(
        t.filter(col("v").gt(lit(0.0))).unwrap().limit(3).unwrap(),
        unwrapped
    );

    let sql = plan.compile().unwrap();
    assert!(sql.contains("Limit"), "{sql}");
    assert_eq!(0, source.scan_count("t"));
}
