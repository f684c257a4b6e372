mod common;

use std::time::Duration;

use common::{float_column, int_column, kv_batch};
use datafusion::arrow::datatypes::DataType;
use ferry_core::exchange::{execute_unbound, LocalExchanger};
use ferry_core::expr::{col, lit, sum, SortKey};
use ferry_core::{
    BackendConfig,
    DataFusionBackend,
    ExchangerRef,
    ExecutionBackend,
    FerryError,
    Field,
    Plan,
    Schema,
};
use futures::StreamExt;

fn kv_schema() -> Schema {
    Schema::new([
        Field::new("k", DataType::Int64),
        Field::new("v", DataType::Float64),
    ])
}

#[tokio::test]
async fn exchange_runs_unbound_over_input() {
    let client = DataFusionBackend::new("client");
    let server = DataFusionBackend::new("server");

    let t = client
        .create_table("t", vec![kv_batch(&[1, 2, 1, 3], &[1.0, 2.0, 3.0, 4.0])])
        .unwrap();

    let unbound = Plan::unbound("input", kv_schema())
        .aggregate(["k"], [("total", sum(col("v").mul(lit(2.0))))])
        .unwrap();
    let exchanger = ExchangerRef::from(LocalExchanger::new(server.context()));

    let plan = t
        .exchange(&unbound, exchanger)
        .unwrap()
        .order_by([SortKey::asc("k")])
        .unwrap();

    let out = plan.execute().await.unwrap();
    assert_eq!(vec![1, 2, 3], int_column(&out, 0));
    assert_eq!(vec![8.0, 4.0, 8.0], float_column(&out, 1));

    // Inputs and outputs are only registered for the duration of the run.
    assert!(server.list_tables().is_empty());
    assert_eq!(vec!["t".to_string()], client.list_tables());
}

#[tokio::test]
async fn exchange_rejects_mismatched_schema() {
    let client = DataFusionBackend::new("client");
    let t = client
        .create_table("t", vec![kv_batch(&[1], &[1.0])])
        .unwrap();

    let unbound = Plan::unbound("input", Schema::new([Field::new("k", DataType::Int64)]));
    let exchanger = ExchangerRef::from(LocalExchanger::new(client.context()));

    let err = t.exchange(&unbound, exchanger).unwrap_err();
    assert!(matches!(err, FerryError::SchemaMismatch { .. }));
}

#[tokio::test]
async fn exchange_requires_single_placeholder() {
    let client = DataFusionBackend::new("client");
    let t = client
        .create_table("t", vec![kv_batch(&[1], &[1.0])])
        .unwrap();

    let a = Plan::unbound("a", kv_schema());
    let b = Plan::unbound("b", kv_schema());
    let exchanger = ExchangerRef::from(LocalExchanger::new(client.context()));

    t.exchange(&a.union(&b).unwrap(), exchanger).unwrap_err();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filtered_output_streams_while_input_is_open() {
    let server = DataFusionBackend::with_config("server", BackendConfig::streaming());
    let unbound = Plan::unbound("input", kv_schema())
        .filter(col("k").gt(lit(1)))
        .unwrap();

    let (tx, rx) = futures::channel::mpsc::unbounded();
    let mut output = execute_unbound(&server.context(), &unbound, &kv_schema(), rx.boxed())
        .await
        .unwrap();

    tx.unbounded_send(Ok(kv_batch(&[1, 2, 3], &[1.0, 2.0, 3.0])))
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), output.next())
        .await
        .expect("output held back while input is open")
        .unwrap()
        .unwrap();
    assert_eq!(vec![2, 3], int_column(&[first], 0));

    drop(tx);
    let rest: Vec<_> = output.map(|b| b.unwrap()).collect().await;
    assert_eq!(0, rest.iter().map(|b| b.num_rows()).sum::<usize>());
}
