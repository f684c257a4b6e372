mod common;

use common::{float_column, int_column, kv_batch, total_rows};
use datafusion::arrow::datatypes::DataType;
use ferry_core::expr::{col, lit, sum, SortKey};
use ferry_core::{
    DataFusionBackend,
    ExchangerRef,
    ExecutionBackend,
    Exchanger,
    FerryError,
    Field,
    Plan,
    Schema,
};
use ferry_flight::{
    flight_operator,
    flight_udxf,
    BasicAuth,
    FlightExchangeClient,
    FlightExchangeError,
    FlightExchangeServer,
    FlightExchanger,
    FlightUrl,
    ServerConfig,
};
use futures::StreamExt;

fn kv_schema() -> Schema {
    Schema::new([
        Field::new("k", DataType::Int64),
        Field::new("v", DataType::Float64),
    ])
}

async fn start_server(auth: Option<BasicAuth>) -> FlightExchangeServer {
    let backend = DataFusionBackend::new("server");
    let config = ServerConfig {
        auth,
        ..ServerConfig::new(FlightUrl::ephemeral())
    };
    FlightExchangeServer::start(config, backend.context())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identity_round_trip() {
    logutil::init_test();

    let client = DataFusionBackend::new("client");
    let server = DataFusionBackend::new("server");
    let t = client
        .create_table(
            "t",
            vec![
                kv_batch(&[1, 2], &[1.0, 2.0]),
                kv_batch(&[3], &[3.0]),
            ],
        )
        .unwrap();

    let exchanger = FlightExchanger::spawning(server.context());
    let unbound = Plan::unbound("input", kv_schema());
    let plan = t
        .exchange(&unbound, ExchangerRef::from(exchanger.clone()))
        .unwrap();

    let out = plan.execute().await.unwrap();
    assert_eq!(
        vec![2, 1],
        out.iter().map(|b| b.num_rows()).collect::<Vec<_>>()
    );
    for batch in &out {
        assert_eq!(kv_schema(), Schema::from_arrow(&batch.schema()));
    }
    assert_eq!(vec![1, 2, 3], int_column(&out, 0));
    assert_eq!(vec![1.0, 2.0, 3.0], float_column(&out, 1));

    let stats = exchanger.last_stats().unwrap();
    assert_eq!(2, stats.batches_written());
    assert_eq!(2, stats.batches_read());
    assert!(server.list_tables().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aggregate_through_running_server() {
    let server = start_server(None).await;
    let client = DataFusionBackend::new("client");
    let t = client
        .create_table("t", vec![kv_batch(&[1, 2, 1, 3], &[1.0, 2.0, 3.0, 4.0])])
        .unwrap();

    let unbound = Plan::unbound("input", kv_schema())
        .aggregate(["k"], [("total", sum(col("v")))])
        .unwrap();
    let exchanger = FlightExchanger::connecting(server.config().clone());
    let plan = flight_operator(&t, &unbound, ExchangerRef::from(exchanger), None, None)
        .unwrap()
        .order_by([SortKey::asc("k")])
        .unwrap();

    let out = plan.execute().await.unwrap();
    assert_eq!(vec![1, 2, 3], int_column(&out, 0));
    assert_eq!(vec![4.0, 2.0, 4.0], float_column(&out, 1));
    assert!(client
        .list_tables()
        .iter()
        .all(|name| !name.starts_with("ferry_")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udxf_appends_column() {
    let client = DataFusionBackend::new("client");
    let server = DataFusionBackend::new("server");
    let t = client
        .create_table("t", vec![kv_batch(&[1, 2], &[1.5, 2.5])])
        .unwrap();

    let exchanger = ExchangerRef::from(FlightExchanger::spawning(server.context()));
    let plan = flight_udxf(&t, "doubled", col("v").mul(lit(2.0)), exchanger, None, None)
        .unwrap()
        .order_by([SortKey::asc("k")])
        .unwrap();

    assert_eq!(vec!["k", "v", "doubled"], plan.schema().names().collect::<Vec<_>>());
    let out = plan.execute().await.unwrap();
    assert_eq!(vec![3.0, 5.0], float_column(&out, 2));
}

#[tokio::test]
async fn schema_mismatch_fails_before_connecting() {
    // Nothing listens here. Getting a schema error means no connection was
    // attempted.
    let exchanger = FlightExchanger::connecting(ServerConfig::new(FlightUrl::new("127.0.0.1", 1)));
    let unbound = Plan::unbound("input", kv_schema());
    let wrong = Schema::new([Field::new("k", DataType::Int64)]);

    let err = exchanger
        .exchange(&unbound, &wrong, futures::stream::empty().boxed())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FerryError::SchemaMismatch { .. }));
    assert!(exchanger.last_stats().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_rejects_mismatched_input_schema() {
    let server = start_server(None).await;
    let mut client = FlightExchangeClient::connect(server.config().clone())
        .await
        .unwrap();

    let unbound = Plan::unbound("input", kv_schema());
    client.add_exchange("cmd", &unbound).await.unwrap();

    let wrong = Schema::new([Field::new("k", DataType::Int64)]);
    let err = client
        .exchange("cmd", &wrong, kv_schema(), futures::stream::empty().boxed())
        .await
        .err()
        .unwrap();
    match err {
        FlightExchangeError::Status(status) => {
            assert_eq!(tonic::Code::InvalidArgument, status.code())
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_are_single_use() {
    let server = start_server(None).await;
    let mut client = FlightExchangeClient::connect(server.config().clone())
        .await
        .unwrap();

    let unbound = Plan::unbound("input", kv_schema());
    let output = client.add_exchange("cmd", &unbound).await.unwrap();
    assert_eq!(&kv_schema(), &output);
    assert_eq!(vec!["cmd".to_string()], client.list_exchanges().await.unwrap());

    let input = futures::stream::iter(vec![Ok(kv_batch(&[1], &[1.0]))]).boxed();
    let (stream, stats) = client
        .exchange("cmd", &kv_schema(), kv_schema(), input)
        .await
        .unwrap();
    let batches: Vec<_> = stream.map(|b| b.unwrap()).collect().await;
    assert_eq!(1, total_rows(&batches));
    assert_eq!(1, stats.batches_written());
    assert!(client.list_exchanges().await.unwrap().is_empty());

    let err = client
        .exchange(
            "cmd",
            &kv_schema(),
            kv_schema(),
            futures::stream::empty().boxed(),
        )
        .await
        .err()
        .unwrap();
    match err {
        FlightExchangeError::Status(status) => assert_eq!(tonic::Code::NotFound, status.code()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn basic_auth_is_enforced() {
    let auth = BasicAuth::new("ferry", "secret");
    let server = start_server(Some(auth.clone())).await;

    let mut anonymous = FlightExchangeClient::connect(ServerConfig::new(server.url().clone()))
        .await
        .unwrap();
    let err = anonymous.list_exchanges().await.unwrap_err();
    match err {
        FlightExchangeError::Status(status) => {
            assert_eq!(tonic::Code::Unauthenticated, status.code())
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut authed = FlightExchangeClient::connect(server.config().clone())
        .await
        .unwrap();
    assert!(authed.list_exchanges().await.unwrap().is_empty());
}

#[tokio::test]
async fn start_fails_on_port_in_use() {
    let first = start_server(None).await;
    let backend = DataFusionBackend::new("other");

    let err = FlightExchangeServer::start(ServerConfig::new(first.url().clone()), backend.context())
        .await
        .unwrap_err();
    assert!(matches!(err, FlightExchangeError::PortInUse(_)));
}
