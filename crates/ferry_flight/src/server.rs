use std::sync::Arc;

use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action,
    ActionType,
    Criteria,
    Empty,
    FlightData,
    FlightDescriptor,
    FlightInfo,
    HandshakeRequest,
    HandshakeResponse,
    PollInfo,
    PutResult,
    SchemaResult,
    Ticket,
};
use async_trait::async_trait;
use dashmap::DashMap;
use datafusion::arrow::datatypes::Schema as ArrowSchema;
use ferry_core::exchange::{execute_unbound, validate_unbound};
use ferry_core::logical::builder::single_placeholder;
use ferry_core::stream::{instrument_stream, BatchCounter};
use ferry_core::{ContextRef, FerryError, Plan, Schema};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Interceptor;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info};

use crate::action::{
    AddExchangeAction,
    AddExchangeResponse,
    ExchangeAction,
    ADD_EXCHANGE,
    LIST_EXCHANGES,
};
use crate::config::{BasicAuth, FlightUrl, ServerConfig};
use crate::errors::{FlightExchangeError, Result};

type FlightStream<T> = BoxStream<'static, Result<T, Status>>;

#[derive(Debug, Clone)]
struct RegisteredExchange {
    unbound: Plan,
    output_schema: Schema,
}

/// Flight service running registered unbound plans over streamed input.
///
/// Each registered command is good for a single exchange.
#[derive(Debug, Clone)]
pub struct ExchangeService {
    context: ContextRef,
    exchanges: Arc<DashMap<String, RegisteredExchange>>,
}

impl ExchangeService {
    pub fn new(context: ContextRef) -> Self {
        ExchangeService {
            context,
            exchanges: Arc::new(DashMap::new()),
        }
    }

    /// Commands registered and not yet exchanged.
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<_> = self.exchanges.iter().map(|e| e.key().clone()).collect();
        commands.sort();
        commands
    }

    fn add_exchange(&self, add: AddExchangeAction) -> Result<arrow_flight::Result> {
        single_placeholder(&add.plan)?;
        let output_schema = add.plan.schema().clone();

        debug!(command = %add.command, plan = %add.plan.display_tree(), "registering exchange");
        let response = AddExchangeResponse {
            command: add.command.clone(),
            schema: output_schema.to_arrow().as_ref().clone(),
        };
        self.exchanges.insert(
            add.command,
            RegisteredExchange {
                unbound: add.plan,
                output_schema,
            },
        );

        Ok(arrow_flight::Result {
            body: serde_json::to_vec(&response)?.into(),
        })
    }

    async fn exchange(&self, mut input: Streaming<FlightData>) -> Result<FlightStream<FlightData>> {
        let first = input
            .message()
            .await?
            .ok_or(FlightExchangeError::MissingSchema)?;
        let command = first
            .flight_descriptor
            .as_ref()
            .map(|d| String::from_utf8_lossy(&d.cmd).to_string())
            .ok_or(FlightExchangeError::MissingDescriptor)?;
        let (_, registered) = self
            .exchanges
            .remove(&command)
            .ok_or_else(|| FlightExchangeError::UnknownCommand(command.clone()))?;

        let input_schema = Schema::from_arrow(&ArrowSchema::try_from(&first)?);
        validate_unbound(&registered.unbound, &input_schema)?;
        info!(%command, "starting exchange");

        let flight_data = stream::once(async move { Ok(first) })
            .chain(input.map_err(FlightError::from))
            .boxed();
        let batches = FlightRecordBatchStream::new_from_flight_data(flight_data)
            .map_err(|e| FerryError::TransportError(e.to_string()))
            .boxed();
        let batches = instrument_stream(batches, "exchange server input", BatchCounter::new());

        let output = execute_unbound(&self.context, &registered.unbound, &input_schema, batches)
            .await?;
        let output = instrument_stream(output, "exchange server output", BatchCounter::new());

        let encoded = FlightDataEncoderBuilder::new()
            .with_schema(registered.output_schema.to_arrow())
            .build(output.map_err(|e| FlightError::ExternalError(Box::new(e))))
            .map_err(Status::from)
            .boxed();
        Ok(encoded)
    }
}

#[async_trait]
impl FlightService for ExchangeService {
    type HandshakeStream = FlightStream<HandshakeResponse>;
    type ListFlightsStream = FlightStream<FlightInfo>;
    type DoGetStream = FlightStream<FlightData>;
    type DoPutStream = FlightStream<PutResult>;
    type DoActionStream = FlightStream<arrow_flight::Result>;
    type ListActionsStream = FlightStream<ActionType>;
    type DoExchangeStream = FlightStream<FlightData>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("list_flights"))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("get_flight_info"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("get_schema"))
    }

    async fn do_get(
        &self,
        _request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        Err(Status::unimplemented("do_get"))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("do_put"))
    }

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let results = match ExchangeAction::try_from(request.get_ref())? {
            ExchangeAction::Add(add) => vec![self.add_exchange(add)?],
            ExchangeAction::List => self
                .commands()
                .into_iter()
                .map(|command| arrow_flight::Result {
                    body: command.into_bytes().into(),
                })
                .collect(),
        };
        Ok(Response::new(stream::iter(results.into_iter().map(Ok)).boxed()))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = vec![
            ActionType {
                r#type: ADD_EXCHANGE.to_string(),
                description: "Register an unbound plan under a command".to_string(),
            },
            ActionType {
                r#type: LIST_EXCHANGES.to_string(),
                description: "List registered commands".to_string(),
            },
        ];
        Ok(Response::new(stream::iter(actions.into_iter().map(Ok)).boxed()))
    }

    async fn do_exchange(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        match self.exchange(request.into_inner()).await {
            Ok(stream) => Ok(Response::new(stream)),
            Err(e) => {
                error!(%e, "exchange failed");
                Err(e.into())
            }
        }
    }
}

/// Rejects requests without the configured credentials. Lets everything
/// through when no credentials are configured.
#[derive(Debug, Clone)]
pub struct AuthInterceptor {
    auth: Option<BasicAuth>,
}

impl AuthInterceptor {
    pub fn new(auth: Option<BasicAuth>) -> Self {
        AuthInterceptor { auth }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(auth) = &self.auth {
            let header = request
                .metadata()
                .get("authorization")
                .map(|v| v.to_str())
                .transpose()
                .map_err(|_| Status::unauthenticated("authorization not parsable"))?;
            auth.validate(header)?;
        }
        Ok(request)
    }
}

/// An exchange service listening on a TCP port. Shuts down when dropped.
#[derive(Debug)]
pub struct FlightExchangeServer {
    config: ServerConfig,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlightExchangeServer {
    /// Bind and start serving in the background. Fails if the configured
    /// port is already taken.
    pub async fn start(config: ServerConfig, context: ContextRef) -> Result<Self> {
        if config.url.port_in_use() {
            return Err(FlightExchangeError::PortInUse(config.url.port()));
        }
        let listener = TcpListener::bind(config.url.socket_addr()?).await?;
        let url = FlightUrl::new(config.url.host(), listener.local_addr()?.port());

        let service = FlightServiceServer::with_interceptor(
            ExchangeService::new(context),
            AuthInterceptor::new(config.auth.clone()),
        );
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let signal = async move {
                let _ = rx.await;
            };
            if let Err(e) = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, signal)
                .await
            {
                error!(%e, "exchange server failed");
            }
        });

        info!(%url, auth = config.auth.is_some(), "exchange server listening");
        Ok(FlightExchangeServer {
            config: ServerConfig { url, ..config },
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    /// Url the server is bound to. The port is the real one even when an
    /// ephemeral port was requested.
    pub fn url(&self) -> &FlightUrl {
        &self.config.url
    }

    /// Config a client should use to reach this server.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            debug!(url = %self.config.url, "shutting down exchange server");
            let _ = tx.send(());
        }
    }

    /// Signal shutdown without waiting for in-flight calls.
    pub fn shutdown(mut self) {
        self.signal_shutdown();
    }

    /// Signal shutdown and wait for the server task to finish.
    pub async fn stop(mut self) -> Result<()> {
        self.signal_shutdown();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| FerryError::Internal(format!("exchange server task: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for FlightExchangeServer {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}
