use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::record_batch::RecordBatch;
use ferry_core::exchange::validate_unbound;
use ferry_core::expr::{col, ScalarExpr};
use ferry_core::{
    ContextRef,
    Exchanger,
    ExchangerRef,
    FerryError,
    Plan,
    Schema,
    SendableBatchStream,
};
use futures::{future, stream, StreamExt};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::client::{ExchangeStats, FlightExchangeClient};
use crate::config::{BasicAuth, FlightUrl, ServerConfig};
use crate::errors::Result;
use crate::server::FlightExchangeServer;
use crate::session::ExchangeSession;

/// Where a [`FlightExchanger`] runs its exchanges.
#[derive(Debug, Clone)]
pub enum ExchangeTarget {
    /// Start a server on an ephemeral loopback port for every exchange,
    /// serving `context`. The server goes away with the exchange.
    Spawn {
        context: ContextRef,
        auth: Option<BasicAuth>,
    },
    /// Use an already running server.
    Connect(ServerConfig),
}

/// Runs exchanges over Arrow Flight.
#[derive(Debug)]
pub struct FlightExchanger {
    target: ExchangeTarget,
    last_stats: Mutex<Option<ExchangeStats>>,
}

impl FlightExchanger {
    pub fn new(target: ExchangeTarget) -> Arc<Self> {
        Arc::new(FlightExchanger {
            target,
            last_stats: Mutex::new(None),
        })
    }

    pub fn spawning(context: ContextRef) -> Arc<Self> {
        Self::new(ExchangeTarget::Spawn {
            context,
            auth: None,
        })
    }

    pub fn connecting(config: ServerConfig) -> Arc<Self> {
        Self::new(ExchangeTarget::Connect(config))
    }

    /// Stats of the most recently started exchange.
    pub fn last_stats(&self) -> Option<ExchangeStats> {
        self.last_stats.lock().clone()
    }

    async fn open(&self) -> Result<ExchangeSession> {
        match &self.target {
            ExchangeTarget::Spawn { context, auth } => {
                let config = ServerConfig {
                    auth: auth.clone(),
                    ..ServerConfig::new(FlightUrl::ephemeral())
                };
                let server = FlightExchangeServer::start(config, context.clone()).await?;
                let client = FlightExchangeClient::connect(server.config().clone()).await?;
                ExchangeSession::new(client, Some(server))
            }
            ExchangeTarget::Connect(config) => {
                let client = FlightExchangeClient::connect(config.clone()).await?;
                ExchangeSession::new(client, None)
            }
        }
    }

    async fn run(
        &self,
        unbound: &Plan,
        input_schema: &Schema,
        input: SendableBatchStream,
    ) -> Result<SendableBatchStream> {
        let mut session = self.open().await?;
        let command = Uuid::new_v4().to_string();

        let output_schema = session.client().add_exchange(&command, unbound).await?;
        if &output_schema != unbound.schema() {
            return Err(FerryError::SchemaMismatch {
                expected: unbound.schema().clone(),
                got: output_schema,
            }
            .into());
        }

        session.begin_exchange()?;
        let (output, stats) = session
            .client()
            .exchange(&command, input_schema, output_schema, input)
            .await?;
        *self.last_stats.lock() = Some(stats);
        debug!(%command, "exchange started");

        // The session, and any server it owns, lives as long as the output.
        let close = stream::once(async move {
            session.close();
        })
        .filter_map(|()| future::ready(None::<ferry_core::Result<RecordBatch>>));
        Ok(output.chain(close).boxed())
    }
}

#[async_trait]
impl Exchanger for FlightExchanger {
    fn token(&self) -> String {
        match &self.target {
            ExchangeTarget::Spawn { context, .. } => {
                format!("flight:spawn:{}", context.profile_token())
            }
            ExchangeTarget::Connect(config) => format!("flight:{}", config.url),
        }
    }

    async fn exchange(
        &self,
        unbound: &Plan,
        input_schema: &Schema,
        input: SendableBatchStream,
    ) -> ferry_core::Result<SendableBatchStream> {
        // Nothing is sent when the input doesn't fit the computation.
        validate_unbound(unbound, input_schema)?;
        Ok(self.run(unbound, input_schema, input).await?)
    }
}

/// Run `unbound` over `input` through `exchanger`, making the output a table
/// in `context`. Defaults to the context `input` is bound to.
pub fn flight_operator(
    input: &Plan,
    unbound: &Plan,
    exchanger: ExchangerRef,
    context: Option<&ContextRef>,
    name: Option<&str>,
) -> ferry_core::Result<Plan> {
    let exchanged = input.exchange(unbound, exchanger)?;
    let context = match context {
        Some(context) => context.clone(),
        None => match exchanged.contexts().as_slice() {
            [context] => context.clone(),
            other => {
                return Err(FerryError::AmbiguousBackend(format!(
                    "exchange bound to {} contexts",
                    other.len()
                )))
            }
        },
    };
    exchanged.into_backend(&context, name)
}

/// Append `column`, computed by `function` over the input's columns, with
/// the computation running on the other side of `exchanger`.
pub fn flight_udxf(
    input: &Plan,
    column: &str,
    function: ScalarExpr,
    exchanger: ExchangerRef,
    context: Option<&ContextRef>,
    name: Option<&str>,
) -> ferry_core::Result<Plan> {
    let placeholder = Plan::unbound("ferry_udxf_input", input.schema().clone());
    let mut exprs: Vec<(String, ScalarExpr)> = input
        .schema()
        .names()
        .map(|n| (n.to_string(), col(n)))
        .collect();
    exprs.push((column.to_string(), function));
    let unbound = placeholder.project(exprs)?;

    flight_operator(input, &unbound, exchanger, context, name)
}
