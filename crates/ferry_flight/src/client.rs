use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::{Action, FlightDescriptor};
use ferry_core::stream::{instrument_stream, BatchCounter};
use ferry_core::{FerryError, Plan, Schema, SendableBatchStream};
use futures::{future, stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, error};

use crate::action::{AddExchangeAction, AddExchangeResponse, LIST_EXCHANGES};
use crate::config::ServerConfig;
use crate::errors::{FlightExchangeError, Result};

/// Batch counts for one exchange. Counts keep updating while the exchange
/// runs.
#[derive(Debug, Clone, Default)]
pub struct ExchangeStats {
    written: BatchCounter,
    read: BatchCounter,
}

impl ExchangeStats {
    /// Batches sent to the server.
    pub fn batches_written(&self) -> usize {
        self.written.get()
    }

    /// Batches received from the server.
    pub fn batches_read(&self) -> usize {
        self.read.get()
    }
}

/// Client for an exchange server.
#[derive(Debug, Clone)]
pub struct FlightExchangeClient {
    inner: FlightServiceClient<Channel>,
    config: ServerConfig,
}

impl FlightExchangeClient {
    pub async fn connect(config: ServerConfig) -> Result<Self> {
        let channel = Endpoint::new(config.url.endpoint())?
            .tcp_nodelay(true)
            .connect()
            .await?;
        debug!(url = %config.url, "connected to exchange server");
        Ok(FlightExchangeClient {
            inner: FlightServiceClient::new(channel),
            config,
        })
    }

    fn request<T>(&self, message: T) -> Result<Request<T>> {
        let mut request = Request::new(message);
        if let Some(auth) = &self.config.auth {
            request
                .metadata_mut()
                .insert("authorization", auth.header_value().parse()?);
        }
        Ok(request)
    }

    /// Register `unbound` under `command`. Returns the output schema the
    /// server fixed for it.
    pub async fn add_exchange(&mut self, command: &str, unbound: &Plan) -> Result<Schema> {
        let action = AddExchangeAction::new(command, unbound.clone()).into_action()?;
        let request = self.request(action)?;
        let mut results = self.inner.do_action(request).await?.into_inner();

        let result = results
            .message()
            .await?
            .ok_or_else(|| Status::internal("empty reply to add_exchange"))?;
        let response: AddExchangeResponse = serde_json::from_slice(&result.body)?;
        Ok(Schema::from_arrow(&response.schema))
    }

    /// Commands registered on the server and not yet exchanged.
    pub async fn list_exchanges(&mut self) -> Result<Vec<String>> {
        let request = self.request(Action::new(LIST_EXCHANGES, Vec::<u8>::new()))?;
        let mut results = self.inner.do_action(request).await?.into_inner();

        let mut commands = Vec::new();
        while let Some(result) = results.message().await? {
            commands.push(String::from_utf8_lossy(&result.body).to_string());
        }
        Ok(commands)
    }

    /// Stream `input` to the exchange registered as `command` and read its
    /// output.
    ///
    /// Input is sent from a separate task through a bounded channel while
    /// output is read. Output batches are checked against `output_schema`.
    pub async fn exchange(
        &mut self,
        command: &str,
        input_schema: &Schema,
        output_schema: Schema,
        input: SendableBatchStream,
    ) -> Result<(SendableBatchStream, ExchangeStats)> {
        let stats = ExchangeStats::default();

        let input = instrument_stream(input, "exchange client input", stats.written.clone());
        let mut encoded = FlightDataEncoderBuilder::new()
            .with_schema(input_schema.to_arrow())
            .with_flight_descriptor(Some(FlightDescriptor::new_cmd(command.to_string())))
            .build(input.map_err(|e| FlightError::ExternalError(Box::new(e))))
            .boxed();

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let producer = tokio::spawn(async move {
            while let Some(data) = encoded.next().await {
                match data {
                    Ok(data) => {
                        if tx.send(data).await.is_err() {
                            // Server stopped reading.
                            break;
                        }
                    }
                    Err(e) => {
                        error!(%e, "failed to send exchange input");
                        return Err(e);
                    }
                }
            }
            Ok(())
        });

        let request = self.request(ReceiverStream::new(rx))?;
        let response = self.inner.do_exchange(request).await?.into_inner();

        let output = FlightRecordBatchStream::new_from_flight_data(
            response.map_err(FlightError::from),
        )
        .map_err(|e| FerryError::from(FlightExchangeError::from(e)))
        .and_then(move |batch| {
            let got = Schema::from_arrow(&batch.schema());
            future::ready(if got == output_schema {
                Ok(batch)
            } else {
                Err(FerryError::SchemaMismatch {
                    expected: output_schema.clone(),
                    got,
                })
            })
        })
        .boxed();
        let output = instrument_stream(output, "exchange client output", stats.read.clone());

        // An input failure the server can't see surfaces once output ends.
        let producer_result = stream::once(async move {
            match producer.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(Err(FerryError::TransportError(format!(
                    "sending exchange input: {e}"
                )))),
                Err(e) => Some(Err(FerryError::Internal(format!(
                    "exchange input task: {e}"
                )))),
            }
        })
        .filter_map(future::ready);

        Ok((output.chain(producer_result).boxed(), stats))
    }
}
