use ferry_core::FerryError;

#[derive(Debug, thiserror::Error)]
pub enum FlightExchangeError {
    #[error("unknown exchange command: {0}")]
    UnknownCommand(String),

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("exchange stream is missing a command descriptor")]
    MissingDescriptor,

    #[error("exchange stream closed before the input schema was sent")]
    MissingSchema,

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    #[error(transparent)]
    Core(#[from] FerryError),

    #[error(transparent)]
    Status(#[from] tonic::Status),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Flight(#[from] arrow_flight::error::FlightError),

    #[error(transparent)]
    Arrow(#[from] datafusion::arrow::error::ArrowError),

    #[error(transparent)]
    InvalidMetadataValue(#[from] tonic::metadata::errors::InvalidMetadataValue),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = FlightExchangeError> = std::result::Result<T, E>;

impl From<FlightExchangeError> for tonic::Status {
    fn from(value: FlightExchangeError) -> Self {
        let message = value.to_string();
        match value {
            FlightExchangeError::Status(status) => status,
            FlightExchangeError::Core(e) => match e.root() {
                FerryError::SchemaMismatch { .. } | FerryError::SchemaError { .. } => {
                    tonic::Status::invalid_argument(message)
                }
                FerryError::NotFound(_) | FerryError::MissingTable(_) => {
                    tonic::Status::not_found(message)
                }
                _ => tonic::Status::internal(message),
            },
            FlightExchangeError::UnknownCommand(_) => tonic::Status::not_found(message),
            FlightExchangeError::Unauthenticated(_) => tonic::Status::unauthenticated(message),
            FlightExchangeError::UnknownAction(_)
            | FlightExchangeError::MissingDescriptor
            | FlightExchangeError::MissingSchema
            | FlightExchangeError::Json(_)
            | FlightExchangeError::Base64(_) => tonic::Status::invalid_argument(message),
            _ => tonic::Status::internal(message),
        }
    }
}

/// Anything failing on the wire surfaces to the core as a transport error.
impl From<FlightExchangeError> for FerryError {
    fn from(value: FlightExchangeError) -> Self {
        match value {
            FlightExchangeError::Core(e) => e,
            other => FerryError::TransportError(other.to_string()),
        }
    }
}
