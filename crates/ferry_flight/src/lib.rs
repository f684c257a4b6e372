//! Exchanging record batches with a remote computation over Arrow Flight.
//!
//! A client registers an unbound plan with `DoAction`, then streams input
//! batches through `DoExchange` while reading the output of the plan run
//! over them.

pub mod action;
pub mod client;
pub mod config;
pub mod errors;
pub mod exchanger;
pub mod server;
pub mod session;

pub use client::{ExchangeStats, FlightExchangeClient};
pub use config::{BasicAuth, FlightUrl, ServerConfig};
pub use errors::{FlightExchangeError, Result};
pub use exchanger::{flight_operator, flight_udxf, ExchangeTarget, FlightExchanger};
pub use server::{ExchangeService, FlightExchangeServer};
pub use session::{ExchangeSession, SessionState};

pub mod export {
    pub use arrow_flight;
    pub use tonic;
}
