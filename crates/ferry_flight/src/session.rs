use std::fmt;

use tracing::debug;

use crate::client::FlightExchangeClient;
use crate::errors::{FlightExchangeError, Result};
use crate::server::FlightExchangeServer;

/// Lifecycle of a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing started yet.
    Idle,
    /// Server reachable and the computation may be registered.
    Serving,
    /// Batches are flowing.
    Exchanging,
    Closed,
}

impl SessionState {
    /// Move to `to`, failing if the transition isn't allowed. Any state may
    /// close.
    pub fn advance(self, to: SessionState) -> Result<SessionState> {
        use SessionState::*;
        match (self, to) {
            (Idle, Serving) | (Serving, Exchanging) | (_, Closed) => Ok(to),
            (from, to) => Err(FlightExchangeError::InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Serving => "serving",
            SessionState::Exchanging => "exchanging",
            SessionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// A client connection, plus the server it talks to when the session owns
/// one. Dropping the session shuts an owned server down.
#[derive(Debug)]
pub struct ExchangeSession {
    state: SessionState,
    client: FlightExchangeClient,
    server: Option<FlightExchangeServer>,
}

impl ExchangeSession {
    pub fn new(client: FlightExchangeClient, server: Option<FlightExchangeServer>) -> Result<Self> {
        Ok(ExchangeSession {
            state: SessionState::Idle.advance(SessionState::Serving)?,
            client,
            server,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&mut self) -> &mut FlightExchangeClient {
        &mut self.client
    }

    pub fn begin_exchange(&mut self) -> Result<()> {
        self.state = self.state.advance(SessionState::Exchanging)?;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        debug!(from = %self.state, "closing exchange session");
        self.state = SessionState::Closed;
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}

impl Drop for ExchangeSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use SessionState::*;

        let state = Idle.advance(Serving).unwrap();
        let state = state.advance(Exchanging).unwrap();
        assert_eq!(Closed, state.advance(Closed).unwrap());

        Idle.advance(Exchanging).unwrap_err();
        Exchanging.advance(Serving).unwrap_err();
        Closed.advance(Serving).unwrap_err();
        assert_eq!(Closed, Idle.advance(Closed).unwrap());
    }
}
