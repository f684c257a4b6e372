use std::fmt;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::str::FromStr;

use base64::prelude::*;
use url::Url;

use crate::errors::{FlightExchangeError, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5005;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

const SCHEME: &str = "grpc";

/// Location of an exchange server, always `grpc://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightUrl {
    host: String,
    port: u16,
}

impl FlightUrl {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        FlightUrl {
            host: host.into(),
            port,
        }
    }

    /// Url on the loopback interface with a port picked by the OS when bound.
    pub fn ephemeral() -> Self {
        FlightUrl::new("127.0.0.1", 0)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s)?;
        if url.scheme() != SCHEME {
            return Err(FlightExchangeError::InvalidUrl {
                url: s.to_string(),
                reason: format!("scheme must be '{SCHEME}'"),
            });
        }
        let host = url.host_str().ok_or_else(|| FlightExchangeError::InvalidUrl {
            url: s.to_string(),
            reason: "missing host".to_string(),
        })?;
        Ok(FlightUrl::new(host, url.port().unwrap_or(DEFAULT_PORT)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FlightExchangeError::InvalidUrl {
                url: self.to_string(),
                reason: "host did not resolve".to_string(),
            })
    }

    /// Whether something is already listening on this url's port. Port 0 is
    /// never in use.
    pub fn port_in_use(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        match self.socket_addr() {
            Ok(addr) => TcpListener::bind(addr).is_err(),
            Err(_) => false,
        }
    }

    /// Endpoint string understood by tonic.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for FlightUrl {
    fn default() -> Self {
        FlightUrl::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for FlightUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}:{}", self.host, self.port)
    }
}

impl FromStr for FlightUrl {
    type Err = FlightExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        FlightUrl::parse(s)
    }
}

impl From<SocketAddr> for FlightUrl {
    fn from(addr: SocketAddr) -> Self {
        FlightUrl::new(addr.ip().to_string(), addr.port())
    }
}

/// Credentials checked against the `authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        BasicAuth {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value of the `authorization` header carrying these credentials.
    pub fn header_value(&self) -> String {
        let encoded = BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }

    /// Parse an `authorization` header value.
    pub fn from_header(value: &str) -> Result<Self> {
        let encoded = value.strip_prefix("Basic ").ok_or_else(|| {
            FlightExchangeError::Unauthenticated(format!("auth type not implemented: {value}"))
        })?;
        let bytes = BASE64_STANDARD.decode(encoded)?;
        let s = String::from_utf8(bytes).map_err(|_| {
            FlightExchangeError::Unauthenticated("authorization not parsable".to_string())
        })?;
        match s.split_once(':') {
            Some((user, pass)) => Ok(BasicAuth::new(user, pass)),
            None => Err(FlightExchangeError::Unauthenticated(
                "invalid authorization header".to_string(),
            )),
        }
    }

    /// Check a header value against these credentials.
    pub fn validate(&self, header: Option<&str>) -> Result<()> {
        let header = header.ok_or_else(|| {
            FlightExchangeError::Unauthenticated("authorization field not present".to_string())
        })?;
        if &BasicAuth::from_header(header)? != self {
            return Err(FlightExchangeError::Unauthenticated(
                "invalid credentials".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings for an exchange server and the clients talking to it.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub url: FlightUrl,
    pub auth: Option<BasicAuth>,
    /// Bound on in-flight messages between the client's producer task and
    /// the transport.
    pub channel_capacity: usize,
}

impl ServerConfig {
    pub fn new(url: FlightUrl) -> Self {
        ServerConfig {
            url,
            ..Default::default()
        }
    }

    pub fn with_auth(mut self, auth: BasicAuth) -> Self {
        self.auth = Some(auth);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            url: FlightUrl::default(),
            auth: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
