//! Identity extraction from the first bytes of a database session
//!
//! Each protocol module reads just enough of a fresh client connection to
//! learn which user the client claims to be, while remembering every byte it
//! consumed so the session can be replayed to whichever backend owns that
//! user. MySQL is the exception: the server speaks first, so the proxy
//! answers with its own greeting and later bridges the client into the real
//! backend's authentication exchange.

pub mod mysql;
pub mod postgres;
pub mod resp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Wire protocol spoken on a database proxy listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Mysql,
    Postgresql,
    /// Redis-compatible (RESP)
    Memory,
}

impl Protocol {
    /// Value of the `type` label on services of this protocol
    pub fn service_type(&self) -> &'static str {
        match self {
            Protocol::Mysql => "mysql",
            Protocol::Postgresql => "postgresql",
            Protocol::Memory => "memory",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_type())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Protocol::Mysql),
            "postgresql" | "postgres" => Ok(Protocol::Postgresql),
            "memory" | "redis" => Ok(Protocol::Memory),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Failures while reading or bridging a handshake
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed during handshake")]
    Closed,

    #[error("handshake exceeded {limit} bytes")]
    TooLarge { limit: usize },

    #[error("malformed {protocol} handshake: {reason}")]
    Malformed {
        protocol: Protocol,
        reason: String,
    },

    #[error("cancel request carries no user")]
    CancelRequest,

    #[error("unsupported {protocol} client: {reason}")]
    Unsupported {
        protocol: Protocol,
        reason: String,
    },

    #[error("backend refused the handshake: {0}")]
    Backend(String),
}

impl HandshakeError {
    pub(crate) fn malformed(protocol: Protocol, reason: impl Into<String>) -> Self {
        HandshakeError::Malformed {
            protocol,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(protocol: Protocol, reason: impl Into<String>) -> Self {
        HandshakeError::Unsupported {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Where the routing identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Handshake,
    /// No identity in the handshake; the peer address stands in
    PeerAddress,
}

/// Protocol state carried from identity extraction to backend setup
#[derive(Debug, Clone)]
pub(crate) enum HelloDetail {
    Resp { auth_attempted: bool },
    Postgres,
    Mysql {
        response: mysql::HandshakeResponse,
        /// Capabilities of the synthetic greeting the client answered
        offered: u32,
    },
}

/// What a client revealed before any backend was chosen
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub identity: String,
    pub source: IdentitySource,
    /// Bytes consumed from the client that the backend must see verbatim
    pub preamble: Vec<u8>,
    pub(crate) detail: HelloDetail,
}

/// Per-listener identity extractor
pub struct Handshaker {
    protocol: Protocol,
    max_bytes: usize,
    greeting: mysql::GreetingTemplate,
}

impl Handshaker {
    pub fn new(protocol: Protocol, max_bytes: usize, mysql_server_version: &str) -> Self {
        Self {
            protocol,
            max_bytes,
            greeting: mysql::GreetingTemplate::new(mysql_server_version),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Read the client's opening move and extract its identity
    pub async fn read_client_hello<S>(
        &self,
        client: &mut S,
        peer: SocketAddr,
    ) -> Result<ClientHello, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.protocol {
            Protocol::Memory => resp::read_client_hello(client, peer, self.max_bytes).await,
            Protocol::Postgresql => postgres::read_client_hello(client, self.max_bytes).await,
            Protocol::Mysql => mysql::read_client_hello(client, &self.greeting, self.max_bytes).await,
        }
    }

    /// Bring a freshly dialed backend to the point where raw splicing can start
    pub async fn forward_hello<C, B>(
        &self,
        hello: &ClientHello,
        client: &mut C,
        backend: &mut B,
    ) -> Result<(), HandshakeError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        match &hello.detail {
            HelloDetail::Mysql { response, offered } => {
                mysql::bridge_authentication(response, *offered, client, backend, &self.greeting, self.max_bytes)
                    .await
            }
            _ => {
                backend.write_all(&hello.preamble).await?;
                backend.flush().await?;
                Ok(())
            }
        }
    }

    /// Tell the client, in its own protocol, that its identity is unknown
    pub async fn reject<S>(&self, hello: &ClientHello, client: &mut S) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let reply = match &hello.detail {
            HelloDetail::Resp { auth_attempted } => resp::rejection(*auth_attempted),
            HelloDetail::Postgres => postgres::rejection(&hello.identity),
            HelloDetail::Mysql { .. } => mysql::rejection(&hello.identity),
        };
        client.write_all(&reply).await?;
        client.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("MySQL".parse::<Protocol>().unwrap(), Protocol::Mysql);
        assert_eq!("postgres".parse::<Protocol>().unwrap(), Protocol::Postgresql);
        assert_eq!("redis".parse::<Protocol>().unwrap(), Protocol::Memory);
        assert!("mongo".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_service_type_matches_labels() {
        assert_eq!(Protocol::Memory.service_type(), "memory");
        assert_eq!(Protocol::Postgresql.to_string(), "postgresql");
    }
}
