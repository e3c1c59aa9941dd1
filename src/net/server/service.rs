//! The message dispatch collaborator.
//!
//! The server itself does not interpret DNS messages. Every complete
//! message taken off a connection is handed to a user supplied [`Service`]
//! which returns the responses, if any, to send back.
use core::fmt;
use core::future::Future;

use std::error;
use std::net::SocketAddr;
use std::string::String;
use std::sync::Arc;
use std::vec::Vec;

use tokio::time::Instant;

use super::tls::TlsInfo;

//------------ Request -------------------------------------------------------

/// A complete DNS message received on a connection.
#[derive(Clone, Debug)]
pub struct Request {
    /// The message in wire format, without its length prefix.
    message: Vec<u8>,

    /// The address of the client.
    client_addr: SocketAddr,

    /// When the last octet of the message was received.
    received_at: Instant,

    /// The TLS session the message arrived on.
    tls: Arc<TlsInfo>,
}

impl Request {
    /// Creates a new request.
    pub fn new(
        message: Vec<u8>,
        client_addr: SocketAddr,
        received_at: Instant,
        tls: Arc<TlsInfo>,
    ) -> Self {
        Self {
            message,
            client_addr,
            received_at,
            tls,
        }
    }

    /// Returns the message in wire format.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Takes the message out of the request.
    pub fn into_message(self) -> Vec<u8> {
        self.message
    }

    /// Returns the address of the client.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Returns when the last octet of the message was received.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Returns details of the TLS session the request arrived on.
    pub fn tls(&self) -> &TlsInfo {
        &self.tls
    }
}

//------------ Service -------------------------------------------------------

/// A Service generates the responses to received DNS messages.
///
/// The returned future resolves to zero or more response messages in wire
/// format, without length prefix. The connection waits for the future to
/// resolve before it looks at the next message received, so responses are
/// always written in the order in which the requests arrived.
///
/// Futures are polled on the single threaded runtime of the worker that
/// owns the connection and thus need not be [`Send`].
///
/// You can either implement the trait directly, or use the blanket impl to
/// turn any function with a compatible signature into a [`Service`]:
///
/// ```
/// use dotserve::net::server::service::{Request, Service, ServiceError};
///
/// fn echo() -> impl Service {
///     |request: Request| async move {
///         Ok::<_, ServiceError>(vec![request.into_message()])
///     }
/// }
/// ```
pub trait Service {
    /// The future producing the responses.
    type Future: Future<Output = Result<Vec<Vec<u8>>, ServiceError>>;

    /// Handles a single request.
    fn call(&self, request: Request) -> Self::Future;
}

impl<F, Fut> Service for F
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Vec<Vec<u8>>, ServiceError>>,
{
    type Future = Fut;

    fn call(&self, request: Request) -> Self::Future {
        (*self)(request)
    }
}

//------------ ServiceError --------------------------------------------------

/// Failures a [`Service`] can report back to the connection.
///
/// None of these result in a message being sent to the client: framing and
/// transport level faults are not DNS level responses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceError {
    /// The request could not be parsed. It is dropped.
    Malformed,

    /// Processing failed. The request is dropped.
    Internal(String),

    /// The connection should be closed after any earlier responses are
    /// written.
    CloseConnection,
}

//--- Display and Error

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceError::Malformed => write!(f, "malformed request"),
            ServiceError::Internal(reason) => {
                write!(f, "internal error: {reason}")
            }
            ServiceError::CloseConnection => {
                write!(f, "service asked to close the connection")
            }
        }
    }
}

impl error::Error for ServiceError {}

//============ Testing =======================================================
