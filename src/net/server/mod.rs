//! Serving DNS over TLS.
//!
//! This module provides a server for DNS over TLS ([RFC 7858]) based on the
//! [Tokio](https://tokio.rs/) async runtime. In combination with a TLS
//! context and your own [`Service`] implementation it can be used to answer
//! DNS queries received over encrypted TCP connections.
//!
//! # Architecture
//!
//! A layered stack of components is responsible for handling incoming
//! requests and outgoing responses:
//!
//! ```text
//!    --> accept loop                 - accepts TCP connections
//!       --> worker pool              - assigns each connection a thread
//!          --> connection            - reads and writes the socket
//!             --> session            - decrypts ciphertext
//!                --> framer          - splits plaintext into messages
//!                   --> service      - processes requests &
//!                   <--                generates responses
//!             <-- session            - length prefixes and encrypts
//!          <-- connection            - writes ciphertext to the client
//! ```
//!
//! # Usage
//!
//! - Create a listening socket with [`stream::bind`].
//! - Create a TLS context, usually [`RustlsContext::from_pem_files`].
//! - Construct a [`StreamServer`] with the socket, the context and your
//!   service.
//! - [`run()`] the server.
//! - [`shutdown()`] the server and [`join()`] it to wait for connections
//!   still being serviced.
//!
//! # Concurrency
//!
//! The accept loop runs on the Tokio runtime you run it on. Accepted
//! connections are handed to a fixed pool of worker threads. Each worker
//! has its own single threaded runtime and services exactly one connection
//! until it ends, so a slow or hostile client can only ever stall its own
//! worker. Connections accepted while all workers are busy wait in a
//! bounded queue. If the queue is full, the connection is closed.
//!
//! # Plain TCP
//!
//! With [`PlainContext`] in place of a TLS context, the very same server
//! serves DNS over plain TCP as described in [RFC 7766].
//!
//! [RFC 7766]: https://datatracker.ietf.org/doc/html/rfc7766
//! [RFC 7858]: https://datatracker.ietf.org/doc/html/rfc7858
//! [`PlainContext`]: tls::PlainContext
//! [`RustlsContext::from_pem_files`]: tls::RustlsContext::from_pem_files
//! [`Service`]: service::Service
//! [`StreamServer`]: stream::StreamServer
//! [`run()`]: stream::StreamServer::run()
//! [`shutdown()`]: stream::StreamServer::shutdown()
//! [`join()`]: stream::StreamServer::join()

pub mod connection;
pub mod error;
pub mod framer;
pub mod metrics;
pub mod pool;
pub mod service;
pub mod session;
pub mod stream;
pub mod tls;
pub mod util;

//------------ ServerCommand -------------------------------------------------

/// Command a server to do something.
#[derive(Clone, Copy, Debug)]
pub enum ServerCommand {
    /// Command the server to alter its configuration.
    Reconfigure(connection::Config),

    /// Command the server to stop accepting connections.
    Shutdown,

    /// The initial value of the command channel. Never acted upon.
    Init,
}
