//! The boundary between connections and the TLS record layer.
//!
//! A connection never talks to a TLS library directly. Instead it drives a
//! [`TlsSession`], a sans-I/O handle that turns ciphertext read from the
//! socket into plaintext and plaintext responses into ciphertext waiting to
//! be written. Handles are created per connection by a [`SessionFactory`]
//! which is set up once per process before the server starts accepting.
//!
//! Two implementations are provided:
//!
//! * [`RustlsContext`] / [`RustlsSession`] terminate DNS over TLS using
//!   [rustls], loading the certificate chain and private key from PEM
//!   files.
//! * [`PlainContext`] / [`PlainSession`] pass bytes through unchanged, for
//!   serving DNS over plain TCP with the very same framing.
//!
//! [rustls]: https://docs.rs/rustls/
use core::fmt;

use std::error;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::string::{String, ToString};
use std::sync::Arc;
use std::vec::Vec;

use bytes::{BufMut, BytesMut};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, trace};

/// The ALPN protocol identifier for DNS over TLS.
///
/// See the [IANA TLS ALPN registry].
///
/// [IANA TLS ALPN registry]:
///     https://www.iana.org/assignments/tls-extensiontype-values/tls-extensiontype-values.xhtml#alpn-protocol-ids
pub const DOT_ALPN: &[u8] = b"dot";

/// Size of the scratch buffer plaintext is delivered through.
const PLAINTEXT_CHUNK_SIZE: usize = 4096;

//------------ TlsSession ----------------------------------------------------

/// A server side TLS session handle for a single connection.
///
/// The handle owns no socket. Ciphertext is pushed into it and pulled out
/// of it by the connection that owns it.
pub trait TlsSession {
    /// Processes ciphertext received from the client.
    ///
    /// Any plaintext that becomes available is handed to `deliver`, which
    /// may be called any number of times with chunks of arbitrary size.
    /// Handshake records may leave data waiting in the outbound queue, so
    /// callers should follow up with [`Self::drain_outbound`].
    fn consume_ciphertext(
        &mut self,
        ciphertext: &[u8],
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), TlsError>;

    /// Encrypts plaintext and queues the result for sending.
    fn encrypt_for_send(&mut self, plaintext: &[u8]) -> Result<(), TlsError>;

    /// Moves all queued ciphertext into `out`.
    ///
    /// Returns the number of octets appended.
    fn drain_outbound(&mut self, out: &mut BytesMut)
        -> Result<usize, TlsError>;

    /// Returns whether the handshake is still in progress.
    fn is_handshaking(&self) -> bool;

    /// Returns whether the client has cleanly closed its side.
    fn peer_closed(&self) -> bool;

    /// Returns details about the established session.
    ///
    /// Returns `None` while the handshake is in progress.
    fn info(&self) -> Option<TlsInfo>;

    /// Queues a close notification for the client.
    fn close(&mut self);
}

//------------ SessionFactory ------------------------------------------------

/// Creates a [`TlsSession`] for every accepted connection.
pub trait SessionFactory {
    /// The type of session created.
    type Session: TlsSession + Send + 'static;

    /// Creates a new server side session.
    fn create(&self) -> Result<Self::Session, TlsError>;
}

impl<T: SessionFactory> SessionFactory for Arc<T> {
    type Session = T::Session;

    fn create(&self) -> Result<Self::Session, TlsError> {
        T::create(self)
    }
}

//------------ TlsInfo -------------------------------------------------------

/// Details of an established TLS session.
///
/// This is handed to the message dispatch service with every request so it
/// can relate a query to the session it arrived on.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TlsInfo {
    /// The server name the client asked for via SNI.
    pub server_name: Option<String>,

    /// The negotiated ALPN protocol.
    pub alpn_protocol: Option<Vec<u8>>,

    /// The negotiated protocol version, e.g. `TLSv1_3`.
    pub protocol_version: Option<String>,

    /// The negotiated cipher suite.
    pub cipher_suite: Option<String>,

    /// The DER encoded certificate chain presented by the client, if any.
    pub peer_certificates: Vec<Vec<u8>>,
}

impl TlsInfo {
    /// Returns whether the information describes an encrypted session.
    pub fn is_encrypted(&self) -> bool {
        self.protocol_version.is_some()
    }
}

//------------ RustlsContext -------------------------------------------------

/// Process wide TLS configuration backed by rustls.
#[derive(Clone)]
pub struct RustlsContext {
    config: Arc<rustls::ServerConfig>,
}

impl RustlsContext {
    /// Loads a certificate chain and private key from PEM files.
    ///
    /// The key may be PKCS#1, PKCS#8 or SEC1 encoded. The first key found
    /// in the file is used.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        debug!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Loading TLS certificate and key"
        );

        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        Self::from_der(certs, key)
    }

    /// Creates a context from an already parsed chain and key.
    pub fn from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        if certs.is_empty() {
            return Err(TlsError::NoCertificates);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TlsError::Protocol)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::Protocol)?;
        config.alpn_protocols = vec![DOT_ALPN.to_vec()];

        Ok(Self::from_config(Arc::new(config)))
    }

    /// Creates a context from a prepared rustls configuration.
    pub fn from_config(config: Arc<rustls::ServerConfig>) -> Self {
        Self { config }
    }

    /// Returns the underlying rustls configuration.
    pub fn config(&self) -> &Arc<rustls::ServerConfig> {
        &self.config
    }
}

impl SessionFactory for RustlsContext {
    type Session = RustlsSession;

    fn create(&self) -> Result<Self::Session, TlsError> {
        let conn = rustls::ServerConnection::new(self.config.clone())
            .map_err(TlsError::Protocol)?;
        Ok(RustlsSession {
            conn,
            peer_closed: false,
        })
    }
}

//--- Debug

impl fmt::Debug for RustlsContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RustlsContext")
            .field("alpn_protocols", &self.config.alpn_protocols)
            .finish()
    }
}

/// Reads all certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|err| TlsError::config(path, err))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::config(path, err))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

/// Reads the first private key from a PEM file.
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|err| TlsError::config(path, err))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| TlsError::config(path, err))?
        .ok_or(TlsError::NoPrivateKey)
}

//------------ RustlsSession -------------------------------------------------

/// A rustls server connection driven without a socket.
pub struct RustlsSession {
    conn: rustls::ServerConnection,

    /// Set once a close_notify alert from the client was processed.
    peer_closed: bool,
}

impl RustlsSession {
    /// Hands all buffered plaintext to `deliver`.
    fn read_plaintext(
        &mut self,
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), TlsError> {
        let mut buf = [0u8; PLAINTEXT_CHUNK_SIZE];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => deliver(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(())
                }
                Err(err) => return Err(TlsError::Io(err)),
            }
        }
    }
}

impl TlsSession for RustlsSession {
    fn consume_ciphertext(
        &mut self,
        mut ciphertext: &[u8],
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), TlsError> {
        while !ciphertext.is_empty() {
            let n = self.conn.read_tls(&mut ciphertext)?;
            trace!("Consumed {n} octets of ciphertext");

            let state = self
                .conn
                .process_new_packets()
                .map_err(TlsError::Protocol)?;

            if state.plaintext_bytes_to_read() > 0 {
                self.read_plaintext(deliver)?;
            }
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    fn encrypt_for_send(&mut self, plaintext: &[u8]) -> Result<(), TlsError> {
        self.conn.writer().write_all(plaintext)?;
        Ok(())
    }

    fn drain_outbound(
        &mut self,
        out: &mut BytesMut,
    ) -> Result<usize, TlsError> {
        let before = out.len();
        let mut writer = (&mut *out).writer();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut writer)?;
        }
        Ok(out.len() - before)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn info(&self) -> Option<TlsInfo> {
        if self.conn.is_handshaking() {
            return None;
        }
        Some(TlsInfo {
            server_name: self.conn.server_name().map(ToString::to_string),
            alpn_protocol: self.conn.alpn_protocol().map(<[u8]>::to_vec),
            protocol_version: self
                .conn
                .protocol_version()
                .map(|version| format!("{version:?}")),
            cipher_suite: self
                .conn
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            peer_certificates: self
                .conn
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.to_vec()).collect())
                .unwrap_or_default(),
        })
    }

    fn close(&mut self) {
        self.conn.send_close_notify();
    }
}

//------------ PlainContext --------------------------------------------------

/// A [`SessionFactory`] for unencrypted connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainContext;

impl SessionFactory for PlainContext {
    type Session = PlainSession;

    fn create(&self) -> Result<Self::Session, TlsError> {
        Ok(PlainSession::default())
    }
}

//------------ PlainSession --------------------------------------------------

/// A pass-through session: plaintext and ciphertext are the same.
#[derive(Debug, Default)]
pub struct PlainSession {
    outbound: Vec<u8>,
}

impl TlsSession for PlainSession {
    fn consume_ciphertext(
        &mut self,
        ciphertext: &[u8],
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), TlsError> {
        if !ciphertext.is_empty() {
            deliver(ciphertext);
        }
        Ok(())
    }

    fn encrypt_for_send(&mut self, plaintext: &[u8]) -> Result<(), TlsError> {
        self.outbound.extend_from_slice(plaintext);
        Ok(())
    }

    fn drain_outbound(
        &mut self,
        out: &mut BytesMut,
    ) -> Result<usize, TlsError> {
        let n = self.outbound.len();
        out.extend_from_slice(&self.outbound);
        self.outbound.clear();
        Ok(n)
    }

    fn is_handshaking(&self) -> bool {
        false
    }

    fn peer_closed(&self) -> bool {
        false
    }

    fn info(&self) -> Option<TlsInfo> {
        Some(TlsInfo::default())
    }

    fn close(&mut self) {}
}

//------------ TlsError ------------------------------------------------------

/// Errors raised by the TLS layer.
#[derive(Debug)]
pub enum TlsError {
    /// Reading or writing TLS records failed.
    Io(io::Error),

    /// The TLS protocol or its configuration failed.
    Protocol(rustls::Error),

    /// A certificate or key file could not be read.
    Config { path: String, err: io::Error },

    /// The key file contains no private key.
    NoPrivateKey,

    /// The certificate file contains no certificates.
    NoCertificates,
}

impl TlsError {
    fn config(path: &Path, err: io::Error) -> Self {
        TlsError::Config {
            path: path.display().to_string(),
            err,
        }
    }
}

//--- From

impl From<io::Error> for TlsError {
    fn from(err: io::Error) -> Self {
        TlsError::Io(err)
    }
}

//--- Display and Error

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsError::Io(err) => write!(f, "TLS I/O error: {err}"),
            TlsError::Protocol(err) => write!(f, "TLS error: {err}"),
            TlsError::Config { path, err } => {
                write!(f, "unable to read {path}: {err}")
            }
            TlsError::NoPrivateKey => write!(f, "no private key found"),
            TlsError::NoCertificates => write!(f, "no certificates found"),
        }
    }
}

impl error::Error for TlsError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TlsError::Io(err) => Some(err),
            TlsError::Protocol(err) => Some(err),
            TlsError::Config { err, .. } => Some(err),
            _ => None,
        }
    }
}

//============ Testing =======================================================
