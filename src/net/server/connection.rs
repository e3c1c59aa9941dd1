//! Support for stream based connections.
//!
//! A [`Connection`] drives a single accepted socket on the runtime of the
//! worker that picked it up: it reads ciphertext, lets the [`Session`] turn
//! it into complete messages, hands each message to the [`Service`] in
//! order and writes whatever the session has queued in response. It runs
//! until the client goes away, the session closes or faults, or a read or
//! write takes longer than configured.
use core::time::Duration;

use std::boxed::Box;
use std::net::SocketAddr;
use std::sync::Arc;
use std::vec::Vec;

use arc_swap::ArcSwap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::time::{timeout, Instant};
use tracing::Level;
use tracing::{debug, enabled, error, trace, warn};

use crate::utils::config::DefMinMax;

use super::metrics::ServerMetrics;
use super::pool::Job;
use super::service::{Request, Service, ServiceError};
use super::session::{Session, SessionError, SessionState};
use super::tls::TlsSession;
use super::util::to_pcap_text;

/// Limit on the amount of time to wait for the client to send something.
///
/// The value has to be between 1 millisecond and 1 hour with a default of
/// 10 seconds. The timer is rearmed every time a read is started, so it
/// bounds the gap between two reads rather than the lifetime of the
/// connection.
const READ_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::from_millis(1),
    Duration::from_secs(60 * 60),
);

/// Limit on the amount of time to wait for a write to complete.
///
/// The value has to be between 1 millisecond and 1 hour with a default of
/// 10 seconds.
const WRITE_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::from_millis(1),
    Duration::from_secs(60 * 60),
);

/// Limit on the size of a single incoming message.
///
/// The value has to be between the size of a DNS header and the largest
/// value the two octet length prefix can express, which is also the
/// default.
const MAX_MESSAGE_SIZE: DefMinMax<u16> = DefMinMax::new(u16::MAX, 12, u16::MAX);

/// Size of the buffer ciphertext is read into.
///
/// The value has to be between 512 octets and 64 KiB with a default of
/// 4 KiB.
const READ_CHUNK_SIZE: DefMinMax<usize> = DefMinMax::new(4096, 512, 65536);

//----------- Config ---------------------------------------------------------

/// Configuration for a stream server connection.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Limit on the amount of time to wait for the client to send
    /// something.
    read_timeout: Duration,

    /// Limit on the amount of time to wait for a write to complete.
    write_timeout: Duration,

    /// Limit on the size of a single incoming message.
    max_message_size: u16,

    /// Size of the buffer ciphertext is read into.
    read_chunk_size: usize,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Set the limit on the amount of time to wait for the client to send
    /// something.
    ///
    /// The value has to be between 1 millisecond and 1 hour with a default
    /// of 10 seconds. A read timing out tears the connection down.
    ///
    /// # Reconfigure
    ///
    /// On [`StreamServer::reconfigure`] a read already in progress keeps
    /// its timeout. The new value applies from the next read on.
    ///
    /// [`StreamServer::reconfigure`]:
    ///     super::stream::StreamServer::reconfigure()
    pub fn set_read_timeout(&mut self, value: Duration) {
        self.read_timeout = READ_TIMEOUT.limit(value);
    }

    /// Returns the write timeout.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Set the limit on the amount of time to wait for a write to complete.
    ///
    /// The value has to be between 1 millisecond and 1 hour with a default
    /// of 10 seconds. A write timing out tears the connection down.
    ///
    /// # Reconfigure
    ///
    /// On [`StreamServer::reconfigure`] a write already in progress keeps
    /// its timeout.
    ///
    /// [`StreamServer::reconfigure`]:
    ///     super::stream::StreamServer::reconfigure()
    pub fn set_write_timeout(&mut self, value: Duration) {
        self.write_timeout = WRITE_TIMEOUT.limit(value);
    }

    /// Returns the maximum size of an incoming message.
    pub fn max_message_size(&self) -> u16 {
        self.max_message_size
    }

    /// Set the limit on the size of a single incoming message.
    ///
    /// A length prefix announcing a larger message faults the connection
    /// before any of the message is buffered. The value has to be between
    /// 12 and 65,535, the latter being the default.
    ///
    /// # Reconfigure
    ///
    /// On [`StreamServer::reconfigure`] only connections accepted after the
    /// change use the new value.
    ///
    /// [`StreamServer::reconfigure`]:
    ///     super::stream::StreamServer::reconfigure()
    pub fn set_max_message_size(&mut self, value: u16) {
        self.max_message_size = MAX_MESSAGE_SIZE.limit(value);
    }

    /// Returns the read buffer size.
    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }

    /// Set the size of the buffer ciphertext is read into.
    ///
    /// The value has to be between 512 and 65,536 with a default of 4,096.
    pub fn set_read_chunk_size(&mut self, value: usize) {
        self.read_chunk_size = READ_CHUNK_SIZE.limit(value);
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT.default(),
            write_timeout: WRITE_TIMEOUT.default(),
            max_message_size: MAX_MESSAGE_SIZE.default(),
            read_chunk_size: READ_CHUNK_SIZE.default(),
        }
    }
}

//------------ Connection ----------------------------------------------------

/// A handler for a single stream connection between client and server.
pub struct Connection<Stream, Tls, Svc> {
    /// Flag used by the Drop impl to track if the metric count has to be
    /// decreased or not.
    active: bool,

    /// User supplied settings that influence our behaviour.
    ///
    /// Loaded afresh for every read and write so that
    /// [`StreamServer::reconfigure`] takes effect on live connections.
    ///
    /// [`StreamServer::reconfigure`]:
    ///     super::stream::StreamServer::reconfigure()
    config: Arc<ArcSwap<Config>>,

    /// The address of the connected client.
    addr: SocketAddr,

    /// The connection stream to the client.
    stream: Stream,

    /// TLS and framing state.
    session: Session<Tls>,

    /// A [`Service`] for handling received requests and generating
    /// responses.
    service: Arc<Svc>,

    /// Buffer for reading from the stream.
    read_buf: Vec<u8>,

    /// [`ServerMetrics`] describing the status of the server.
    metrics: Arc<ServerMetrics>,
}

/// Creation
///
impl<Stream, Tls, Svc> Connection<Stream, Tls, Svc> {
    /// Creates a new handler for an accepted stream connection.
    #[must_use]
    pub fn new(
        stream: Stream,
        addr: SocketAddr,
        session: Session<Tls>,
        service: Arc<Svc>,
        config: Arc<ArcSwap<Config>>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            active: false,
            config,
            addr,
            stream,
            session,
            service,
            read_buf: Vec::new(),
            metrics,
        }
    }
}

/// Control
///
impl<Stream, Tls, Svc> Connection<Stream, Tls, Svc>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
    Tls: TlsSession,
    Svc: Service,
{
    /// Services the connection until it is torn down.
    ///
    /// # Shutdown behaviour
    ///
    /// A connection is never interrupted by the server shutting down. It
    /// ends on its own once the client disconnects, a fault occurs or the
    /// read timeout expires.
    pub async fn run(mut self) {
        ServerMetrics::inc(&self.metrics.num_connections);

        // Flag that we have to decrease the metric count on Drop.
        self.active = true;

        let event = self.run_until_error().await;
        self.teardown(event).await;
    }
}

//--- Internal details

impl<Stream, Tls, Svc> Connection<Stream, Tls, Svc>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
    Tls: TlsSession,
    Svc: Service,
{
    /// Connection handler main loop.
    async fn run_until_error(&mut self) -> ConnectionEvent {
        loop {
            let config = **self.config.load();

            let messages = match self.read(&config).await {
                Ok(messages) => messages,
                Err(event) => return event,
            };

            // Responses are collected for the whole read and then go out
            // in a single write.
            let mut res = Ok(());
            for message in messages {
                res = self.dispatch(message).await;
                if res.is_err() {
                    break;
                }
            }

            if let Err(event) = self.flush(config.write_timeout).await {
                return event;
            }
            if let Err(event) = res {
                return event;
            }

            match self.session.state() {
                SessionState::Faulted => return ConnectionEvent::Fault,
                SessionState::Closing => return ConnectionEvent::Close,
                _ => {}
            }
        }
    }

    /// Reads the next chunk from the stream and feeds it to the session.
    async fn read(
        &mut self,
        config: &Config,
    ) -> Result<Vec<Vec<u8>>, ConnectionEvent> {
        self.read_buf.resize(config.read_chunk_size, 0);
        let len = match timeout(
            config.read_timeout,
            self.stream.read(&mut self.read_buf),
        )
        .await
        {
            Err(_) => {
                debug!(
                    addr = %self.addr,
                    "Read timed out (>{:?})", config.read_timeout
                );
                return Err(ConnectionEvent::Fault);
            }
            Ok(Err(err)) => {
                debug!(addr = %self.addr, "Read error: {err}");
                return Err(ConnectionEvent::Fault);
            }
            Ok(Ok(0)) => {
                trace!(addr = %self.addr, "Client closed the connection");
                return Err(ConnectionEvent::DisconnectWithoutFlush);
            }
            Ok(Ok(len)) => len,
        };

        trace!(addr = %self.addr, "Read {len} octets");
        match self.session.on_readable(&self.read_buf[..len]) {
            Ok(messages) => Ok(messages),
            Err(err) => {
                debug!(addr = %self.addr, "Unable to process input: {err}");
                // Give the client a chance to see the TLS alert.
                let _ = self.flush(config.write_timeout).await;
                Err(ConnectionEvent::Fault)
            }
        }
    }

    /// Passes a received message to the service and queues its responses.
    async fn dispatch(
        &mut self,
        message: Vec<u8>,
    ) -> Result<(), ConnectionEvent> {
        let received_at = Instant::now();

        if enabled!(Level::TRACE) {
            let pcap_text = to_pcap_text(&message, message.len());
            trace!(addr = %self.addr, pcap_text, "Received message");
        }

        ServerMetrics::inc(&self.metrics.num_received_messages);

        let tls = self.session.tls_info().unwrap_or_default();
        let request = Request::new(message, self.addr, received_at, tls);

        match self.service.call(request).await {
            Ok(responses) => {
                for response in responses {
                    self.queue_response(&response)?;
                }
                Ok(())
            }
            Err(ServiceError::Malformed) => {
                debug!(addr = %self.addr, "Dropping malformed request");
                Ok(())
            }
            Err(ServiceError::Internal(reason)) => {
                error!(addr = %self.addr, "Service error: {reason}");
                Ok(())
            }
            Err(ServiceError::CloseConnection) => {
                debug!(addr = %self.addr, "Service closed the connection");
                Err(ConnectionEvent::Close)
            }
        }
    }

    /// Frames and encrypts a single response.
    fn queue_response(&mut self, response: &[u8]) -> Result<(), ConnectionEvent> {
        if enabled!(Level::TRACE) {
            let pcap_text = to_pcap_text(response, response.len());
            trace!(addr = %self.addr, pcap_text, "Sending response");
        }

        match self.session.queue_response(response) {
            Ok(()) => {
                ServerMetrics::inc(&self.metrics.num_sent_responses);
                Ok(())
            }
            Err(SessionError::Frame(err)) => {
                // Only this response is lost, the stream is still intact.
                warn!(addr = %self.addr, "Dropping response: {err}");
                Ok(())
            }
            Err(err) => {
                error!(addr = %self.addr, "Unable to queue response: {err}");
                Err(ConnectionEvent::Fault)
            }
        }
    }

    /// Writes everything the session has queued.
    async fn flush(
        &mut self,
        write_timeout: Duration,
    ) -> Result<(), ConnectionEvent> {
        let data = match self.session.on_writable() {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!(addr = %self.addr, "Unable to produce output: {err}");
                return Err(ConnectionEvent::Fault);
            }
        };

        match timeout(write_timeout, self.stream.write_all(&data)).await {
            Err(_) => {
                warn!(
                    addr = %self.addr,
                    "Write timed out (>{write_timeout:?})"
                );
                Err(ConnectionEvent::Fault)
            }
            Ok(Err(err)) => {
                debug!(addr = %self.addr, "Write error: {err}");
                Err(ConnectionEvent::Fault)
            }
            Ok(Ok(())) => {
                trace!(addr = %self.addr, "Wrote {} octets", data.len());
                Ok(())
            }
        }
    }

    /// Closes the connection and releases its resources.
    async fn teardown(&mut self, event: ConnectionEvent) {
        let write_timeout = self.config.load().write_timeout;

        match event {
            ConnectionEvent::Close => {
                self.session.close();
                let _ = self.flush(write_timeout).await;
            }
            ConnectionEvent::Fault => {
                self.session.on_error_or_timeout();
                ServerMetrics::inc(&self.metrics.num_faulted_connections);
            }
            ConnectionEvent::DisconnectWithoutFlush => {}
        }

        trace!(addr = %self.addr, "Shutting down the write stream.");
        if let Ok(Err(err)) =
            timeout(write_timeout, self.stream.shutdown()).await
        {
            trace!(
                addr = %self.addr,
                "Error while shutting down the write stream: {err}"
            );
        }

        debug!(
            addr = %self.addr,
            reads = self.session.reads_serviced(),
            "Connection terminated."
        );
        self.session.terminate();
    }
}

//--- Drop

impl<Stream, Tls, Svc> Drop for Connection<Stream, Tls, Svc> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            ServerMetrics::dec(&self.metrics.num_connections);
        }
    }
}

//------------ ConnectionJob -------------------------------------------------

/// An accepted connection waiting for a worker.
///
/// The socket is held in its blocking-agnostic std form so that it can be
/// registered with whichever worker runtime ends up running the job.
pub struct ConnectionJob<Tls, Svc> {
    stream: std::net::TcpStream,
    addr: SocketAddr,
    session: Session<Tls>,
    service: Arc<Svc>,
    config: Arc<ArcSwap<Config>>,
    metrics: Arc<ServerMetrics>,
}

impl<Tls, Svc> ConnectionJob<Tls, Svc> {
    /// Creates a job for a freshly accepted socket.
    ///
    /// The socket must be in non-blocking mode.
    pub fn new(
        stream: std::net::TcpStream,
        addr: SocketAddr,
        session: Session<Tls>,
        service: Arc<Svc>,
        config: Arc<ArcSwap<Config>>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            stream,
            addr,
            session,
            service,
            config,
            metrics,
        }
    }
}

impl<Tls, Svc> Job for ConnectionJob<Tls, Svc>
where
    Tls: TlsSession + Send + 'static,
    Svc: Service + Send + Sync + 'static,
{
    fn run(self: Box<Self>, rt: &Runtime) {
        let job = *self;
        rt.block_on(async move {
            let stream = match TcpStream::from_std(job.stream) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(addr = %job.addr, "Unable to register socket: {err}");
                    return;
                }
            };
            Connection::new(
                stream,
                job.addr,
                job.session,
                job.service,
                job.config,
                job.metrics,
            )
            .run()
            .await
        })
    }
}

//------------ ConnectionEvent -----------------------------------------------

/// Why the connection handler stopped servicing the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConnectionEvent {
    /// The client closed the connection.
    ///
    /// RFC 7766 6.2.3 "If a DNS server finds that a DNS client has closed a
    /// TCP session [...] before all pending responses have been sent, then
    /// the server MUST NOT attempt to send those responses."
    DisconnectWithoutFlush,

    /// An orderly close, either asked for by the service or started by the
    /// client with a TLS close notification.
    ///
    /// Pending responses are written, followed by our own close
    /// notification.
    Close,

    /// An I/O error, a timeout, or a TLS or framing fault.
    Fault,
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::tls::{PlainContext, PlainSession, SessionFactory};
    use core::future::{ready, Ready};
    use tokio::io::DuplexStream;

    type Responses = Result<Vec<Vec<u8>>, ServiceError>;

    fn echo(request: Request) -> Ready<Responses> {
        let msg = request.into_message();
        ready(match msg.first() {
            Some(b'!') => Err(ServiceError::CloseConnection),
            Some(b'?') => Err(ServiceError::Malformed),
            Some(b'#') => Err(ServiceError::Internal("boom".into())),
            _ => Ok(vec![msg]),
        })
    }

    type TestConnection<Svc> = (
        Connection<DuplexStream, PlainSession, Svc>,
        DuplexStream,
        Arc<ServerMetrics>,
    );

    fn connection<Svc>(service: Svc, config: Config) -> TestConnection<Svc> {
        connection_with_buffer(service, config, 64 * 1024)
    }

    fn connection_with_buffer<Svc>(
        service: Svc,
        config: Config,
        max_buf_size: usize,
    ) -> TestConnection<Svc> {
        let (client, server) = tokio::io::duplex(max_buf_size);
        let metrics = Arc::new(ServerMetrics::new());
        let session = Session::new(
            PlainContext.create().unwrap(),
            config.max_message_size(),
        );
        let conn = Connection::new(
            server,
            "192.0.2.1:5301".parse().unwrap(),
            session,
            Arc::new(service),
            Arc::new(ArcSwap::from_pointee(config)),
            metrics.clone(),
        );
        (conn, client, metrics)
    }

    async fn read_response(client: &mut DuplexStream) -> Vec<u8> {
        let mut len = [0u8; 2];
        client.read_exact(&mut len).await.unwrap();
        let mut msg = vec![0; u16::from_be_bytes(len).into()];
        client.read_exact(&mut msg).await.unwrap();
        msg
    }

    #[test]
    fn config_limits() {
        let mut config = Config::new();
        assert_eq!(config.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_message_size(), u16::MAX);
        config.set_read_timeout(Duration::ZERO);
        assert_eq!(config.read_timeout(), Duration::from_millis(1));
        config.set_write_timeout(Duration::from_secs(100_000));
        assert_eq!(config.write_timeout(), Duration::from_secs(3600));
        config.set_max_message_size(3);
        assert_eq!(config.max_message_size(), 12);
        config.set_read_chunk_size(1);
        assert_eq!(config.read_chunk_size(), 512);
    }

    #[tokio::test]
    async fn responses_in_order() {
        let (conn, mut client, metrics) = connection(echo, Config::new());

        let client_side = async move {
            // Dribble two messages in across several writes.
            client.write_all(&[0x00]).await.unwrap();
            client.write_all(&[0x03, b'o', b'n']).await.unwrap();
            client.write_all(b"e\x00\x03two").await.unwrap();
            assert_eq!(read_response(&mut client).await, b"one");
            assert_eq!(read_response(&mut client).await, b"two");
            client.write_all(b"\x00\x05three").await.unwrap();
            assert_eq!(read_response(&mut client).await, b"three");
        };
        tokio::join!(conn.run(), client_side);

        assert_eq!(metrics.num_connections(), 0);
        assert_eq!(metrics.num_received_messages(), 3);
        assert_eq!(metrics.num_sent_responses(), 3);
        assert_eq!(metrics.num_faulted_connections(), 0);
    }

    #[tokio::test]
    async fn service_errors_drop_requests() {
        let (conn, mut client, metrics) = connection(echo, Config::new());

        let client_side = async move {
            client
                .write_all(b"\x00\x02?x\x00\x02#x\x00\x02ok")
                .await
                .unwrap();
            assert_eq!(read_response(&mut client).await, b"ok");
        };
        tokio::join!(conn.run(), client_side);

        assert_eq!(metrics.num_received_messages(), 3);
        assert_eq!(metrics.num_sent_responses(), 1);
    }

    #[tokio::test]
    async fn service_can_close() {
        let (conn, mut client, _) = connection(echo, Config::new());

        let client_side = async move {
            client
                .write_all(b"\x00\x02ab\x00\x01!\x00\x02cd")
                .await
                .unwrap();
            assert_eq!(read_response(&mut client).await, b"ab");
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };
        tokio::join!(conn.run(), client_side);
    }

    #[tokio::test]
    async fn oversized_message_faults() {
        let mut config = Config::new();
        config.set_max_message_size(512);
        let (conn, mut client, metrics) = connection(echo, config);

        let client_side = async move {
            client.write_all(b"\x00\x02ok\x02\x01").await.unwrap();
            assert_eq!(read_response(&mut client).await, b"ok");
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };
        tokio::join!(conn.run(), client_side);

        assert_eq!(metrics.num_faulted_connections(), 1);
        assert_eq!(metrics.num_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let mut config = Config::new();
        config.set_read_timeout(Duration::from_secs(5));
        let (conn, mut client, metrics) = connection(echo, config);

        let client_side = async move {
            // Half a message and then nothing.
            client.write_all(&[0x00, 0x04, b'a']).await.unwrap();
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };
        tokio::join!(conn.run(), client_side);

        assert_eq!(metrics.num_faulted_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let mut config = Config::new();
        config.set_write_timeout(Duration::from_millis(200));
        let bulky = |_request: Request| {
            ready(Ok::<_, ServiceError>(vec![vec![0u8; 60_000]; 4]))
        };
        let (conn, mut client, metrics) =
            connection_with_buffer(bulky, config, 1024);

        let started = Instant::now();
        let server_side = async move {
            conn.run().await;
            started.elapsed()
        };
        let client_side = async move {
            client.write_all(b"\x00\x01a").await.unwrap();
            // Do not read until the server gave up on writing.
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            rest.len()
        };
        let (elapsed, received) = tokio::join!(server_side, client_side);

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(5));
        assert!(received < 4 * 60_002);
        assert_eq!(metrics.num_sent_responses(), 4);
        assert_eq!(metrics.num_faulted_connections(), 1);
        assert_eq!(metrics.num_connections(), 0);
    }

    #[tokio::test]
    async fn reconfigure_applies_to_next_read() {
        let (conn, mut client, metrics) = connection(echo, Config::new());
        let config = conn.config.clone();

        let client_side = async move {
            client.write_all(b"\x00\x01a").await.unwrap();
            assert_eq!(read_response(&mut client).await, b"a");

            let mut new_config = Config::new();
            new_config.set_read_timeout(Duration::from_millis(20));
            config.store(Arc::new(new_config));

            // Trigger one more read so the new timeout gets picked up.
            client.write_all(b"\x00\x01b").await.unwrap();
            assert_eq!(read_response(&mut client).await, b"b");
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
        };
        tokio::join!(conn.run(), client_side);

        assert_eq!(metrics.num_faulted_connections(), 1);
    }
}
