//! The accept loop of a DNS over TLS server.
//!
//! A [`StreamServer`] accepts connections on a [`TcpListener`] using the
//! Tokio runtime it is run on, pairs every accepted socket with a fresh
//! TLS session and hands both to its [`WorkerPool`] as a [`ConnectionJob`].
//! The accept loop itself never reads from or writes to a connection.
use core::num::NonZeroUsize;

use std::boxed::Box;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::utils::config::DefMinMax;

use super::connection::{self, ConnectionJob};
use super::error::Error;
use super::metrics::ServerMetrics;
use super::pool::WorkerPool;
use super::service::Service;
use super::session::Session;
use super::tls::SessionFactory;
use super::ServerCommand;

/// Limit on the number of worker threads.
///
/// The default is only used if the available hardware parallelism cannot
/// be determined. Otherwise there is one worker per hardware thread.
const WORKERS: DefMinMax<usize> = DefMinMax::new(4, 1, 1024);

/// Limit on the number of accepted connections waiting for a worker.
///
/// The value has to be between zero and 65,536 with a default of 128. With
/// zero, a connection is only accepted if a worker is idle.
const MAX_QUEUED_CONNECTIONS: DefMinMax<usize> =
    DefMinMax::new(128, 0, 65536);

/// The listen backlog of the listening socket.
const BACKLOG: DefMinMax<u32> = DefMinMax::new(1024, 1, 65535);

//----------- Config ---------------------------------------------------------

/// Configuration for a stream server.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The number of worker threads.
    workers: usize,

    /// Limit on the number of connections waiting for a worker.
    max_queued_connections: usize,

    /// The listen backlog used by [`bind`].
    backlog: u32,

    /// Connection specific configuration.
    connection_config: connection::Config,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Set the number of worker threads.
    ///
    /// Every worker services one connection at a time, so this is also the
    /// limit on concurrently serviced connections. The value has to be
    /// between 1 and 1,024. It defaults to the available hardware
    /// parallelism.
    ///
    /// # Reconfigure
    ///
    /// The worker pool is sized once when the server is created.
    pub fn set_workers(&mut self, value: usize) {
        self.workers = WORKERS.limit(value);
    }

    /// Returns the limit on queued connections.
    pub fn max_queued_connections(&self) -> usize {
        self.max_queued_connections
    }

    /// Set the limit on the number of connections waiting for a worker.
    ///
    /// Connections accepted while the queue is full are closed right away.
    /// The value has to be between zero and 65,536 with a default of 128.
    pub fn set_max_queued_connections(&mut self, value: usize) {
        self.max_queued_connections = MAX_QUEUED_CONNECTIONS.limit(value);
    }

    /// Returns the listen backlog.
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// Set the listen backlog used by [`bind`].
    ///
    /// The value has to be between 1 and 65,535 with a default of 1,024.
    pub fn set_backlog(&mut self, value: u32) {
        self.backlog = BACKLOG.limit(value);
    }

    /// Returns the connection configuration.
    pub fn connection_config(&self) -> &connection::Config {
        &self.connection_config
    }

    /// Set the connection specific configuration.
    pub fn set_connection_config(&mut self, config: connection::Config) {
        self.connection_config = config;
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(WORKERS.default());
        Self {
            workers: WORKERS.limit(workers),
            max_queued_connections: MAX_QUEUED_CONNECTIONS.default(),
            backlog: BACKLOG.default(),
            connection_config: connection::Config::default(),
        }
    }
}

//------------ bind() --------------------------------------------------------

/// Creates a listening socket with the configured backlog.
///
/// Must be called from within a Tokio runtime.
pub fn bind(addr: SocketAddr, config: &Config) -> Result<TcpListener, Error> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(Error::Bind)?;
    socket.set_reuseaddr(true).map_err(Error::Bind)?;
    socket.bind(addr).map_err(Error::Bind)?;
    socket.listen(config.backlog).map_err(Error::Bind)
}

//------------ StreamServer --------------------------------------------------

/// A DNS over TLS server.
///
/// Use [`StreamServer::run`] to start accepting and
/// [`StreamServer::shutdown`] to stop. Once `run` returned, use
/// [`StreamServer::join`] to wait for connections still being serviced.
pub struct StreamServer<Ctx, Svc> {
    /// A receiver for commands sent to the server.
    command_rx: watch::Receiver<ServerCommand>,

    /// A sender for commands to the server.
    command_tx: Arc<Mutex<watch::Sender<ServerCommand>>>,

    /// The listening socket, taken by [`StreamServer::run`].
    listener: Mutex<Option<TcpListener>>,

    /// The address the listening socket is bound to.
    local_addr: SocketAddr,

    /// Creates the TLS session for each accepted connection.
    tls: Ctx,

    /// The service responding to received messages.
    service: Arc<Svc>,

    /// The configuration handed to every connection.
    connection_config: Arc<ArcSwap<connection::Config>>,

    /// The workers servicing connections.
    pool: WorkerPool,

    /// [`ServerMetrics`] describing the status of the server.
    metrics: Arc<ServerMetrics>,
}

/// Creation
///
impl<Ctx, Svc> StreamServer<Ctx, Svc>
where
    Ctx: SessionFactory,
    Svc: Service + Send + Sync + 'static,
{
    /// Creates a server with a default configuration.
    pub fn new(
        listener: TcpListener,
        tls: Ctx,
        service: Svc,
    ) -> Result<Self, Error> {
        Self::with_config(listener, tls, service, Config::default())
    }

    /// Creates a server with the given configuration.
    ///
    /// This starts the worker threads.
    pub fn with_config(
        listener: TcpListener,
        tls: Ctx,
        service: Svc,
        config: Config,
    ) -> Result<Self, Error> {
        let local_addr = listener.local_addr().map_err(Error::Bind)?;
        let (command_tx, command_rx) = watch::channel(ServerCommand::Init);
        let command_tx = Arc::new(Mutex::new(command_tx));
        let metrics = Arc::new(ServerMetrics::new());
        let pool = WorkerPool::new(
            config.workers,
            config.max_queued_connections,
            metrics.clone(),
        )
        .map_err(Error::Pool)?;

        Ok(Self {
            command_rx,
            command_tx,
            listener: Mutex::new(Some(listener)),
            local_addr,
            tls,
            service: Arc::new(service),
            connection_config: Arc::new(ArcSwap::from_pointee(
                config.connection_config,
            )),
            pool,
            metrics,
        })
    }
}

/// Access
///
impl<Ctx, Svc> StreamServer<Ctx, Svc> {
    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the server metrics.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Returns the worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

/// Control
///
impl<Ctx, Svc> StreamServer<Ctx, Svc>
where
    Ctx: SessionFactory,
    Svc: Service + Send + Sync + 'static,
{
    /// Accepts connections until shut down.
    ///
    /// Errors while accepting a connection are logged and do not end the
    /// loop. The listening socket is closed when this returns, so a server
    /// can only be run once.
    pub async fn run(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            warn!("Server was already run");
            return;
        };

        let mut command_rx = self.command_rx.clone();
        info!("Accepting connections on {}", self.local_addr);

        loop {
            tokio::select! {
                biased;

                command_res = command_rx.changed() => {
                    if command_res.is_err() {
                        // All senders are gone, nobody can stop us anymore
                        // the regular way.
                        error!("Server command channel closed");
                        break;
                    }

                    let command = *command_rx.borrow_and_update();
                    match command {
                        ServerCommand::Reconfigure(config) => {
                            debug!("Reconfiguring connections: {config:?}");
                            self.connection_config.store(Arc::new(config));
                        }

                        ServerCommand::Shutdown => break,

                        ServerCommand::Init => {
                            // The initial "Init" value in the watch channel
                            // is never actually seen because changed() only
                            // fires for values sent after it.
                            unreachable!()
                        }
                    }
                }

                accept_res = listener.accept() => {
                    match accept_res {
                        Ok((stream, addr)) => self.dispatch(stream, addr),
                        Err(err) => {
                            warn!("Error while accepting connection: {err}");
                        }
                    }
                }
            }
        }

        drop(listener);
        debug!("Stopped accepting connections");
        self.pool.shutdown();
    }

    /// Hands an accepted connection to the worker pool.
    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        trace!(%addr, "Accepted connection");

        let tls = match self.tls.create() {
            Ok(tls) => tls,
            Err(err) => {
                error!(%addr, "Unable to create TLS session: {err}");
                return;
            }
        };

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%addr, "Unable to detach socket: {err}");
                return;
            }
        };

        let max_message_size =
            self.connection_config.load().max_message_size();
        let job = ConnectionJob::new(
            stream,
            addr,
            Session::new(tls, max_message_size),
            self.service.clone(),
            self.connection_config.clone(),
            self.metrics.clone(),
        );

        if let Err(err) = self.pool.submit(Box::new(job)) {
            warn!(%addr, "Rejecting connection: {err}");
        }
    }
}

impl<Ctx, Svc> StreamServer<Ctx, Svc> {
    /// Stops accepting connections.
    ///
    /// Connections already accepted are serviced until they end on their
    /// own. Connections still waiting for a worker are closed.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.send_command(ServerCommand::Shutdown)
    }

    /// Replaces the configuration of all connections.
    ///
    /// See the setters of [`connection::Config`] for when each setting
    /// takes effect.
    pub fn reconfigure(&self, config: connection::Config) -> Result<(), Error> {
        self.send_command(ServerCommand::Reconfigure(config))
    }

    /// Waits for all connections to end.
    ///
    /// This blocks the calling thread and only returns after the server
    /// was shut down.
    pub fn join(&self) {
        self.pool.join();
    }

    fn send_command(&self, command: ServerCommand) -> Result<(), Error> {
        self.command_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(command)
            .map_err(|_| Error::CommandCouldNotBeSent)
    }
}

//--- Drop

impl<Ctx, Svc> Drop for StreamServer<Ctx, Svc> {
    fn drop(&mut self) {
        // The pool shuts itself down when dropped.
        let _ = self.shutdown();
    }
}

//============ Testing =======================================================
