//! A DNS over TLS server answering every query with NOTIMP.
//!
//! Useful for checking that clients can connect and that framing and TLS
//! work end to end. Plug a real [`Service`] into [`StreamServer`] to build
//! an actual name server.
//!
//! [`Service`]: dotserve::net::server::service::Service
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dotserve::net::server::connection;
use dotserve::net::server::error::Error;
use dotserve::net::server::stream::{self, StreamServer};
use dotserve::net::server::tls::{PlainContext, RustlsContext, SessionFactory};
use dotserve::net::server::util::notimp_service;

#[derive(Parser)]
#[command(name = "dotserve")]
#[command(version)]
#[command(about = "DNS over TLS server answering every query with NOTIMP")]
struct Cli {
    /// Address to listen on
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 853)]
    port: u16,

    /// PEM file with the certificate chain
    #[arg(long, value_name = "FILE", default_value = "server.crt")]
    cert: PathBuf,

    /// PEM file with the private key
    #[arg(long, value_name = "FILE", default_value = "server.key")]
    key: PathBuf,

    /// Serve DNS over plain TCP instead of TLS
    #[arg(long)]
    plain: bool,

    /// Number of worker threads [default: available parallelism]
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Number of accepted connections that may wait for a worker
    #[arg(long)]
    max_queued: Option<usize>,

    /// Read timeout in milliseconds
    #[arg(long, value_name = "MS")]
    read_timeout: Option<u64>,

    /// Write timeout in milliseconds
    #[arg(long, value_name = "MS")]
    write_timeout: Option<u64>,

    /// Largest accepted message size
    #[arg(long)]
    max_message_size: Option<u16>,
}

impl Cli {
    fn config(&self) -> stream::Config {
        let mut conn_config = connection::Config::new();
        if let Some(ms) = self.read_timeout {
            conn_config.set_read_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.write_timeout {
            conn_config.set_write_timeout(Duration::from_millis(ms));
        }
        if let Some(size) = self.max_message_size {
            conn_config.set_max_message_size(size);
        }

        let mut config = stream::Config::new();
        if let Some(workers) = self.workers {
            config.set_workers(workers);
        }
        if let Some(max_queued) = self.max_queued {
            config.set_max_queued_connections(max_queued);
        }
        config.set_connection_config(conn_config);
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();
    let res = if cli.plain {
        serve(&cli, PlainContext).await
    } else {
        match RustlsContext::from_pem_files(&cli.cert, &cli.key) {
            Ok(ctx) => serve(&cli, ctx).await,
            Err(err) => Err(err.into()),
        }
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn serve<Ctx>(cli: &Cli, ctx: Ctx) -> Result<(), Error>
where
    Ctx: SessionFactory + Send + Sync + 'static,
{
    let config = cli.config();
    let addr = SocketAddr::new(cli.listen, cli.port);
    let listener = stream::bind(addr, &config)?;
    let srv = Arc::new(StreamServer::with_config(
        listener,
        ctx,
        notimp_service(),
        config,
    )?);
    info!(
        "Serving DNS over {} on {} with {} workers and a queue of {}",
        if cli.plain { "TCP" } else { "TLS" },
        srv.local_addr(),
        srv.pool().num_workers(),
        srv.pool().queue_capacity()
    );

    let run = tokio::spawn({
        let srv = srv.clone();
        async move { srv.run().await }
    });

    shutdown_signal().await;
    info!("Shutting down");
    srv.shutdown()?;
    if let Err(err) = run.await {
        error!("Accept loop failed: {err}");
    }

    // Connections still in progress end via their own timeouts.
    let metrics = srv.metrics();
    let joined = tokio::task::spawn_blocking({
        let srv = srv.clone();
        move || srv.join()
    })
    .await;
    if let Err(err) = joined {
        error!("Unable to wait for workers: {err}");
    }

    info!(
        received = metrics.num_received_messages(),
        sent = metrics.num_sent_responses(),
        rejected = metrics.num_rejected_connections(),
        faulted = metrics.num_faulted_connections(),
        "Server stopped"
    );
    Ok(())
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
