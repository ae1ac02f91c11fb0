// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Error};
use clap::Parser;
use crowddetector_signalling::handlers::Handler;
use crowddetector_signalling::media::{CrowdDetectorConfig, MediaServer};
use crowddetector_signalling::server::{Server, ServerError};
use crowddetector_signalling::session::SessionManager;
use std::path::PathBuf;
use std::time::Duration;
use tokio::{net::TcpListener, task};
use tokio_native_tls::native_tls;
use tokio_native_tls::TlsAcceptor;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[clap(about, version, author)]
/// Program arguments
struct Args {
    /// Address to listen on
    #[clap(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value_t = 8443)]
    port: u16,
    /// TLS certificate to use, PEM encoded
    #[clap(short, long)]
    cert: Option<String>,
    /// Private key to use, PEM encoded PKCS#8
    #[clap(short, long)]
    key: Option<String>,
    /// Media server websocket URI
    #[clap(long, default_value = "ws://localhost:8888/kurento")]
    ws_uri: String,
    /// JSON file with the crowd detector regions of interest
    #[clap(long)]
    filter_config: Option<PathBuf>,
}

fn initialize_logging(envvar_name: &str) -> Result<(), Error> {
    tracing_log::LogTracer::init()?;
    let env_filter = tracing_subscriber::EnvFilter::try_from_env(envvar_name)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_target(true)
        .with_span_events(
            tracing_subscriber::fmt::format::FmtSpan::NEW
                | tracing_subscriber::fmt::format::FmtSpan::CLOSE,
        );
    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    initialize_logging("CROWDDETECTOR_SIGNALLING_SERVER_LOG")?;

    let filter_config = match args.filter_config {
        Some(ref path) => CrowdDetectorConfig::from_file(path)
            .with_context(|| format!("Failed to load filter config {}", path.display()))?,
        None => CrowdDetectorConfig::default(),
    };

    // Nothing is dialed until the first session starts
    let sessions = SessionManager::new(MediaServer::new(args.ws_uri.clone()), filter_config);
    let server = Server::spawn(move |stream| Handler::new(sessions, stream));

    let addr = format!("{}:{}", args.host, args.port);

    let listener = TcpListener::bind(&addr).await?;

    let acceptor = if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        Some(create_tls_acceptor(cert, key).await?)
    } else {
        None
    };

    info!(media_server = %args.ws_uri, "Listening on: {}", addr);

    while let Ok((stream, address)) = listener.accept().await {
        let mut server_clone = server.clone();
        info!("Accepting connection from {}", address);

        if let Some(acceptor) = acceptor.clone() {
            tokio::spawn(async move {
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(stream)) => server_clone.accept_async(stream).await,
                    Ok(Err(err)) => {
                        warn!("Failed to accept TLS connection from {}: {}", address, err);
                        Err(ServerError::TLSHandshake(err))
                    }
                    Err(elapsed) => {
                        warn!("TLS connection timed out {} after {}", address, elapsed);
                        Err(ServerError::TLSHandshakeTimeout(elapsed))
                    }
                }
            });
        } else {
            task::spawn(async move { server_clone.accept_async(stream).await });
        }
    }

    Ok(())
}

async fn create_tls_acceptor(
    certificate_file: &str,
    private_key_file: &str,
) -> Result<TlsAcceptor, Error> {
    let cert = tokio::fs::read(certificate_file)
        .await
        .with_context(|| format!("Failed to read certificate {certificate_file}"))?;
    let key = tokio::fs::read(private_key_file)
        .await
        .with_context(|| format!("Failed to read private key {private_key_file}"))?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
    let acceptor = native_tls::TlsAcceptor::builder(identity).build()?;

    Ok(TlsAcceptor::from(acceptor))
}
