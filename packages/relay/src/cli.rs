use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent_relay_upstream::{UpstreamClient, UpstreamConfig};

use crate::clock::SystemClock;
use crate::hub::{SessionHub, UpstreamCommands};
use crate::ingest::Ingester;
use crate::router::{build_router, AppState, AuthConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4180;

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay")]
#[command(about = "Session-state relay for OpenCode-compatible agent servers", version)]
#[command(arg_required_else_help = true)]
pub struct AgentRelayCli {
    #[command(subcommand)]
    command: Command,

    /// Token downstream clients must present.
    #[arg(long, short = 't', global = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base URL of the upstream agent server, e.g. http://127.0.0.1:4096.
    #[arg(long = "upstream-url", short = 'u')]
    upstream_url: String,

    /// Bearer token for the upstream, when it requires one.
    #[arg(long = "upstream-token")]
    upstream_token: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_relay() -> Result<(), CliError> {
    let cli = AgentRelayCli::parse();
    init_logging();
    match &cli.command {
        Command::Server(args) => run_server(cli.token.clone(), args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(token: Option<String>, server: &ServerArgs) -> Result<(), CliError> {
    let auth = token
        .map(AuthConfig::with_token)
        .unwrap_or_else(AuthConfig::disabled);
    let cors = build_cors_layer(server)?;

    let upstream = UpstreamClient::new(UpstreamConfig {
        base_url: server.upstream_url.clone(),
        token: server.upstream_token.clone(),
    });

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        if let Err(err) = upstream.wait_for_health().await {
            tracing::warn!(error = %err, "upstream not healthy yet; the feed reader keeps retrying");
        }

        let commands: Arc<dyn UpstreamCommands> = Arc::new(upstream.clone());
        let hub = Arc::new(SessionHub::new(commands, Arc::new(SystemClock)));
        let ingester = Arc::new(Ingester::new(upstream, hub.clone()));
        ingester.spawn();

        let router = build_router(AppState::new(auth, hub)).layer(cors);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, upstream = %server.upstream_url, "relay listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    Ok(cors)
}
