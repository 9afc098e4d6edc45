mod cli;
mod config;
mod directory;
mod ice_proxy;
mod identity;
mod policy;
mod registry;
mod relay;
mod signaling;
mod websocket;

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{Config, DEFAULT_TOKEN_SECRET};
use crate::directory::{ApplicationDirectory, HttpDirectory, StaticDirectory};
use crate::ice_proxy::IceProxyState;
use crate::identity::IdentityVerifier;
use crate::policy::AccessPolicy;
use crate::registry::ConnectionRegistry;
use crate::relay::RelayState;
use crate::websocket::WsState;

const DIRECTORY_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Some(Commands::Probe {
        url,
        token,
        call,
        watch_secs,
    }) = cli.command
    {
        return cli::run_probe(&url, &token, &call, watch_secs).await;
    }

    let config = Config::from_env();
    if config.token_secret == DEFAULT_TOKEN_SECRET {
        warn!("PARLEY_TOKEN_SECRET not set; using the insecure development secret");
    }

    // Degrades to the in-memory bus when Redis is absent or unreachable.
    let bus = room_bus::connect(config.redis_url.as_deref(), config.bus_connect_timeout).await;

    let directory: Arc<dyn ApplicationDirectory> = match &config.directory_url {
        Some(url) => Arc::new(HttpDirectory::new(
            url.clone(),
            config.directory_token.clone(),
            DIRECTORY_REQUEST_TIMEOUT,
        )),
        None => {
            warn!("DIRECTORY_URL not set; every join will be rejected as not-found");
            Arc::new(StaticDirectory::new())
        }
    };

    let relay = Arc::new(RelayState::new(
        Arc::new(ConnectionRegistry::new()),
        bus,
        Arc::new(AccessPolicy::new(directory)),
    ));
    websocket::spawn_heartbeat_monitor(relay.clone(), config.heartbeat_timeout);

    let ws_state = Arc::new(WsState {
        relay,
        verifier: IdentityVerifier::new(
            &config.token_secret,
            config.token_issuer.as_deref(),
            config.token_audience.as_deref(),
        ),
    });
    let ice_state = Arc::new(IceProxyState::new(
        config.ice_provider_url.clone(),
        config.ice_provider_secret.clone(),
        config.ice_static_servers.clone(),
        config.ice_cache_ttl,
    ));

    let app = Router::new()
        .route("/health", get(ice_proxy::health_check))
        .route("/ice", get(ice_proxy::ice_handler).with_state(ice_state))
        .route("/ws", get(websocket::ws_handler).with_state(ws_state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "parley relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
