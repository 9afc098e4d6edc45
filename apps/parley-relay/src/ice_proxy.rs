//! Server-side ICE configuration endpoint.
//!
//! Clients that cannot hold provider credentials fetch their ICE servers
//! from here; the provider secret never leaves the relay. Responses are
//! cached briefly so a burst of joins does not hammer the provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use parking_lot::RwLock;
use parley_call::ice::IceServer;
use serde::Deserialize;
use tracing::warn;

const PROVIDER_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(alias = "iceServers")]
    ice_servers: Vec<IceServer>,
}

pub struct IceProxyState {
    provider_url: Option<String>,
    provider_secret: Option<String>,
    static_servers: Vec<IceServer>,
    cache_ttl: Duration,
    client: reqwest::Client,
    cache: RwLock<Option<(Instant, Vec<IceServer>)>>,
}

impl IceProxyState {
    pub fn new(
        provider_url: Option<String>,
        provider_secret: Option<String>,
        static_servers: Vec<IceServer>,
        cache_ttl: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            provider_url,
            provider_secret,
            static_servers,
            cache_ttl,
            client,
            cache: RwLock::new(None),
        }
    }

    /// Provider, then static configuration, then a public STUN server.
    /// Never fails: a degraded answer beats no answer.
    pub async fn resolve(&self) -> Vec<IceServer> {
        if let Some(cached) = self.cached() {
            return cached;
        }
        if let Some(url) = &self.provider_url {
            match self.fetch_provider(url).await {
                Ok(servers) if !servers.is_empty() => {
                    *self.cache.write() = Some((Instant::now(), servers.clone()));
                    return servers;
                }
                Ok(_) => warn!("ice provider returned no servers"),
                Err(err) => warn!(error = %err, "ice provider fetch failed"),
            }
        }
        if !self.static_servers.is_empty() {
            return self.static_servers.clone();
        }
        vec![IceServer::default_stun()]
    }

    fn cached(&self) -> Option<Vec<IceServer>> {
        let cache = self.cache.read();
        let (fetched_at, servers) = cache.as_ref()?;
        (fetched_at.elapsed() < self.cache_ttl).then(|| servers.clone())
    }

    async fn fetch_provider(&self, url: &str) -> Result<Vec<IceServer>, reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(secret) = &self.provider_secret {
            request = request.bearer_auth(secret);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json::<ProviderResponse>().await?.ice_servers)
    }
}

pub async fn ice_handler(State(state): State<Arc<IceProxyState>>) -> Json<Vec<IceServer>> {
    Json(state.resolve().await)
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
