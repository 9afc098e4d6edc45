//! ICE server resolution with a time-bounded fallback chain.
//!
//! Order: relay-server proxy (holds provider secrets), then the provider
//! directly when a client-visible key is configured, then the static list
//! from deployment config. Each network step is bounded by a per-step
//! timeout and a miss advances the chain instead of blocking. Successful
//! network fetches are cached for a short TTL to bound provider load.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Public reflexive-only server used when nothing else is configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// One relay/reflexive server descriptor, with optional access credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn default_stun() -> Self {
        Self::stun(DEFAULT_STUN_URL)
    }
}

#[derive(Debug, Error)]
pub enum IceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("fetch timed out")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct IceResolverConfig {
    /// Relay-server proxy endpoint (`GET /ice`), the preferred path.
    pub proxy_url: Option<String>,
    /// Direct provider endpoint; only used when a client-visible key is
    /// also configured.
    pub provider_url: Option<String>,
    pub provider_key: Option<String>,
    /// Deployment-configured fallback list.
    pub static_servers: Vec<IceServer>,
    pub step_timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for IceResolverConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            provider_url: None,
            provider_key: None,
            static_servers: Vec::new(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

struct CachedServers {
    servers: Vec<IceServer>,
    fetched_at: Instant,
}

impl CachedServers {
    fn stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

/// Provider responses come in both snake and camel case in the wild.
#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(alias = "iceServers")]
    ice_servers: Vec<IceServer>,
}

pub struct IceResolver {
    config: IceResolverConfig,
    client: reqwest::Client,
    cache: Mutex<Option<CachedServers>>,
}

impl IceResolver {
    pub fn new(config: IceResolverConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }

    /// Resolve the prioritized server list. Infallible: the chain bottoms
    /// out at the static list, or the public default when that is empty too.
    pub async fn resolve(&self) -> Vec<IceServer> {
        if let Some(cached) = self.cached() {
            return cached;
        }

        if let Some(proxy_url) = self.config.proxy_url.clone() {
            match self.bounded_fetch(self.fetch_proxy(&proxy_url)).await {
                Ok(servers) if !servers.is_empty() => {
                    return self.store(servers);
                }
                Ok(_) => debug!("ice proxy returned an empty list; advancing"),
                Err(err) => warn!(error = %err, "ice proxy fetch failed; advancing"),
            }
        }

        if let (Some(provider_url), Some(key)) = (
            self.config.provider_url.clone(),
            self.config.provider_key.clone(),
        ) {
            match self
                .bounded_fetch(self.fetch_provider(&provider_url, &key))
                .await
            {
                Ok(servers) if !servers.is_empty() => {
                    return self.store(servers);
                }
                Ok(_) => debug!("ice provider returned an empty list; advancing"),
                Err(err) => warn!(error = %err, "ice provider fetch failed; advancing"),
            }
        }

        if self.config.static_servers.is_empty() {
            vec![IceServer::default_stun()]
        } else {
            self.config.static_servers.clone()
        }
    }

    fn cached(&self) -> Option<Vec<IceServer>> {
        let guard = self.cache.lock();
        guard
            .as_ref()
            .filter(|cached| !cached.stale(self.config.cache_ttl))
            .map(|cached| cached.servers.clone())
    }

    fn store(&self, servers: Vec<IceServer>) -> Vec<IceServer> {
        *self.cache.lock() = Some(CachedServers {
            servers: servers.clone(),
            fetched_at: Instant::now(),
        });
        servers
    }

    async fn bounded_fetch<F>(&self, fetch: F) -> Result<Vec<IceServer>, IceError>
    where
        F: std::future::Future<Output = Result<Vec<IceServer>, IceError>>,
    {
        match tokio::time::timeout(self.config.step_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(IceError::Timeout),
        }
    }

    async fn fetch_proxy(&self, url: &str) -> Result<Vec<IceServer>, IceError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(IceError::Status(response.status().as_u16()));
        }
        Ok(response.json::<Vec<IceServer>>().await?)
    }

    async fn fetch_provider(&self, url: &str, key: &str) -> Result<Vec<IceServer>, IceError> {
        let response = self
            .client
            .get(url)
            .query(&[("key", key)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IceError::Status(response.status().as_u16()));
        }
        Ok(response.json::<ProviderResponse>().await?.ice_servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Tiny one-shot HTTP server: answers every connection with `body` and
    /// counts hits.
    async fn serve_json(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ok");
        let addr = listener.local_addr().expect("addr ok");
        let hits = Arc::new(AtomicUsize::new(0));
        let task_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                task_hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{addr}/ice"), hits)
    }

    /// Accepts connections but never answers, to exercise the step timeout.
    async fn serve_black_hole() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ok");
        let addr = listener.local_addr().expect("addr ok");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("http://{addr}/ice")
    }

    fn static_server() -> IceServer {
        IceServer {
            urls: vec!["turn:turn.internal:3478".into()],
            username: Some("user".into()),
            credential: Some("pass".into()),
        }
    }

    #[tokio::test]
    async fn nothing_configured_yields_public_stun() {
        let resolver = IceResolver::new(IceResolverConfig::default());
        assert_eq!(resolver.resolve().await, vec![IceServer::default_stun()]);
    }

    #[tokio::test]
    async fn proxy_failure_falls_back_to_static_within_timeout_bound() {
        let proxy_url = serve_black_hole().await;
        let step_timeout = Duration::from_millis(200);
        let resolver = IceResolver::new(IceResolverConfig {
            proxy_url: Some(proxy_url),
            static_servers: vec![static_server()],
            step_timeout,
            ..Default::default()
        });

        let started = Instant::now();
        let servers = resolver.resolve().await;
        assert_eq!(servers, vec![static_server()]);
        assert!(started.elapsed() < step_timeout * 2);
    }

    #[tokio::test]
    async fn proxy_success_is_cached_for_ttl() {
        let (proxy_url, hits) =
            serve_json(r#"[{"urls":["turn:proxy.example:3478"],"username":"u","credential":"c"}]"#)
                .await;
        let resolver = IceResolver::new(IceResolverConfig {
            proxy_url: Some(proxy_url),
            cache_ttl: Duration::from_secs(30),
            ..Default::default()
        });

        let first = resolver.resolve().await;
        assert_eq!(first[0].urls, vec!["turn:proxy.example:3478".to_string()]);
        let second = resolver.resolve().await;
        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_is_skipped_without_key() {
        let (provider_url, hits) = serve_json(r#"{"ice_servers":[]}"#).await;
        let resolver = IceResolver::new(IceResolverConfig {
            provider_url: Some(provider_url),
            provider_key: None,
            static_servers: vec![static_server()],
            ..Default::default()
        });

        assert_eq!(resolver.resolve().await, vec![static_server()]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_path_parses_camel_case_payloads() {
        let (provider_url, _hits) = serve_json(
            r#"{"iceServers":[{"urls":["turn:provider.example:443?transport=tcp"],"username":"u","credential":"c"}]}"#,
        )
        .await;
        let resolver = IceResolver::new(IceResolverConfig {
            provider_url: Some(provider_url),
            provider_key: Some("client-key".into()),
            ..Default::default()
        });

        let servers = resolver.resolve().await;
        assert_eq!(
            servers[0].urls,
            vec!["turn:provider.example:443?transport=tcp".to_string()]
        );
    }
}
