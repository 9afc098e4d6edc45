//! Lookup of the external application/job aggregate that decides who is a
//! party to a call. The CRUD service owns this data; the relay only reads it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The slice of the application aggregate the relay cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationAggregate {
    pub candidate_id: String,
    pub employer_id: String,
    #[serde(default)]
    pub team_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait ApplicationDirectory: Send + Sync {
    /// `Ok(None)` means the aggregate does not exist; errors mean the
    /// directory itself was unreachable.
    async fn lookup(&self, call_id: &str)
        -> Result<Option<ApplicationAggregate>, DirectoryError>;
}

/// HTTP client against the job-board CRUD service. Request-level timeout so
/// a slow directory cannot stall a join indefinitely.
pub struct HttpDirectory {
    base_url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpDirectory {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            client,
            bearer_token,
        }
    }
}

#[async_trait]
impl ApplicationDirectory for HttpDirectory {
    async fn lookup(
        &self,
        call_id: &str,
    ) -> Result<Option<ApplicationAggregate>, DirectoryError> {
        let url = format!(
            "{}/applications/{}/participants",
            self.base_url.trim_end_matches('/'),
            call_id
        );
        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(Some(response.json::<ApplicationAggregate>().await?))
    }
}

/// Fixed in-memory directory for tests and single-box development.
#[derive(Default)]
pub struct StaticDirectory {
    entries: HashMap<String, ApplicationAggregate>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(mut self, call_id: impl Into<String>, aggregate: ApplicationAggregate) -> Self {
        self.entries.insert(call_id.into(), aggregate);
        self
    }
}

#[async_trait]
impl ApplicationDirectory for StaticDirectory {
    async fn lookup(
        &self,
        call_id: &str,
    ) -> Result<Option<ApplicationAggregate>, DirectoryError> {
        Ok(self.entries.get(call_id).cloned())
    }
}
