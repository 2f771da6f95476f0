use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::{ChallengeSolver, Clearance, SolveError};

/// Settings for [`RemoteSolver`].
#[derive(Debug, Clone)]
pub struct RemoteSolverConfig {
    /// Base URL of the browser-automation service.
    pub base_url: Url,
    /// Attempts the service should spend on one challenge.
    pub retries: u8,
    pub request_timeout: Duration,
}

impl RemoteSolverConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            retries: 5,
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct CookiePayload {
    cookies: BTreeMap<String, String>,
    user_agent: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    detail: String,
}

/// Solver backed by an external service exposing `GET /cookies`.
#[derive(Debug, Clone)]
pub struct RemoteSolver {
    client: Client,
    config: RemoteSolverConfig,
}

impl RemoteSolver {
    pub fn new(config: RemoteSolverConfig) -> Result<Self, SolveError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| SolveError::Transport(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RemoteSolverConfig {
        &self.config
    }

    fn request_url(&self, origin: &Url, proxy: Option<&str>) -> Result<Url, SolveError> {
        let mut url = self
            .config
            .base_url
            .join("cookies")
            .map_err(|err| SolveError::Transport(format!("invalid solver base url: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("url", origin.as_str());
            query.append_pair("retries", &self.config.retries.to_string());
            if let Some(proxy) = proxy {
                query.append_pair("proxy", proxy);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ChallengeSolver for RemoteSolver {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn solve(&self, origin: &Url, proxy: Option<&str>) -> Result<Clearance, SolveError> {
        let url = self.request_url(origin, proxy)?;
        log::debug!("requesting clearance for {origin} from {}", self.config.base_url);

        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                SolveError::Timeout(self.config.request_timeout)
            } else {
                SolveError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| SolveError::Transport(err.to_string()))?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<ErrorPayload>(&body)
                .map(|payload| payload.detail)
                .unwrap_or_else(|_| format!("solver service answered {status}"));
            return Err(SolveError::Rejected(detail));
        }

        let payload: CookiePayload = serde_json::from_slice(&body)
            .map_err(|err| SolveError::InvalidResponse(err.to_string()))?;
        if payload.cookies.is_empty() {
            return Err(SolveError::Empty);
        }
        Ok(Clearance::new(payload.cookies, payload.user_agent))
    }
}
