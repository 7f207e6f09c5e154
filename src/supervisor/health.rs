//! Readiness probe for the Studio server
//!
//! `GET <base_url>/health`; any 2xx within [`PROBE_TIMEOUT`] counts as ready.
//! Connection errors and timeouts are ordinary failed rounds.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::trace;

/// Per-attempt timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, base_url: &'a str) -> ProbeFuture<'a>;
}

/// Base URL for a server on `port`
pub fn base_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

/// HTTP probe backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, base_url: &'a str) -> ProbeFuture<'a> {
        Box::pin(async move {
            let url = format!("{base_url}/health");
            match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
                Ok(response) => {
                    let status = response.status();
                    trace!(%url, %status, "health probe");
                    status.is_success()
                }
                Err(e) => {
                    trace!(%url, "health probe failed: {}", e);
                    false
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_uses_localhost() {
        assert_eq!(base_url(4983), "http://localhost:4983");
    }
}
