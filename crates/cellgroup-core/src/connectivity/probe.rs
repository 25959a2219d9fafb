use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Reachability check failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Answers "can the backend be reached right now?".
///
/// `Ok(false)` means the network is down; `Err` means the check itself
/// could not be carried out and says nothing about the network.
pub trait ReachabilityProbe: Send + Sync {
    fn check(&self) -> BoxFuture<'_, Result<bool, ProbeError>>;
}

/// Probe that issues a HEAD request against a health URL. Any HTTP response,
/// including an error status, proves the server is reachable.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn head(&self) -> Result<bool, ProbeError> {
        match self.client.head(&self.url).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl ReachabilityProbe for HttpProbe {
    fn check(&self) -> BoxFuture<'_, Result<bool, ProbeError>> {
        Box::pin(self.head())
    }
}
