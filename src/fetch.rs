//! Latent retrieval over HTTP(S).

use reqwest::Client;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tensor::{Latent, LatentFormat};

/// Fetches latent files by URL with a fixed per-request timeout. No retries.
pub struct LatentFetcher {
    client: Client,
    timeout: Duration,
}

impl LatentFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// Download the full body. Non-2xx responses, timeouts, and connection
    /// failures are all [`Error::Fetch`].
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let fetch_err = |source| Error::Fetch {
            url: url.to_string(),
            source,
        };

        let mut resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(fetch_err)?
            .error_for_status()
            .map_err(fetch_err)?;

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(fetch_err)? {
            body.extend_from_slice(&chunk);
        }
        log::debug!("Fetched {} bytes from {url}", body.len());
        Ok(body)
    }

    /// Download and decode a latent.
    pub async fn fetch_latent(&self, url: &str) -> Result<Latent> {
        let body = self.fetch_bytes(url).await?;
        decode_fetched(url, &body)
    }
}

/// Decode a downloaded body, choosing the format by substring match on the URL.
///
/// URLs naming no known extension are attempted as a binary tensor container.
pub fn decode_fetched(url: &str, body: &[u8]) -> Result<Latent> {
    let tensor = match LatentFormat::sniff_url(url) {
        Some(format) => format.decode(body)?,
        None => LatentFormat::Container
            .decode(body)
            .map_err(|e| Error::format_with(format!("Unknown latent extension '{url}'"), e))?,
    };
    Latent::new(tensor)
}
