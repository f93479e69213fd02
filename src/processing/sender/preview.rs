use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PREVIEW_SIZE: usize = 10 * 1024 * 1024;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait PreviewLoader: Send + Sync {
    /// First preview url that answers a HEAD request with 2xx.
    async fn find_available(&self, urls: &[String]) -> Option<String>;

    async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

pub(crate) struct HttpPreviewLoader {
    client: Client,
}

impl HttpPreviewLoader {
    pub(crate) fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        })
    }
}

#[async_trait]
impl PreviewLoader for HttpPreviewLoader {
    async fn find_available(&self, urls: &[String]) -> Option<String> {
        for url in urls {
            match self.client.head(url).send().await {
                Ok(response) if response.status().is_success() => return Some(url.clone()),
                Ok(response) => log::debug!("Preview {} answered {}", url, response.status()),
                Err(e) => log::debug!("Preview {} is unavailable: {}", url, e),
            }
        }
        None
    }

    async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        if let Some(length) = response.content_length() {
            if length as usize > MAX_PREVIEW_SIZE {
                anyhow::bail!("preview {} is too large: {} bytes", url, length);
            }
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_PREVIEW_SIZE {
                anyhow::bail!("preview {} exceeds {} bytes", url, MAX_PREVIEW_SIZE);
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}
