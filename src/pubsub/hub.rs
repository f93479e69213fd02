use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::api::Api;
use crate::config::PubSubConfig;
use crate::pubsub::{signature, topic_url};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    fn as_str(&self) -> &'static str {
        match self {
            HubMode::Subscribe => "subscribe",
            HubMode::Unsubscribe => "unsubscribe",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait Hub: Send + Sync {
    /// Sends a (un)subscribe request for a namespaced channel id.
    async fn request(&self, mode: HubMode, channel_id: &str) -> anyhow::Result<()>;
}

pub(crate) struct HubClient {
    client: Client,
    hub_url: String,
    callback_url: String,
    secret: Option<String>,
    lease_seconds: i64,
}

impl HubClient {
    pub(crate) fn new(config: &PubSubConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            hub_url: config.hub_url.clone(),
            callback_url: config.callback_url.clone(),
            secret: config.secret.clone(),
            lease_seconds: config.lease_seconds,
        })
    }
}

#[async_trait]
impl Hub for HubClient {
    async fn request(&self, mode: HubMode, channel_id: &str) -> anyhow::Result<()> {
        let topic = topic_url(Api::Youtube.unwrap_id(channel_id)?);
        let mut form = vec![
            ("hub.callback", self.callback_url.clone()),
            ("hub.mode", mode.as_str().to_string()),
            ("hub.topic", topic.clone()),
            ("hub.verify", "async".to_string()),
        ];
        if mode == HubMode::Subscribe {
            form.push(("hub.lease_seconds", self.lease_seconds.to_string()));
        }
        if let Some(secret) = &self.secret {
            form.push(("hub.secret", signature::topic_secret(secret, &topic)?));
        }

        let response = self.client.post(&self.hub_url).form(&form).send().await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow::anyhow!(
                    "Hub {} of {} failed with {}: {}",
                    mode.as_str(),
                    channel_id,
                    status,
                    body.chars().take(256).collect::<String>()
                ))
            }
        }
    }
}
