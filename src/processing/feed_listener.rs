use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};

use crate::api::Api;
use crate::common::debounce::Trigger;
use crate::common::limiter::OneLimit;
use crate::config::PubSubConfig;
use crate::database::{ChannelFeedUpdate, Database, YtPubSubFeed};
use crate::pubsub::feed_parser::{parse_feed, FeedEntry};
use crate::pubsub::hub::{Hub, HubMode};
use crate::pubsub::{signature, topic_from_link_header};

const RENEW_BATCH_SIZE: usize = 50;
const HUB_CONCURRENCY: usize = 10;
const SIGNATURE_HEADER: &str = "x-hub-signature";

/// A pushed video with namespaced ids.
#[derive(Debug, Clone, PartialEq)]
struct FeedEvent {
    video_id: String,
    channel_id: String,
    published_at: DateTime<Utc>,
}

pub(crate) struct FeedListener {
    db: Arc<dyn Database>,
    hub: Arc<dyn Hub>,
    config: PubSubConfig,
    checker_trigger: Trigger,
    batch_trigger: Trigger,
    buffer: Mutex<Vec<FeedEvent>>,
    limit: OneLimit,
}

impl FeedListener {
    pub(crate) fn new(
        db: Arc<dyn Database>,
        hub: Arc<dyn Hub>,
        config: PubSubConfig,
        checker_trigger: Trigger,
        batch_trigger: Trigger,
    ) -> Self {
        Self {
            db,
            hub,
            config,
            checker_trigger,
            batch_trigger,
            buffer: Mutex::new(Vec::new()),
            limit: OneLimit::new(),
        }
    }

    pub(crate) fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.path, get(verify).post(receive))
            .with_state(self)
    }

    pub(crate) async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&address).await?;
        log::info!("Listening for hub notifications on {}", address);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    fn verify_payload(&self, headers: &HeaderMap, body: &[u8]) -> anyhow::Result<()> {
        let secret = match &self.config.secret {
            Some(secret) => secret,
            None => return Ok(()),
        };
        let topic = headers
            .get(header::LINK)
            .and_then(|value| value.to_str().ok())
            .and_then(topic_from_link_header)
            .ok_or_else(|| anyhow::anyhow!("topic is missing in the Link header"))?;
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| anyhow::anyhow!("signature header is missing"))?;
        let key = signature::topic_secret(secret, topic)?;
        signature::verify_signature(&key, header, body)
    }

    /// Buffers the videos of a pushed feed. Returns how many were buffered.
    pub(crate) fn handle_notification(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> anyhow::Result<usize> {
        self.verify_payload(headers, body)?;
        let xml = std::str::from_utf8(body)?;
        let api = Api::Youtube;

        let mut events = Vec::new();
        for entry in parse_feed(xml)? {
            match entry {
                FeedEntry::Video {
                    video_id,
                    channel_id,
                    published_at,
                } => events.push(FeedEvent {
                    video_id: api.wrap_id(&video_id),
                    channel_id: api.wrap_id(&channel_id),
                    published_at,
                }),
                FeedEntry::Deleted { video_id } => {
                    log::debug!("Video {} was deleted upstream", video_id);
                }
            }
        }

        let count = events.len();
        if count > 0 {
            if let Ok(mut buffer) = self.buffer.lock() {
                buffer.extend(events);
            }
            self.batch_trigger.fire();
        }
        Ok(count)
    }

    /// Persists buffered pushes of tracked channels. Overlapping calls
    /// return immediately.
    pub(crate) async fn process_batch(&self) -> anyhow::Result<()> {
        match self.limit.run(self.process_buffered()).await {
            Some(result) => result,
            None => Ok(()),
        }
    }

    fn take_buffer(&self) -> Vec<FeedEvent> {
        match self.buffer.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(_) => Vec::new(),
        }
    }

    async fn process_buffered(&self) -> anyhow::Result<()> {
        let events = self.take_buffer();
        if events.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.store_events(&events).await {
            if let Ok(mut buffer) = self.buffer.lock() {
                buffer.extend(events);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn store_events(&self, events: &[FeedEvent]) -> anyhow::Result<()> {
        let mut unique: BTreeMap<&str, &FeedEvent> = BTreeMap::new();
        for event in events {
            unique.entry(event.video_id.as_str()).or_insert(event);
        }
        let video_ids: Vec<String> = unique.keys().map(|id| id.to_string()).collect();
        let known: HashSet<String> = self
            .db
            .get_existing_video_ids(&video_ids)
            .await?
            .into_iter()
            .collect();
        let fresh: Vec<&FeedEvent> = unique
            .into_values()
            .filter(|event| !known.contains(&event.video_id))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let mut channel_ids: Vec<String> = fresh.iter().map(|e| e.channel_id.clone()).collect();
        channel_ids.sort();
        channel_ids.dedup();
        let channels: HashMap<String, DateTime<Utc>> = self
            .db
            .get_channels_by_ids(&channel_ids)
            .await?
            .into_iter()
            .map(|channel| (channel.id, channel.last_video_published_at))
            .collect();

        let now = Utc::now();
        let mut oldest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        let mut feeds = Vec::new();
        for event in fresh {
            if !channels.contains_key(&event.channel_id) {
                log::debug!("Skipping push for untracked channel {}", event.channel_id);
                continue;
            }
            oldest
                .entry(event.channel_id.as_str())
                .and_modify(|date| *date = (*date).min(event.published_at))
                .or_insert(event.published_at);
            feeds.push(YtPubSubFeed {
                id: event.video_id.clone(),
                channel_id: event.channel_id.clone(),
                published_at: event.published_at,
                created_at: now,
            });
        }
        if feeds.is_empty() {
            return Ok(());
        }

        let updates: Vec<ChannelFeedUpdate> = oldest
            .into_iter()
            .map(|(channel_id, published_at)| {
                let last_video_published_at = channels
                    .get(channel_id)
                    .filter(|last| **last > published_at)
                    .map(|_| published_at - Duration::seconds(1));
                ChannelFeedUpdate {
                    id: channel_id.to_string(),
                    last_video_published_at,
                }
            })
            .collect();

        self.db.put_feeds(&feeds, &updates).await?;
        log::info!(
            "Stored {} pushed videos for {} channels",
            feeds.len(),
            updates.len()
        );
        self.checker_trigger.fire();
        Ok(())
    }

    /// Renews hub subscriptions that expire soon.
    pub(crate) async fn renew_subscriptions(&self) -> anyhow::Result<()> {
        loop {
            let now = Utc::now();
            let channels = self
                .db
                .claim_channels_for_subscription(
                    RENEW_BATCH_SIZE,
                    now,
                    now + self.config.renew_lead,
                    now + self.config.renew_lease,
                )
                .await?;
            if channels.is_empty() {
                return Ok(());
            }

            let results: Vec<(String, anyhow::Result<()>)> = stream::iter(channels)
                .map(|channel| async move {
                    let result = self.hub.request(HubMode::Subscribe, &channel.id).await;
                    (channel.id, result)
                })
                .buffer_unordered(HUB_CONCURRENCY)
                .collect()
                .await;

            let expires_at = now + Duration::seconds(self.config.lease_seconds);
            for (channel_id, result) in results {
                match result {
                    Ok(()) => {
                        self.db
                            .set_channel_subscription(&channel_id, expires_at)
                            .await?
                    }
                    Err(e) => log::error!("Failed to subscribe to {}: {:#}", channel_id, e),
                }
            }
        }
    }

    /// Best effort, the hub drops the topic once the lease runs out anyway.
    pub(crate) async fn unsubscribe_channels(&self, channel_ids: &[String]) {
        stream::iter(channel_ids)
            .for_each_concurrent(HUB_CONCURRENCY, |channel_id| async move {
                if let Err(e) = self.hub.request(HubMode::Unsubscribe, channel_id).await {
                    log::warn!("Failed to unsubscribe from {}: {:#}", channel_id, e);
                }
            })
            .await;
    }

    pub(crate) async fn clean_feeds(&self) -> anyhow::Result<()> {
        let removed = self
            .db
            .remove_feeds_older_than(Utc::now() - self.config.feed_retention)
            .await?;
        log::debug!("Removed {} push feed records", removed);
        Ok(())
    }
}

async fn verify(Query(params): Query<HashMap<String, String>>) -> (StatusCode, String) {
    let (mode, topic) = match (params.get("hub.mode"), params.get("hub.topic")) {
        (Some(mode), Some(topic)) => (mode, topic),
        _ => return (StatusCode::BAD_REQUEST, String::new()),
    };
    if mode == "denied" {
        log::warn!(
            "Hub denied subscription to {}: {}",
            topic,
            params.get("hub.reason").map(String::as_str).unwrap_or("-")
        );
        return (StatusCode::OK, String::new());
    }
    match params.get("hub.challenge") {
        Some(challenge) => {
            log::debug!("Hub verified {} of {}", mode, topic);
            (StatusCode::OK, challenge.clone())
        }
        None => (StatusCode::BAD_REQUEST, String::new()),
    }
}

async fn receive(
    State(listener): State<Arc<FeedListener>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Err(e) = listener.handle_notification(&headers, &body) {
        log::warn!("Dropped hub notification: {:#}", e);
    }
    StatusCode::OK
}
