#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod mongo;

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub(crate) use mongo::MongoDatabase;

pub(crate) fn never() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Channel {
    #[serde(rename = "_id")]
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) url: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) last_video_published_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) last_sync_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) last_full_sync_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) sync_timeout_expires_at: DateTime<Utc>,
    pub(crate) has_changes: bool,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) subscription_expires_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) subscription_timeout_expires_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) created_at: DateTime<Utc>,
}

impl Channel {
    pub(crate) fn new(id: &str, title: &str, url: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            url: url.to_string(),
            last_video_published_at: never(),
            last_sync_at: never(),
            last_full_sync_at: never(),
            sync_timeout_expires_at: never(),
            has_changes: false,
            subscription_expires_at: never(),
            subscription_timeout_expires_at: never(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Video {
    #[serde(rename = "_id")]
    pub(crate) id: String,
    pub(crate) url: String,
    pub(crate) title: String,
    pub(crate) previews: Vec<String>,
    pub(crate) duration: Option<String>,
    pub(crate) channel_id: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) published_at: DateTime<Utc>,
    pub(crate) telegram_preview_file_id: Option<String>,
    pub(crate) merged_id: Option<String>,
    pub(crate) merged_channel_id: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Chat {
    #[serde(rename = "_id")]
    pub(crate) id: i64,
    /// Telegram channel notifications are forwarded to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) channel_id: Option<i64>,
    pub(crate) is_hide_preview: bool,
    pub(crate) is_muted: bool,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) send_timeout_expires_at: DateTime<Utc>,
    /// Set on rows that represent a linked Telegram channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) parent_chat_id: Option<i64>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) created_at: DateTime<Utc>,
}

impl Chat {
    pub(crate) fn new(id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            channel_id: None,
            is_hide_preview: false,
            is_muted: false,
            send_timeout_expires_at: never(),
            parent_chat_id: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChatIdChannelId {
    pub(crate) chat_id: i64,
    pub(crate) channel_id: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChatIdVideoId {
    pub(crate) chat_id: i64,
    pub(crate) video_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct YtPubSubFeed {
    #[serde(rename = "_id")]
    pub(crate) id: String,
    pub(crate) channel_id: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) published_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub(crate) created_at: DateTime<Utc>,
}

/// Subscription edge joined with the subscribed chat.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Subscriber {
    pub(crate) channel_id: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) chat: Chat,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelSyncUpdate {
    pub(crate) id: String,
    pub(crate) title: Option<String>,
    pub(crate) last_sync_at: DateTime<Utc>,
    pub(crate) last_full_sync_at: Option<DateTime<Utc>>,
    /// Only moves `lastVideoPublishedAt` forward.
    pub(crate) last_video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SyncResults {
    pub(crate) channels: Vec<ChannelSyncUpdate>,
    pub(crate) videos: Vec<Video>,
    pub(crate) chat_id_video_ids: Vec<ChatIdVideoId>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelFeedUpdate {
    pub(crate) id: String,
    /// Only moves `lastVideoPublishedAt` backward.
    pub(crate) last_video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChatChanges {
    pub(crate) is_hide_preview: Option<bool>,
    pub(crate) is_muted: Option<bool>,
}

pub(crate) const BULK_SIZE: usize = 100;

#[async_trait]
pub(crate) trait Database: Send + Sync {
    // Channels

    /// Atomically takes a sync lease on up to `limit` channels that are due
    /// and clears their `hasChanges` flag.
    async fn claim_channels_for_sync(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        synced_before: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Channel>>;
    async fn get_channel_by_id(&self, id: &str) -> anyhow::Result<Option<Channel>>;
    async fn get_channels_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<Channel>>;
    async fn ensure_channel(&self, channel: Channel) -> anyhow::Result<Channel>;
    async fn get_channel_ids_page(&self, offset: u64, limit: i64) -> anyhow::Result<Vec<String>>;
    async fn remove_channels(&self, ids: &[String]) -> anyhow::Result<u64>;
    /// Removes channels nobody is subscribed to and returns their ids.
    async fn remove_unused_channels(&self) -> anyhow::Result<Vec<String>>;
    async fn claim_channels_for_subscription(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        expires_before: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Channel>>;
    async fn set_channel_subscription(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    // Videos

    async fn get_existing_video_ids(&self, ids: &[String]) -> anyhow::Result<Vec<String>>;
    async fn get_video_by_id(&self, id: &str) -> anyhow::Result<Option<Video>>;
    async fn get_videos_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<Video>>;
    async fn set_video_preview_file_id(&self, id: &str, file_id: &str) -> anyhow::Result<()>;
    async fn remove_videos_older_than(&self, date: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Channel sync state, new videos and their fan-out in one transaction.
    /// Videos that already exist are skipped together with their fan-out rows.
    async fn put_sync_results(&self, results: &SyncResults) -> anyhow::Result<()>;

    // Chats

    async fn ensure_chat(&self, id: i64) -> anyhow::Result<Chat>;
    async fn get_chat_by_id(&self, id: i64) -> anyhow::Result<Option<Chat>>;
    async fn update_chat(&self, id: i64, changes: &ChatChanges) -> anyhow::Result<()>;
    /// Links a Telegram channel to `chat_id`, creating the channel's own chat row.
    async fn link_chat_channel(&self, chat_id: i64, channel_id: i64) -> anyhow::Result<()>;
    async fn unlink_chat_channel(&self, chat_id: i64) -> anyhow::Result<()>;
    /// Removes a chat with its edges, pending deliveries and linked channel row.
    async fn delete_chat(&self, id: i64) -> anyhow::Result<()>;
    async fn delete_chats(&self, ids: &[i64]) -> anyhow::Result<u64>;
    /// Never moves the lease backward.
    async fn set_chat_send_timeout(&self, id: i64, until: DateTime<Utc>) -> anyhow::Result<()>;
    async fn change_chat_id(&self, old_id: i64, new_id: i64) -> anyhow::Result<()>;
    async fn get_chat_ids_page(&self, offset: u64, limit: i64) -> anyhow::Result<Vec<i64>>;
    async fn remove_unused_chats(&self) -> anyhow::Result<u64>;

    // Subscriptions

    /// Returns false when the edge already existed.
    async fn subscribe_chat(&self, chat_id: i64, channel_id: &str) -> anyhow::Result<bool>;
    async fn unsubscribe_chat(&self, chat_id: i64, channel_id: &str) -> anyhow::Result<bool>;
    async fn count_chat_subscriptions(&self, chat_id: i64) -> anyhow::Result<u64>;
    async fn get_subscribers_by_channel_ids(
        &self,
        channel_ids: &[String],
    ) -> anyhow::Result<Vec<Subscriber>>;
    async fn get_channels_by_chat_id(&self, chat_id: i64) -> anyhow::Result<Vec<Channel>>;

    // Pending deliveries

    /// Chats with pending deliveries whose send lease has expired.
    async fn get_chats_for_send(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        exclude: &[i64],
    ) -> anyhow::Result<Vec<Chat>>;
    /// Next pending video ids of a chat, oldest publication first.
    async fn get_video_ids_by_chat_id(&self, chat_id: i64, limit: i64)
        -> anyhow::Result<Vec<String>>;
    async fn delete_chat_video_id(&self, chat_id: i64, video_id: &str) -> anyhow::Result<()>;

    // Push feed

    async fn put_feeds(
        &self,
        feeds: &[YtPubSubFeed],
        channels: &[ChannelFeedUpdate],
    ) -> anyhow::Result<()>;
    async fn remove_feeds_older_than(&self, date: DateTime<Utc>) -> anyhow::Result<u64>;
}
