pub(crate) mod api_data_fetcher;
pub(crate) mod youtube;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ErrorCode, ErrorWithCode};

/// Video hosting services the bot can watch. Ids of every entity coming
/// from a service are namespaced with the service prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Api {
    Youtube,
}

impl Api {
    pub(crate) fn prefix(&self) -> &'static str {
        match self {
            Api::Youtube => "ytb",
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Api::Youtube => "YouTube",
        }
    }

    pub(crate) fn wrap_id(&self, raw_id: &str) -> String {
        format!("{}:{}", self.prefix(), raw_id)
    }

    pub(crate) fn unwrap_id<'a>(&self, id: &'a str) -> Result<&'a str, ErrorWithCode> {
        id.strip_prefix(self.prefix())
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| ErrorWithCode::new(ErrorCode::IncorrectChannelId, id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceChannel {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelCursor {
    pub(crate) id: String,
    pub(crate) published_after: DateTime<Utc>,
}

/// A video id listed by a channel; `id` is the raw service id.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VideoCandidate {
    pub(crate) id: String,
    pub(crate) channel_id: String,
    pub(crate) published_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct VideoIdsResult {
    pub(crate) candidates: Vec<VideoCandidate>,
    pub(crate) skipped_channel_ids: Vec<String>,
    pub(crate) quota_exceeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceVideo {
    pub(crate) id: String,
    pub(crate) url: String,
    pub(crate) title: String,
    pub(crate) previews: Vec<String>,
    pub(crate) duration: Option<String>,
    pub(crate) channel_id: String,
    pub(crate) channel_title: String,
    pub(crate) published_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait VideoService: Send + Sync {
    fn api(&self) -> Api;

    /// Accepts a channel url, a video url, a legacy username or a search query.
    async fn resolve_channel(&self, query: &str) -> anyhow::Result<ServiceChannel>;

    /// Lists videos published after each cursor. Channels that failed are
    /// reported as skipped instead of failing the whole call.
    async fn get_video_ids(&self, channels: &[ChannelCursor]) -> VideoIdsResult;

    async fn get_videos(&self, video_ids: &[String]) -> anyhow::Result<Vec<ServiceVideo>>;

    async fn get_existing_channel_ids(&self, channel_ids: &[String])
        -> anyhow::Result<Vec<String>>;
}
