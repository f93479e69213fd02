use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;

use crate::api::api_data_fetcher::{self, ApiDataFetcher, Request};
use crate::api::{
    Api, ChannelCursor, ServiceChannel, ServiceVideo, VideoCandidate, VideoIdsResult,
    VideoService,
};
use crate::error::{ErrorCode, ErrorWithCode};
use crate::regexp;

const PAGE_SIZE: u8 = 50;
const FALLBACK_PAGE_SIZE: u8 = 10;
const IDS_PER_REQUEST: usize = 50;
// Upper bound for a single channel listing, a full check never needs more.
const MAX_PAGES: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    content_details: PlaylistItemContentDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemContentDetails {
    video_id: String,
    // Missing for private and not yet premiered videos.
    video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    snippet: VideoSnippet,
    content_details: Option<VideoContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    published_at: DateTime<Utc>,
    channel_id: String,
    title: String,
    channel_title: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    default: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    high: Option<Thumbnail>,
    standard: Option<Thumbnail>,
    maxres: Option<Thumbnail>,
}

impl Thumbnails {
    /// Best quality first.
    fn urls(self) -> Vec<String> {
        [self.maxres, self.standard, self.high, self.medium, self.default]
            .into_iter()
            .flatten()
            .map(|thumbnail| thumbnail.url)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoContentDetails {
    duration: String,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    id: String,
    snippet: Option<ChannelSnippet>,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    snippet: SearchSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    channel_id: String,
    channel_title: String,
}

/// Formats an ISO-8601 duration (`PT1H2M3S`) as `1:02:03`.
/// Live streams report `P0D` and get no duration.
fn format_duration(iso: &str) -> Option<String> {
    let rest = iso.strip_prefix('P')?;
    let mut total = 0u64;
    let mut number = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value = if number.is_empty() {
            0
        } else {
            number.parse::<u64>().ok()?
        };
        number.clear();
        match c {
            'T' => {}
            'W' => total += value * 7 * 86400,
            'D' => total += value * 86400,
            'H' => total += value * 3600,
            'M' => total += value * 60,
            'S' => total += value,
            _ => return None,
        }
    }
    if total == 0 {
        return None;
    }
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    Some(if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    })
}

fn uploads_playlist_id(raw_channel_id: &str) -> Option<String> {
    raw_channel_id
        .strip_prefix("UC")
        .map(|rest| format!("UU{}", rest))
}

fn channel_url(raw_channel_id: &str) -> String {
    format!("https://www.youtube.com/channel/{}", raw_channel_id)
}

fn video_url(raw_video_id: &str) -> String {
    format!("https://youtu.be/{}", raw_video_id)
}

fn video_id_from_link(query: &str) -> Option<&str> {
    regexp::YOUTUBE_VIDEO_LINKS
        .iter()
        .find_map(|re| re.captures(query))
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
}

enum Lookup<'a> {
    Id(&'a str),
    Handle(&'a str),
    Username(&'a str),
}

pub(crate) struct YoutubeApi {
    fetcher: ApiDataFetcher,
    concurrency: usize,
}

impl YoutubeApi {
    pub(crate) fn new(api_key: &str, concurrency: usize) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: ApiDataFetcher::new(api_key)?,
            concurrency: concurrency.max(1),
        })
    }

    async fn find_channel(&self, lookup: Lookup<'_>) -> anyhow::Result<Option<ServiceChannel>> {
        let request = match lookup {
            Lookup::Id(id) => Request::ChannelById(id),
            Lookup::Handle(handle) => Request::ChannelByHandle(handle),
            Lookup::Username(username) => Request::ChannelByUsername(username),
        };
        let response: ListResponse<ChannelItem> = self.fetcher.get_data(request).await?;
        Ok(response.items.into_iter().next().map(|item| {
            let title = item.snippet.map(|s| s.title).unwrap_or_default();
            ServiceChannel {
                id: Api::Youtube.wrap_id(&item.id),
                url: channel_url(&item.id),
                title,
            }
        }))
    }

    async fn find_channel_by_video_id(
        &self,
        video_id: &str,
    ) -> anyhow::Result<Option<ServiceChannel>> {
        let ids = [video_id.to_string()];
        let response: ListResponse<VideoItem> =
            self.fetcher.get_data(Request::Videos(&ids)).await?;
        match response.items.into_iter().next() {
            Some(video) => self.find_channel(Lookup::Id(&video.snippet.channel_id)).await,
            None => Ok(None),
        }
    }

    async fn search_channel(&self, query: &str) -> anyhow::Result<Option<ServiceChannel>> {
        let response: ListResponse<SearchItem> =
            self.fetcher.get_data(Request::SearchChannel(query)).await?;
        Ok(response.items.into_iter().next().map(|item| ServiceChannel {
            id: Api::Youtube.wrap_id(&item.snippet.channel_id),
            url: channel_url(&item.snippet.channel_id),
            title: item.snippet.channel_title,
        }))
    }

    async fn get_playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> anyhow::Result<ListResponse<PlaylistItem>> {
        let request = |max_results| Request::PlaylistItems {
            playlist_id,
            page_token,
            max_results,
        };
        match self.fetcher.get_data(request(PAGE_SIZE)).await {
            Err(error) if api_data_fetcher::is_backend_error(&error) => {
                log::warn!(
                    "Backend error on playlist {} page, retrying with a smaller page",
                    playlist_id
                );
                self.fetcher.get_data(request(FALLBACK_PAGE_SIZE)).await
            }
            result => result,
        }
    }

    async fn get_channel_video_ids(
        &self,
        cursor: &ChannelCursor,
    ) -> anyhow::Result<Vec<VideoCandidate>> {
        let raw_channel_id = Api::Youtube.unwrap_id(&cursor.id)?;
        let playlist_id = uploads_playlist_id(raw_channel_id)
            .ok_or_else(|| ErrorWithCode::new(ErrorCode::IncorrectChannelId, &cursor.id))?;

        let mut candidates = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .get_playlist_page(&playlist_id, page_token.as_deref())
                .await?;
            let mut reached_cursor = false;
            for item in page.items {
                let published_at = match item.content_details.video_published_at {
                    Some(published_at) => published_at,
                    None => continue,
                };
                if published_at < cursor.published_after {
                    reached_cursor = true;
                    continue;
                }
                candidates.push(VideoCandidate {
                    id: item.content_details.video_id,
                    channel_id: cursor.id.clone(),
                    published_at,
                });
            }
            page_token = page.next_page_token;
            if reached_cursor || page_token.is_none() {
                break;
            }
        }
        Ok(candidates)
    }
}

#[async_trait]
impl VideoService for YoutubeApi {
    fn api(&self) -> Api {
        Api::Youtube
    }

    async fn resolve_channel(&self, query: &str) -> anyhow::Result<ServiceChannel> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ErrorWithCode::new(ErrorCode::QueryIsEmpty, query).into());
        }

        let by_url = if let Some(cap) = regexp::YOUTUBE_CHANNEL_LINK.captures(query) {
            Some(self.find_channel(Lookup::Id(&cap[1])).await?)
        } else if regexp::YOUTUBE_CHANNEL_ID.is_match(query) {
            Some(self.find_channel(Lookup::Id(query)).await?)
        } else if let Some(cap) = regexp::YOUTUBE_HANDLE_LINK.captures(query) {
            Some(self.find_channel(Lookup::Handle(&cap[1])).await?)
        } else if let Some(cap) = regexp::YOUTUBE_USER_LINK.captures(query) {
            Some(self.find_channel(Lookup::Username(&cap[1])).await?)
        } else if let Some(cap) = regexp::YOUTUBE_CUSTOM_LINK.captures(query) {
            Some(self.search_channel(&cap[1]).await?)
        } else {
            None
        };
        if let Some(found) = by_url {
            return found.ok_or_else(|| {
                ErrorWithCode::new(ErrorCode::ChannelByUrlNotFound, query).into()
            });
        }

        if let Some(video_id) = video_id_from_link(query) {
            return self
                .find_channel_by_video_id(video_id)
                .await?
                .ok_or_else(|| {
                    ErrorWithCode::new(ErrorCode::ChannelByVideoIdNotFound, video_id).into()
                });
        }

        if let Some(handle) = query.strip_prefix('@') {
            return self
                .find_channel(Lookup::Handle(handle))
                .await?
                .ok_or_else(|| ErrorWithCode::new(ErrorCode::ChannelByUserNotFound, query).into());
        }

        let is_username = query.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-');
        if is_username {
            if let Some(channel) = self.find_channel(Lookup::Username(query)).await? {
                return Ok(channel);
            }
        }

        self.search_channel(query)
            .await?
            .ok_or_else(|| ErrorWithCode::new(ErrorCode::ChannelByQueryNotFound, query).into())
    }

    async fn get_video_ids(&self, channels: &[ChannelCursor]) -> VideoIdsResult {
        let requests: Vec<_> = channels
            .iter()
            .map(|cursor| async move {
                (cursor.id.clone(), self.get_channel_video_ids(cursor).await)
            })
            .collect();
        let results: Vec<(String, anyhow::Result<Vec<VideoCandidate>>)> = stream::iter(requests)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut output = VideoIdsResult::default();
        for (channel_id, result) in results {
            match result {
                Ok(candidates) => output.candidates.extend(candidates),
                Err(error) => {
                    if api_data_fetcher::is_quota_error(&error) {
                        output.quota_exceeded = true;
                    } else if error
                        .downcast_ref::<api_data_fetcher::YoutubeApiError>()
                        .map_or(false, |e| e.is_not_found())
                    {
                        log::info!("Uploads of channel {} are not found, skipping", channel_id);
                    } else {
                        log::error!("Failed to list videos of channel {}: {}", channel_id, error);
                    }
                    output.skipped_channel_ids.push(channel_id);
                }
            }
        }
        output
    }

    async fn get_videos(&self, video_ids: &[String]) -> anyhow::Result<Vec<ServiceVideo>> {
        let mut videos = Vec::with_capacity(video_ids.len());
        for chunk in video_ids.chunks(IDS_PER_REQUEST) {
            let response: ListResponse<VideoItem> =
                self.fetcher.get_data(Request::Videos(chunk)).await?;
            videos.extend(response.items.into_iter().map(|item| {
                let duration = item
                    .content_details
                    .and_then(|details| format_duration(&details.duration));
                ServiceVideo {
                    url: video_url(&item.id),
                    id: item.id,
                    title: item.snippet.title,
                    previews: item.snippet.thumbnails.urls(),
                    duration,
                    channel_id: Api::Youtube.wrap_id(&item.snippet.channel_id),
                    channel_title: item.snippet.channel_title,
                    published_at: item.snippet.published_at,
                }
            }));
        }
        Ok(videos)
    }

    async fn get_existing_channel_ids(
        &self,
        channel_ids: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let raw_ids = channel_ids
            .iter()
            .map(|id| Api::Youtube.unwrap_id(id).map(|raw| raw.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut existing = Vec::new();
        for chunk in raw_ids.chunks(IDS_PER_REQUEST) {
            let response: ListResponse<ChannelItem> =
                self.fetcher.get_data(Request::Channels(chunk)).await?;
            existing.extend(
                response
                    .items
                    .into_iter()
                    .map(|item| Api::Youtube.wrap_id(&item.id)),
            );
        }
        Ok(existing)
    }
}
