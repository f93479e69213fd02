use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};

use crate::api::api_data_fetcher::is_quota_error;
use crate::api::{ChannelCursor, ServiceVideo, VideoCandidate, VideoService};
use crate::common::debounce::Trigger;
use crate::common::limiter::OneLimit;
use crate::common::retry::retry;
use crate::config::CheckerConfig;
use crate::database::{
    Channel, ChannelSyncUpdate, ChatIdVideoId, Database, Subscriber, SyncResults, Video,
};
use crate::telegram::TelegramApi;

const WRITE_ATTEMPTS: usize = 3;
const WRITE_RETRY_DELAY: StdDuration = StdDuration::from_millis(250);
const EXISTS_PAGE_SIZE: i64 = 50;

/// Receives a message when the video API quota runs out.
pub(crate) struct AdminAlert {
    pub(crate) telegram: Arc<dyn TelegramApi>,
    pub(crate) admin_id: i64,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct SyncSummary {
    pub(crate) checked_channels: usize,
    pub(crate) skipped_channels: usize,
    pub(crate) new_videos: usize,
    pub(crate) new_deliveries: usize,
    pub(crate) quota_exceeded: bool,
}

/// Candidate listings of one raw video id across channels.
struct Listing<'a> {
    raw_id: &'a str,
    channels: BTreeSet<&'a str>,
}

pub(crate) struct Checker {
    db: Arc<dyn Database>,
    service: Arc<dyn VideoService>,
    config: CheckerConfig,
    limit: OneLimit,
    sender_trigger: Trigger,
    alert: Option<AdminAlert>,
}

impl Checker {
    pub(crate) fn new(
        db: Arc<dyn Database>,
        service: Arc<dyn VideoService>,
        config: CheckerConfig,
        sender_trigger: Trigger,
        alert: Option<AdminAlert>,
    ) -> Self {
        Self {
            db,
            service,
            config,
            limit: OneLimit::new(),
            sender_trigger,
            alert,
        }
    }

    /// Syncs every due channel. Overlapping calls return immediately.
    pub(crate) async fn check(&self) -> anyhow::Result<()> {
        match self.limit.run(self.check_all()).await {
            Some(result) => result,
            None => {
                log::debug!("Check is already running, skipping");
                Ok(())
            }
        }
    }

    async fn check_all(&self) -> anyhow::Result<()> {
        let mut total = SyncSummary::default();
        loop {
            let now = Utc::now();
            let channels = self
                .db
                .claim_channels_for_sync(
                    self.config.batch_size,
                    now,
                    now - self.config.sync_interval,
                    now + self.config.sync_lease,
                )
                .await?;
            if channels.is_empty() {
                break;
            }

            let summary = self.sync_channels(&channels, now).await?;
            if summary.new_deliveries > 0 {
                self.sender_trigger.fire();
            }
            total.checked_channels += summary.checked_channels;
            total.skipped_channels += summary.skipped_channels;
            total.new_videos += summary.new_videos;
            total.new_deliveries += summary.new_deliveries;
            if summary.quota_exceeded {
                total.quota_exceeded = true;
                self.notify_quota_exceeded().await;
                break;
            }
        }
        if total.checked_channels > 0 || total.skipped_channels > 0 {
            log::info!(
                "Checked {} channels ({} skipped), {} new videos, {} deliveries",
                total.checked_channels,
                total.skipped_channels,
                total.new_videos,
                total.new_deliveries
            );
        }
        Ok(())
    }

    async fn notify_quota_exceeded(&self) {
        log::error!("Video API quota is exceeded, check is stopped");
        if let Some(alert) = &self.alert {
            let text = format!("{} API quota is exceeded.", self.service.api().name());
            if let Err(e) = alert.telegram.send_message(alert.admin_id, &text).await {
                log::error!("Failed to notify admin about quota: {}", e);
            }
        }
    }

    fn is_full_check(&self, channel: &Channel, now: DateTime<Utc>) -> bool {
        channel.last_full_sync_at < now - self.config.full_sync_interval
    }

    fn cursor(&self, channel: &Channel, now: DateTime<Utc>) -> ChannelCursor {
        let horizon = now - self.config.full_sync_depth;
        let published_after = if self.is_full_check(channel, now) {
            horizon
        } else {
            (channel.last_video_published_at + Duration::seconds(1)).max(horizon)
        };
        ChannelCursor {
            id: channel.id.clone(),
            published_after,
        }
    }

    /// Fetches metadata per listing channel so one failing request only
    /// skips the channels whose videos it carried.
    async fn fetch_videos(
        &self,
        listings: &[Listing<'_>],
    ) -> (HashMap<String, ServiceVideo>, HashSet<String>, bool) {
        let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for listing in listings {
            if let Some(first) = listing.channels.iter().next() {
                groups
                    .entry(*first)
                    .or_default()
                    .push(listing.raw_id.to_string());
            }
        }

        let results: Vec<(Vec<String>, anyhow::Result<Vec<ServiceVideo>>)> =
            stream::iter(groups.into_values())
                .map(|raw_ids| async move {
                    let result = self.service.get_videos(&raw_ids).await;
                    (raw_ids, result)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

        let mut videos = HashMap::new();
        let mut failed = HashSet::new();
        let mut quota_exceeded = false;
        for (raw_ids, result) in results {
            match result {
                Ok(fetched) => {
                    videos.extend(fetched.into_iter().map(|v| (v.id.clone(), v)));
                }
                Err(e) => {
                    if is_quota_error(&e) {
                        quota_exceeded = true;
                    } else {
                        log::error!("Failed to fetch videos {:?}: {:#}", raw_ids, e);
                    }
                    failed.extend(raw_ids);
                }
            }
        }
        (videos, failed, quota_exceeded)
    }

    /// Syncs one claimed batch and persists the outcome in one write.
    pub(crate) async fn sync_channels(
        &self,
        channels: &[Channel],
        now: DateTime<Utc>,
    ) -> anyhow::Result<SyncSummary> {
        let api = self.service.api();
        let cursors: Vec<ChannelCursor> = channels.iter().map(|c| self.cursor(c, now)).collect();
        let listing = self.service.get_video_ids(&cursors).await;
        let mut quota_exceeded = listing.quota_exceeded;
        let mut skipped: HashSet<String> = listing.skipped_channel_ids.into_iter().collect();

        let candidates: Vec<&VideoCandidate> = listing
            .candidates
            .iter()
            .filter(|c| !skipped.contains(&c.channel_id))
            .collect();

        let mut by_raw_id: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for candidate in &candidates {
            by_raw_id
                .entry(candidate.id.as_str())
                .or_default()
                .insert(candidate.channel_id.as_str());
        }
        let primary_ids: Vec<String> = by_raw_id.keys().map(|raw| api.wrap_id(raw)).collect();
        let known: HashMap<String, Video> = self
            .db
            .get_videos_by_ids(&primary_ids)
            .await?
            .into_iter()
            .map(|video| (video.id.clone(), video))
            .collect();
        let mut listings = Vec::new();
        let mut relisted = Vec::new();
        for (raw_id, channels) in by_raw_id {
            match known.get(&api.wrap_id(raw_id)) {
                Some(primary) => relisted.extend(
                    channels
                        .into_iter()
                        .filter(|c| *c != primary.channel_id)
                        .map(|c| (primary, c)),
                ),
                None => listings.push(Listing { raw_id, channels }),
            }
        }
        let late_associations = self.late_associations(api.prefix(), &relisted, now).await?;

        let (fetched, failed, fetch_quota_exceeded) = self.fetch_videos(&listings).await;
        quota_exceeded |= fetch_quota_exceeded;
        for listing in &listings {
            if failed.contains(listing.raw_id) {
                skipped.extend(listing.channels.iter().map(|c| c.to_string()));
            }
        }

        let mut videos = Vec::new();
        for listing in &listings {
            let metadata = match fetched.get(listing.raw_id) {
                Some(metadata) => metadata,
                None => continue,
            };
            let channel_ids: Vec<&str> = listing
                .channels
                .iter()
                .copied()
                .filter(|c| !skipped.contains(*c))
                .collect();
            videos.extend(associations(api.prefix(), metadata, &channel_ids, now));
        }
        videos.extend(
            late_associations
                .into_iter()
                .filter(|v| !skipped.contains(&v.channel_id)),
        );

        let checked: Vec<&Channel> = channels
            .iter()
            .filter(|c| !skipped.contains(&c.id))
            .collect();
        let channel_updates: Vec<ChannelSyncUpdate> = checked
            .iter()
            .map(|channel| {
                let last_video_published_at = candidates
                    .iter()
                    .filter(|c| c.channel_id == channel.id)
                    .map(|c| c.published_at)
                    .max();
                let title = fetched
                    .values()
                    .find(|v| v.channel_id == channel.id && !v.channel_title.is_empty())
                    .map(|v| v.channel_title.clone())
                    .filter(|title| *title != channel.title);
                ChannelSyncUpdate {
                    id: channel.id.clone(),
                    title,
                    last_sync_at: now,
                    last_full_sync_at: self.is_full_check(channel, now).then_some(now),
                    last_video_published_at,
                }
            })
            .collect();

        let chat_id_video_ids = if videos.is_empty() {
            Vec::new()
        } else {
            let channel_ids: Vec<String> = videos
                .iter()
                .flat_map(|v| std::iter::once(&v.channel_id).chain(v.merged_channel_id.as_ref()))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let subscribers = self.db.get_subscribers_by_channel_ids(&channel_ids).await?;
            fan_out(&videos, &subscribers, now - self.config.video_max_age)
        };

        let results = SyncResults {
            channels: channel_updates,
            videos,
            chat_id_video_ids,
        };
        retry(
            WRITE_ATTEMPTS,
            WRITE_RETRY_DELAY,
            || self.db.put_sync_results(&results),
            |e| {
                log::warn!("Failed to write sync results, retrying: {:#}", e);
                true
            },
        )
        .await?;

        Ok(SyncSummary {
            checked_channels: checked.len(),
            skipped_channels: channels.len() - checked.len(),
            new_videos: results.videos.iter().filter(|v| v.merged_id.is_none()).count(),
            new_deliveries: results.chat_id_video_ids.len(),
            quota_exceeded,
        })
    }

    /// Merged rows for channels that list an already stored video under
    /// their own uploads, built from the stored primary row.
    async fn late_associations(
        &self,
        prefix: &str,
        relisted: &[(&Video, &str)],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Video>> {
        if relisted.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = relisted
            .iter()
            .map(|(primary, channel_id)| merged_video_id(prefix, &primary.id, channel_id))
            .collect();
        let known: HashSet<String> = self
            .db
            .get_existing_video_ids(&ids)
            .await?
            .into_iter()
            .collect();
        Ok(relisted
            .iter()
            .zip(ids)
            .filter(|(_, id)| !known.contains(id))
            .map(|((primary, channel_id), id)| Video {
                id,
                channel_id: channel_id.to_string(),
                telegram_preview_file_id: None,
                merged_id: Some(primary.id.clone()),
                merged_channel_id: Some(primary.channel_id.clone()),
                created_at: now,
                ..(*primary).clone()
            })
            .collect())
    }

    /// Drops channels the video service no longer knows about.
    pub(crate) async fn check_channels_exists(&self) -> anyhow::Result<()> {
        let mut offset = 0u64;
        let mut removed_total = 0;
        loop {
            let ids = self
                .db
                .get_channel_ids_page(offset, EXISTS_PAGE_SIZE)
                .await?;
            if ids.is_empty() {
                break;
            }
            let existing: HashSet<String> = match self.service.get_existing_channel_ids(&ids).await {
                Ok(existing) => existing.into_iter().collect(),
                Err(e) if is_quota_error(&e) => {
                    self.notify_quota_exceeded().await;
                    break;
                }
                Err(e) => return Err(e),
            };
            // An empty answer for a whole page is more likely an API glitch.
            let missing: Vec<String> = if existing.is_empty() {
                Vec::new()
            } else {
                ids.iter()
                    .filter(|id| !existing.contains(*id))
                    .cloned()
                    .collect()
            };
            if !missing.is_empty() {
                log::info!("Removing channels missing upstream: {:?}", missing);
                removed_total += self.db.remove_channels(&missing).await?;
            }
            offset += (ids.len() - missing.len()) as u64;
        }
        if removed_total > 0 {
            log::info!("Removed {} channels that no longer exist", removed_total);
        }
        Ok(())
    }

    /// Removes orphaned rows. Returns ids of the removed channels.
    pub(crate) async fn clean(&self) -> anyhow::Result<Vec<String>> {
        let chats = self.db.remove_unused_chats().await?;
        let channels = self.db.remove_unused_channels().await?;
        let videos = self
            .db
            .remove_videos_older_than(Utc::now() - self.config.video_retention)
            .await?;
        log::info!(
            "Cleaned {} chats, {} channels, {} videos",
            chats,
            channels.len(),
            videos
        );
        Ok(channels)
    }
}

/// Builds one video row per listing channel. The owner reported by the
/// metadata wins the primary id, otherwise the smallest channel id does.
fn associations(
    prefix: &str,
    metadata: &ServiceVideo,
    channel_ids: &[&str],
    now: DateTime<Utc>,
) -> Vec<Video> {
    let primary_channel = if channel_ids.contains(&metadata.channel_id.as_str()) {
        metadata.channel_id.as_str()
    } else {
        match channel_ids.iter().min() {
            Some(channel_id) => *channel_id,
            None => return Vec::new(),
        }
    };
    let primary_id = format!("{}:{}", prefix, metadata.id);
    let row = |id: String, channel_id: &str| Video {
        id,
        url: metadata.url.clone(),
        title: metadata.title.clone(),
        previews: metadata.previews.clone(),
        duration: metadata.duration.clone(),
        channel_id: channel_id.to_string(),
        published_at: metadata.published_at,
        telegram_preview_file_id: None,
        merged_id: None,
        merged_channel_id: None,
        created_at: now,
    };

    let mut videos = vec![row(primary_id.clone(), primary_channel)];
    for channel_id in channel_ids.iter().filter(|c| **c != primary_channel) {
        let mut merged = row(merged_video_id(prefix, &primary_id, channel_id), channel_id);
        merged.merged_id = Some(primary_id.clone());
        merged.merged_channel_id = Some(primary_channel.to_string());
        videos.push(merged);
    }
    videos
}

fn merged_video_id(prefix: &str, primary_id: &str, channel_id: &str) -> String {
    let raw_channel_id = channel_id
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(channel_id);
    format!("{}:{}", primary_id, raw_channel_id)
}

/// Pending deliveries for new videos. `videos` lists primary rows before
/// their merged ones, so a chat reached through several associations gets
/// the primary one.
fn fan_out(
    videos: &[Video],
    subscribers: &[Subscriber],
    floor: DateTime<Utc>,
) -> Vec<ChatIdVideoId> {
    let mut by_channel: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
    for subscriber in subscribers {
        by_channel
            .entry(subscriber.channel_id.as_str())
            .or_default()
            .push(subscriber);
    }

    let primaries: HashSet<&str> = videos
        .iter()
        .filter(|v| v.merged_id.is_none())
        .map(|v| v.id.as_str())
        .collect();
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for video in videos {
        if video.published_at <= floor {
            continue;
        }
        let primary_id = video.merged_id.as_deref().unwrap_or(&video.id);
        // Subscribers of the primary channel got the primary row in an earlier pass.
        let served: HashSet<i64> = match &video.merged_channel_id {
            Some(primary_channel) if !primaries.contains(primary_id) => by_channel
                .get(primary_channel.as_str())
                .into_iter()
                .flatten()
                .filter(|s| video.published_at > s.created_at)
                .map(|s| s.chat.id)
                .collect(),
            _ => HashSet::new(),
        };
        for subscriber in by_channel.get(video.channel_id.as_str()).into_iter().flatten() {
            if video.published_at <= subscriber.created_at || served.contains(&subscriber.chat.id) {
                continue;
            }
            let chat = &subscriber.chat;
            let mut targets = Vec::with_capacity(2);
            match chat.channel_id {
                Some(channel_id) => {
                    if !chat.is_muted {
                        targets.push(chat.id);
                    }
                    targets.push(channel_id);
                }
                None => targets.push(chat.id),
            }
            for chat_id in targets {
                if seen.insert((chat_id, primary_id.to_string())) {
                    rows.push(ChatIdVideoId {
                        chat_id,
                        video_id: video.id.clone(),
                    });
                }
            }
        }
    }
    rows
}
