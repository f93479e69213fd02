use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::database::{
    Channel, ChannelFeedUpdate, Chat, ChatChanges, ChatIdChannelId, ChatIdVideoId, Database,
    Subscriber, SyncResults, Video, YtPubSubFeed,
};
use crate::error::{ErrorCode, ErrorWithCode};

#[derive(Default)]
struct State {
    channels: BTreeMap<String, Channel>,
    videos: BTreeMap<String, Video>,
    chats: BTreeMap<i64, Chat>,
    subscriptions: Vec<ChatIdChannelId>,
    pending: Vec<ChatIdVideoId>,
    feeds: BTreeMap<String, YtPubSubFeed>,
}

impl State {
    fn remove_chat(&mut self, id: i64) -> bool {
        let chat = match self.chats.remove(&id) {
            Some(chat) => chat,
            None => return false,
        };
        self.subscriptions.retain(|s| s.chat_id != id);
        self.pending.retain(|p| p.chat_id != id);
        if let Some(parent_id) = chat.parent_chat_id {
            if let Some(parent) = self.chats.get_mut(&parent_id) {
                if parent.channel_id == Some(id) {
                    parent.channel_id = None;
                }
            }
        }
        if let Some(channel_id) = chat.channel_id {
            let is_linked = self
                .chats
                .get(&channel_id)
                .map_or(false, |c| c.parent_chat_id == Some(id));
            if is_linked {
                self.remove_chat(channel_id);
            }
        }
        true
    }
}

/// In-memory gateway for tests. Honours the same leases, uniqueness and
/// cascades as the MongoDB one.
#[derive(Default)]
pub(crate) struct MemoryDatabase {
    state: Mutex<State>,
    video_reads: AtomicUsize,
    failing_sync_writes: AtomicUsize,
    chat_fetches: AtomicUsize,
    failing_chat_fetch: AtomicUsize,
}

impl MemoryDatabase {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn insert_channel(&self, channel: Channel) {
        self.state().channels.insert(channel.id.clone(), channel);
    }

    pub(crate) fn insert_chat(&self, chat: Chat) {
        self.state().chats.insert(chat.id, chat);
    }

    pub(crate) fn insert_video(&self, video: Video) {
        self.state().videos.insert(video.id.clone(), video);
    }

    pub(crate) fn insert_pending(&self, chat_id: i64, video_id: &str) {
        self.state().pending.push(ChatIdVideoId {
            chat_id,
            video_id: video_id.to_string(),
        });
    }

    pub(crate) fn subscribe_at(&self, chat_id: i64, channel_id: &str, created_at: DateTime<Utc>) {
        self.state().subscriptions.push(ChatIdChannelId {
            chat_id,
            channel_id: channel_id.to_string(),
            created_at,
        });
    }

    pub(crate) fn channel(&self, id: &str) -> Option<Channel> {
        self.state().channels.get(id).cloned()
    }

    pub(crate) fn chat(&self, id: i64) -> Option<Chat> {
        self.state().chats.get(&id).cloned()
    }

    pub(crate) fn video(&self, id: &str) -> Option<Video> {
        self.state().videos.get(id).cloned()
    }

    pub(crate) fn video_ids(&self) -> Vec<String> {
        self.state().videos.keys().cloned().collect()
    }

    pub(crate) fn pending(&self) -> Vec<ChatIdVideoId> {
        self.state().pending.clone()
    }

    pub(crate) fn feeds(&self) -> Vec<YtPubSubFeed> {
        self.state().feeds.values().cloned().collect()
    }

    /// Number of `get_video_by_id` calls so far.
    pub(crate) fn video_reads(&self) -> usize {
        self.video_reads.load(Ordering::SeqCst)
    }

    /// Makes the next `count` sync writes fail like a transaction conflict.
    pub(crate) fn fail_sync_writes(&self, count: usize) {
        self.failing_sync_writes.store(count, Ordering::SeqCst);
    }

    /// Makes the `call`-th `get_chats_for_send` (counting from 1) fail.
    pub(crate) fn fail_chat_fetch(&self, call: usize) {
        self.failing_chat_fetch.store(call, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn claim_channels_for_sync(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        synced_before: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Channel>> {
        let mut state = self.state();
        let mut due: Vec<&Channel> = state
            .channels
            .values()
            .filter(|c| c.sync_timeout_expires_at <= now)
            .filter(|c| c.has_changes || c.last_sync_at < synced_before)
            .collect();
        due.sort_by_key(|c| (!c.has_changes, c.last_sync_at));
        let ids: Vec<String> = due.into_iter().take(limit).map(|c| c.id.clone()).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(channel) = state.channels.get_mut(&id) {
                channel.sync_timeout_expires_at = lease_until;
                channel.has_changes = false;
                claimed.push(channel.clone());
            }
        }
        Ok(claimed)
    }

    async fn get_channel_by_id(&self, id: &str) -> anyhow::Result<Option<Channel>> {
        Ok(self.channel(id))
    }

    async fn get_channels_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<Channel>> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.channels.get(id).cloned())
            .collect())
    }

    async fn ensure_channel(&self, channel: Channel) -> anyhow::Result<Channel> {
        let mut state = self.state();
        Ok(state
            .channels
            .entry(channel.id.clone())
            .or_insert(channel)
            .clone())
    }

    async fn get_channel_ids_page(&self, offset: u64, limit: i64) -> anyhow::Result<Vec<String>> {
        Ok(self
            .state()
            .channels
            .keys()
            .skip(offset as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn remove_channels(&self, ids: &[String]) -> anyhow::Result<u64> {
        let mut state = self.state();
        let mut removed = 0;
        for id in ids {
            if state.channels.remove(id).is_some() {
                removed += 1;
            }
        }
        state.subscriptions.retain(|s| !ids.contains(&s.channel_id));
        Ok(removed)
    }

    async fn remove_unused_channels(&self) -> anyhow::Result<Vec<String>> {
        let mut state = self.state();
        let used: HashSet<String> = state
            .subscriptions
            .iter()
            .map(|s| s.channel_id.clone())
            .collect();
        let unused: Vec<String> = state
            .channels
            .keys()
            .filter(|id| !used.contains(*id))
            .cloned()
            .collect();
        for id in &unused {
            state.channels.remove(id);
        }
        Ok(unused)
    }

    async fn claim_channels_for_subscription(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        expires_before: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Channel>> {
        let mut state = self.state();
        let mut claimed = Vec::new();
        for channel in state.channels.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if channel.subscription_timeout_expires_at <= now
                && channel.subscription_expires_at < expires_before
            {
                channel.subscription_timeout_expires_at = lease_until;
                claimed.push(channel.clone());
            }
        }
        Ok(claimed)
    }

    async fn set_channel_subscription(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if let Some(channel) = self.state().channels.get_mut(id) {
            channel.subscription_expires_at = expires_at;
        }
        Ok(())
    }

    async fn get_existing_video_ids(&self, ids: &[String]) -> anyhow::Result<Vec<String>> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter(|id| state.videos.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get_video_by_id(&self, id: &str) -> anyhow::Result<Option<Video>> {
        self.video_reads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.video(id))
    }

    async fn get_videos_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<Video>> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.videos.get(id).cloned())
            .collect())
    }

    async fn set_video_preview_file_id(&self, id: &str, file_id: &str) -> anyhow::Result<()> {
        if let Some(video) = self.state().videos.get_mut(id) {
            video.telegram_preview_file_id = Some(file_id.to_string());
        }
        Ok(())
    }

    async fn remove_videos_older_than(&self, date: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state();
        let old: HashSet<String> = state
            .videos
            .values()
            .filter(|v| v.published_at < date)
            .map(|v| v.id.clone())
            .collect();
        state.videos.retain(|id, _| !old.contains(id));
        state.pending.retain(|p| !old.contains(&p.video_id));
        Ok(old.len() as u64)
    }

    async fn put_sync_results(&self, results: &SyncResults) -> anyhow::Result<()> {
        let failing = self.failing_sync_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sync_writes.store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("WriteConflict");
        }

        let mut state = self.state();
        for update in &results.channels {
            if let Some(channel) = state.channels.get_mut(&update.id) {
                if let Some(title) = &update.title {
                    channel.title = title.clone();
                }
                channel.last_sync_at = update.last_sync_at;
                if let Some(last_full_sync_at) = update.last_full_sync_at {
                    channel.last_full_sync_at = last_full_sync_at;
                }
                if let Some(published_at) = update.last_video_published_at {
                    channel.last_video_published_at =
                        channel.last_video_published_at.max(published_at);
                }
            }
        }

        let mut inserted = HashSet::new();
        for video in &results.videos {
            if !state.videos.contains_key(&video.id) {
                state.videos.insert(video.id.clone(), video.clone());
                inserted.insert(video.id.clone());
            }
        }
        for row in &results.chat_id_video_ids {
            if inserted.contains(&row.video_id) && !state.pending.contains(row) {
                state.pending.push(row.clone());
            }
        }
        Ok(())
    }

    async fn ensure_chat(&self, id: i64) -> anyhow::Result<Chat> {
        Ok(self
            .state()
            .chats
            .entry(id)
            .or_insert_with(|| Chat::new(id, Utc::now()))
            .clone())
    }

    async fn get_chat_by_id(&self, id: i64) -> anyhow::Result<Option<Chat>> {
        Ok(self.chat(id))
    }

    async fn update_chat(&self, id: i64, changes: &ChatChanges) -> anyhow::Result<()> {
        if let Some(chat) = self.state().chats.get_mut(&id) {
            if let Some(is_hide_preview) = changes.is_hide_preview {
                chat.is_hide_preview = is_hide_preview;
            }
            if let Some(is_muted) = changes.is_muted {
                chat.is_muted = is_muted;
            }
        }
        Ok(())
    }

    async fn link_chat_channel(&self, chat_id: i64, channel_id: i64) -> anyhow::Result<()> {
        let mut state = self.state();
        let taken = state
            .chats
            .values()
            .any(|c| c.channel_id == Some(channel_id) && c.id != chat_id);
        if taken {
            return Err(ErrorWithCode::new(ErrorCode::ChannelAlreadyLinked, channel_id.to_string()).into());
        }
        let previous = match state.chats.get(&chat_id) {
            Some(chat) => chat.channel_id,
            None => return Err(ErrorWithCode::new(ErrorCode::ChatNotFound, chat_id.to_string()).into()),
        };
        if let Some(previous) = previous.filter(|previous| *previous != channel_id) {
            state.remove_chat(previous);
        }
        if let Some(chat) = state.chats.get_mut(&chat_id) {
            chat.channel_id = Some(channel_id);
        }
        state
            .chats
            .entry(channel_id)
            .or_insert_with(|| Chat::new(channel_id, Utc::now()))
            .parent_chat_id = Some(chat_id);
        Ok(())
    }

    async fn unlink_chat_channel(&self, chat_id: i64) -> anyhow::Result<()> {
        let mut state = self.state();
        let channel_id = state
            .chats
            .get_mut(&chat_id)
            .and_then(|chat| chat.channel_id.take());
        if let Some(channel_id) = channel_id {
            state.remove_chat(channel_id);
        }
        Ok(())
    }

    async fn delete_chat(&self, id: i64) -> anyhow::Result<()> {
        self.state().remove_chat(id);
        Ok(())
    }

    async fn delete_chats(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let mut state = self.state();
        Ok(ids.iter().filter(|id| state.remove_chat(**id)).count() as u64)
    }

    async fn set_chat_send_timeout(&self, id: i64, until: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(chat) = self.state().chats.get_mut(&id) {
            chat.send_timeout_expires_at = chat.send_timeout_expires_at.max(until);
        }
        Ok(())
    }

    async fn change_chat_id(&self, old_id: i64, new_id: i64) -> anyhow::Result<()> {
        let mut state = self.state();
        if let Some(mut chat) = state.chats.remove(&old_id) {
            chat.id = new_id;
            state.chats.entry(new_id).or_insert(chat);
        }
        for chat in state.chats.values_mut() {
            if chat.parent_chat_id == Some(old_id) {
                chat.parent_chat_id = Some(new_id);
            }
            if chat.channel_id == Some(old_id) {
                chat.channel_id = Some(new_id);
            }
        }

        let mut seen = HashSet::new();
        let subscriptions = std::mem::take(&mut state.subscriptions);
        for mut edge in subscriptions {
            if edge.chat_id == old_id {
                edge.chat_id = new_id;
            }
            if seen.insert((edge.chat_id, edge.channel_id.clone())) {
                state.subscriptions.push(edge);
            }
        }

        let mut seen = HashSet::new();
        let pending = std::mem::take(&mut state.pending);
        for mut row in pending {
            if row.chat_id == old_id {
                row.chat_id = new_id;
            }
            if seen.insert(row.clone()) {
                state.pending.push(row);
            }
        }
        Ok(())
    }

    async fn get_chat_ids_page(&self, offset: u64, limit: i64) -> anyhow::Result<Vec<i64>> {
        Ok(self
            .state()
            .chats
            .keys()
            .skip(offset as usize)
            .take(limit.max(0) as usize)
            .copied()
            .collect())
    }

    async fn remove_unused_chats(&self) -> anyhow::Result<u64> {
        let mut state = self.state();
        let subscribed: HashSet<i64> = state.subscriptions.iter().map(|s| s.chat_id).collect();
        let unused: Vec<i64> = state
            .chats
            .values()
            .filter(|c| {
                !subscribed.contains(&c.id) && c.channel_id.is_none() && c.parent_chat_id.is_none()
            })
            .map(|c| c.id)
            .collect();
        for id in &unused {
            state.remove_chat(*id);
        }
        Ok(unused.len() as u64)
    }

    async fn subscribe_chat(&self, chat_id: i64, channel_id: &str) -> anyhow::Result<bool> {
        let mut state = self.state();
        let exists = state
            .subscriptions
            .iter()
            .any(|s| s.chat_id == chat_id && s.channel_id == channel_id);
        if exists {
            return Ok(false);
        }
        state.subscriptions.push(ChatIdChannelId {
            chat_id,
            channel_id: channel_id.to_string(),
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn unsubscribe_chat(&self, chat_id: i64, channel_id: &str) -> anyhow::Result<bool> {
        let mut state = self.state();
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| !(s.chat_id == chat_id && s.channel_id == channel_id));
        Ok(state.subscriptions.len() != before)
    }

    async fn count_chat_subscriptions(&self, chat_id: i64) -> anyhow::Result<u64> {
        Ok(self
            .state()
            .subscriptions
            .iter()
            .filter(|s| s.chat_id == chat_id)
            .count() as u64)
    }

    async fn get_subscribers_by_channel_ids(
        &self,
        channel_ids: &[String],
    ) -> anyhow::Result<Vec<Subscriber>> {
        let state = self.state();
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| channel_ids.contains(&s.channel_id))
            .filter_map(|s| {
                state.chats.get(&s.chat_id).map(|chat| Subscriber {
                    channel_id: s.channel_id.clone(),
                    created_at: s.created_at,
                    chat: chat.clone(),
                })
            })
            .collect())
    }

    async fn get_channels_by_chat_id(&self, chat_id: i64) -> anyhow::Result<Vec<Channel>> {
        let state = self.state();
        let mut edges: Vec<&ChatIdChannelId> = state
            .subscriptions
            .iter()
            .filter(|s| s.chat_id == chat_id)
            .collect();
        edges.sort_by_key(|s| s.created_at);
        Ok(edges
            .into_iter()
            .filter_map(|s| state.channels.get(&s.channel_id).cloned())
            .collect())
    }

    async fn get_chats_for_send(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        exclude: &[i64],
    ) -> anyhow::Result<Vec<Chat>> {
        let call = self.chat_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.failing_chat_fetch.load(Ordering::SeqCst) {
            anyhow::bail!("chats query failed");
        }
        let state = self.state();
        let with_pending: HashSet<i64> = state.pending.iter().map(|p| p.chat_id).collect();
        Ok(state
            .chats
            .values()
            .filter(|c| with_pending.contains(&c.id))
            .filter(|c| c.send_timeout_expires_at <= now)
            .filter(|c| !exclude.contains(&c.id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_video_ids_by_chat_id(
        &self,
        chat_id: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<String>> {
        let state = self.state();
        let mut rows: Vec<(Option<DateTime<Utc>>, String)> = state
            .pending
            .iter()
            .filter(|p| p.chat_id == chat_id)
            .map(|p| {
                let published_at = state.videos.get(&p.video_id).map(|v| v.published_at);
                (published_at, p.video_id.clone())
            })
            .collect();
        rows.sort();
        Ok(rows
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn delete_chat_video_id(&self, chat_id: i64, video_id: &str) -> anyhow::Result<()> {
        self.state()
            .pending
            .retain(|p| !(p.chat_id == chat_id && p.video_id == video_id));
        Ok(())
    }

    async fn put_feeds(
        &self,
        feeds: &[YtPubSubFeed],
        channels: &[ChannelFeedUpdate],
    ) -> anyhow::Result<()> {
        let mut state = self.state();
        for feed in feeds {
            state
                .feeds
                .entry(feed.id.clone())
                .or_insert_with(|| feed.clone());
        }
        for update in channels {
            if let Some(channel) = state.channels.get_mut(&update.id) {
                channel.has_changes = true;
                if let Some(published_at) = update.last_video_published_at {
                    channel.last_video_published_at =
                        channel.last_video_published_at.min(published_at);
                }
            }
        }
        Ok(())
    }

    async fn remove_feeds_older_than(&self, date: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state();
        let before = state.feeds.len();
        state.feeds.retain(|_, feed| feed.created_at >= date);
        Ok((before - state.feeds.len()) as u64)
    }
}

pub(crate) fn test_video(id: &str, channel_id: &str, published_at: DateTime<Utc>) -> Video {
    Video {
        id: id.to_string(),
        url: format!("https://youtu.be/{}", id),
        title: format!("Video {}", id),
        previews: vec![format!("https://i.ytimg.com/vi/{}/maxresdefault.jpg", id)],
        duration: Some("4:05".to_string()),
        channel_id: channel_id.to_string(),
        published_at,
        telegram_preview_file_id: None,
        merged_id: None,
        merged_channel_id: None,
        created_at: published_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn sync_claim_is_a_lease() {
        let db = MemoryDatabase::new();
        let now = Utc::now();
        db.insert_channel(Channel::new("ytb:UC1", "One", "url", now));
        let lease = now + Duration::minutes(5);

        let first = db.claim_channels_for_sync(10, now, now, lease).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = db.claim_channels_for_sync(10, now, now, lease).await.unwrap();
        assert!(second.is_empty());
        let after_lease = db
            .claim_channels_for_sync(10, lease, lease, lease + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(after_lease.len(), 1);
    }

    #[tokio::test]
    async fn deleting_linked_channel_clears_owner() {
        let db = MemoryDatabase::new();
        db.ensure_chat(1).await.unwrap();
        db.link_chat_channel(1, -100).await.unwrap();
        assert_eq!(db.chat(-100).unwrap().parent_chat_id, Some(1));

        db.ensure_chat(2).await.unwrap();
        let taken = db.link_chat_channel(2, -100).await.unwrap_err();
        assert_eq!(
            crate::error::error_code(&taken),
            Some(ErrorCode::ChannelAlreadyLinked)
        );

        db.delete_chat(-100).await.unwrap();
        assert_eq!(db.chat(1).unwrap().channel_id, None);
    }

    #[tokio::test]
    async fn change_chat_id_cascades() {
        let db = MemoryDatabase::new();
        db.ensure_chat(1).await.unwrap();
        db.link_chat_channel(1, -100).await.unwrap();
        db.subscribe_chat(1, "ytb:UC1").await.unwrap();
        db.insert_pending(1, "ytb:v1");

        db.change_chat_id(1, -1001).await.unwrap();
        assert!(db.chat(1).is_none());
        assert_eq!(db.chat(-1001).unwrap().channel_id, Some(-100));
        assert_eq!(db.chat(-100).unwrap().parent_chat_id, Some(-1001));
        assert_eq!(db.count_chat_subscriptions(-1001).await.unwrap(), 1);
        assert_eq!(db.pending()[0].chat_id, -1001);
    }

    #[tokio::test]
    async fn send_timeout_never_moves_back() {
        let db = MemoryDatabase::new();
        db.ensure_chat(1).await.unwrap();
        let now = Utc::now();
        db.set_chat_send_timeout(1, now + Duration::minutes(10)).await.unwrap();
        db.set_chat_send_timeout(1, now + Duration::minutes(5)).await.unwrap();
        assert_eq!(
            db.chat(1).unwrap().send_timeout_expires_at,
            now + Duration::minutes(10)
        );
    }
}
