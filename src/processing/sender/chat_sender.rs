use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::common::description_builder::{
    DescriptionBuilder, CAPTION_SIZE_LIMIT, MESSAGE_SIZE_LIMIT,
};
use crate::config::SenderConfig;
use crate::database::{Chat, ChatChanges, Database};
use crate::error::{error_code, ErrorCode};
use crate::processing::sender::preview::PreviewLoader;
use crate::processing::sender::video_provider::{VideoLease, VideoProvider};
use crate::telegram::{PhotoSource, TelegramApi, TelegramError, TelegramErrorKind};

const MAX_RETRY_AFTER: u64 = 60;
const TRANSIENT_DELAY: Duration = Duration::from_secs(1);

pub(crate) struct SenderContext {
    pub(crate) db: Arc<dyn Database>,
    pub(crate) telegram: Arc<dyn TelegramApi>,
    pub(crate) provider: VideoProvider,
    pub(crate) previews: Arc<dyn PreviewLoader>,
    pub(crate) config: SenderConfig,
}

impl SenderContext {
    /// Postpones the chat after a failed delivery.
    pub(crate) async fn back_off(&self, chat_id: i64) -> anyhow::Result<()> {
        self.db
            .set_chat_send_timeout(chat_id, Utc::now() + self.config.failure_backoff)
            .await
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// One pending row was handled, more may follow.
    Sent,
    /// Nothing is left to send.
    Done,
    /// The chat is gone or postponed.
    Aborted,
}

/// Resumable delivery of one chat's pending videos, one video per step.
pub(crate) struct ChatSender {
    chat: Chat,
    queue: VecDeque<String>,
    ctx: Arc<SenderContext>,
}

impl ChatSender {
    pub(crate) fn new(chat: Chat, ctx: Arc<SenderContext>) -> Self {
        Self {
            chat,
            queue: VecDeque::new(),
            ctx,
        }
    }

    pub(crate) fn chat_id(&self) -> i64 {
        self.chat.id
    }

    pub(crate) async fn step(&mut self) -> anyhow::Result<Step> {
        if self.queue.is_empty() {
            let ids = self
                .ctx
                .db
                .get_video_ids_by_chat_id(self.chat.id, self.ctx.config.page_size)
                .await?;
            self.queue.extend(ids);
        }
        let video_id = match self.queue.pop_front() {
            Some(video_id) => video_id,
            None => return Ok(Step::Done),
        };

        let lease = match self.ctx.provider.acquire(&video_id).await {
            Ok(lease) => lease,
            Err(e) if error_code(&e) == Some(ErrorCode::VideoNotFound) => {
                log::debug!("Video {} is gone, dropping it for chat {}", video_id, self.chat.id);
                self.ctx.db.delete_chat_video_id(self.chat.id, &video_id).await?;
                return Ok(Step::Sent);
            }
            Err(e) => return Err(e),
        };

        match self.deliver(&lease).await {
            Ok(()) => {
                self.ctx.db.delete_chat_video_id(self.chat.id, &video_id).await?;
                Ok(Step::Sent)
            }
            Err(e) => self.handle_failure(&lease, e).await,
        }
    }

    async fn handle_failure(&self, lease: &VideoLease, error: anyhow::Error) -> anyhow::Result<Step> {
        let chat_id = self.chat.id;
        let telegram_error = match error.downcast_ref::<TelegramError>() {
            Some(telegram_error) => telegram_error,
            None => return Err(error),
        };
        match telegram_error.kind() {
            TelegramErrorKind::ChatUnreachable => {
                log::info!("Chat {} is unreachable, removing it: {}", chat_id, telegram_error);
                self.ctx.db.delete_chat(chat_id).await?;
                Ok(Step::Aborted)
            }
            TelegramErrorKind::ChatMigrated => {
                if let Some(new_id) = telegram_error.migrate_to_chat_id {
                    log::info!("Chat {} migrated to {}", chat_id, new_id);
                    self.ctx.db.change_chat_id(chat_id, new_id).await?;
                }
                Ok(Step::Aborted)
            }
            TelegramErrorKind::ThreadGone => {
                log::warn!("Dropping video {} for chat {}: {}", lease.video.id, chat_id, telegram_error);
                self.ctx.db.delete_chat_video_id(chat_id, &lease.video.id).await?;
                Ok(Step::Sent)
            }
            _ => {
                log::error!(
                    "Failed to send video {} of channel {} to chat {}: {}",
                    lease.video.id,
                    lease.channel.id,
                    chat_id,
                    telegram_error
                );
                self.ctx.back_off(chat_id).await?;
                Ok(Step::Aborted)
            }
        }
    }

    fn description(lease: &VideoLease, size_limit: usize) -> String {
        DescriptionBuilder::new()
            .video(&lease.video.title, &lease.video.url)
            .channel(&lease.channel.title, &lease.channel.url)
            .duration(lease.video.duration.as_deref())
            .size_limit(size_limit)
            .build()
    }

    async fn deliver(&mut self, lease: &VideoLease) -> anyhow::Result<()> {
        if self.chat.is_hide_preview || lease.video.previews.is_empty() {
            return self.send_text(lease).await;
        }
        match self.send_photo(lease).await {
            Ok(true) => Ok(()),
            Ok(false) => self.send_text(lease).await,
            Err(e) if kind_of(&e) == Some(TelegramErrorKind::PhotoForbidden) => {
                log::info!("Chat {} forbids photos, switching to text", self.chat.id);
                let changes = ChatChanges {
                    is_hide_preview: Some(true),
                    ..Default::default()
                };
                self.ctx.db.update_chat(self.chat.id, &changes).await?;
                self.chat.is_hide_preview = true;
                self.send_text(lease).await
            }
            Err(e) => Err(e),
        }
    }

    async fn send_text(&self, lease: &VideoLease) -> anyhow::Result<()> {
        let text = Self::description(lease, MESSAGE_SIZE_LIMIT);
        self.with_retries(|| self.ctx.telegram.send_message(self.chat.id, &text))
            .await?;
        Ok(())
    }

    /// Returns `false` when no preview could be used.
    async fn send_photo(&self, lease: &VideoLease) -> anyhow::Result<bool> {
        let chat_id = self.chat.id;
        let caption = Self::description(lease, CAPTION_SIZE_LIMIT);

        if let Some(file_id) = lease.preview_file_id() {
            let sent = self
                .with_retries(|| {
                    self.ctx
                        .telegram
                        .send_photo(chat_id, PhotoSource::FileId(file_id.clone()), &caption)
                })
                .await;
            match sent {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == TelegramErrorKind::PhotoUrlRejected => {
                    log::warn!("Cached preview of {} was rejected: {}", lease.video.id, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let url = match self.ctx.previews.find_available(&lease.video.previews).await {
            Some(url) => url,
            None => return Ok(false),
        };
        let sent = self
            .with_retries(|| {
                self.ctx
                    .telegram
                    .send_photo(chat_id, PhotoSource::Url(url.clone()), &caption)
            })
            .await;
        let sent = match sent {
            Ok(sent) => sent,
            Err(e) if e.kind() == TelegramErrorKind::PhotoUrlRejected => {
                let bytes = match self.ctx.previews.download(&url).await {
                    Ok(bytes) => bytes,
                    Err(download_error) => {
                        log::warn!("Failed to download preview {}: {:#}", url, download_error);
                        return Ok(false);
                    }
                };
                self.with_retries(|| {
                    self.ctx
                        .telegram
                        .send_photo(chat_id, PhotoSource::Bytes(bytes.clone()), &caption)
                })
                .await?
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(file_id) = sent.photo_file_id {
            lease.set_preview_file_id(&file_id);
            if let Err(e) = self
                .ctx
                .db
                .set_video_preview_file_id(&lease.video.id, &file_id)
                .await
            {
                log::warn!("Failed to cache preview of {}: {:#}", lease.video.id, e);
            }
        }
        Ok(true)
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, TelegramError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TelegramError>>,
    {
        let mut attempt = 1;
        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let delay = match error.kind() {
                TelegramErrorKind::RateLimited => Duration::from_secs(
                    error.retry_after.map_or(1, u64::from).min(MAX_RETRY_AFTER),
                ),
                TelegramErrorKind::Transient => TRANSIENT_DELAY,
                _ => return Err(error),
            };
            if attempt >= self.ctx.config.send_attempts {
                return Err(error);
            }
            attempt += 1;
            log::debug!("Retrying send to chat {} in {:?}: {}", self.chat.id, delay, error);
            tokio::time::sleep(delay).await;
        }
    }
}

fn kind_of(error: &anyhow::Error) -> Option<TelegramErrorKind> {
    error.downcast_ref::<TelegramError>().map(TelegramError::kind)
}
