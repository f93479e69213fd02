pub(crate) mod chat_sender;
pub(crate) mod preview;
pub(crate) mod video_provider;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::stream::{self, FuturesUnordered, StreamExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::common::limiter::OneLimit;
use crate::processing::sender::chat_sender::{ChatSender, SenderContext, Step};
use crate::telegram::TelegramErrorKind;

const EXISTS_PAGE_SIZE: i64 = 100;

struct WorkerActivity {
    /// Start of the step in flight, or end of the last one.
    last_activity: Instant,
    running: bool,
    /// Watchdog passes that found the running step over the window.
    lock_count: u32,
    abort: Arc<Notify>,
}

impl WorkerActivity {
    fn new() -> Self {
        Self {
            last_activity: Instant::now(),
            running: false,
            lock_count: 0,
            abort: Arc::new(Notify::new()),
        }
    }
}

struct StepOutcome {
    chat_id: i64,
    /// Absent when the worker was abandoned.
    worker: Option<ChatSender>,
    result: anyhow::Result<Step>,
}

async fn run_step(worker: ChatSender, abort: Arc<Notify>) -> StepOutcome {
    let chat_id = worker.chat_id();
    let mut task = tokio::spawn(async move {
        let mut worker = worker;
        let result = worker.step().await;
        (worker, result)
    });
    tokio::select! {
        joined = &mut task => match joined {
            Ok((worker, result)) => StepOutcome { chat_id, worker: Some(worker), result },
            Err(e) => StepOutcome { chat_id, worker: None, result: Err(e.into()) },
        },
        _ = abort.notified() => StepOutcome {
            chat_id,
            worker: None,
            result: Err(anyhow::anyhow!("worker is stuck, abandoning it")),
        },
    }
}

/// Drains pending deliveries with a fixed number of concurrent steps,
/// taking chats in turns so a long queue does not starve the others.
pub(crate) struct Sender {
    ctx: Arc<SenderContext>,
    limit: OneLimit,
    workers: Mutex<HashMap<i64, WorkerActivity>>,
    /// Signalled by checks that found a pass already running.
    wake: Notify,
}

impl Sender {
    pub(crate) fn new(ctx: Arc<SenderContext>) -> Self {
        Self {
            ctx,
            limit: OneLimit::new(),
            workers: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub(crate) async fn check(&self) -> anyhow::Result<()> {
        match self.limit.run(self.send_pending()).await {
            Some(result) => result,
            None => {
                self.wake.notify_one();
                Ok(())
            }
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<i64, WorkerActivity>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, chat_id: i64) -> Arc<Notify> {
        self.workers()
            .entry(chat_id)
            .or_insert_with(WorkerActivity::new)
            .abort
            .clone()
    }

    fn set_running(&self, chat_id: i64, running: bool) {
        if let Some(activity) = self.workers().get_mut(&chat_id) {
            activity.last_activity = Instant::now();
            activity.running = running;
            activity.lock_count = 0;
        }
    }

    fn unregister(&self, chat_id: i64) {
        self.workers().remove(&chat_id);
    }

    fn active_chat_ids(&self) -> Vec<i64> {
        self.workers().keys().copied().collect()
    }

    async fn send_pending(&self) -> anyhow::Result<()> {
        let concurrency = self.ctx.config.concurrency.max(1);
        let capacity = concurrency * 2;
        let mut runnable: VecDeque<(ChatSender, Arc<Notify>)> = VecDeque::new();
        let mut running = FuturesUnordered::new();
        let mut exhausted = false;
        // Chats already taken are still drained when a refill fails, so
        // none of them stays registered after the pass.
        let mut fetch_error: Option<anyhow::Error> = None;
        let mut sent = 0usize;

        loop {
            let active = runnable.len() + running.len();
            if !exhausted && fetch_error.is_none() && active < capacity {
                let exclude = self.active_chat_ids();
                match self
                    .ctx
                    .db
                    .get_chats_for_send(chrono::Utc::now(), (capacity - active) as i64, &exclude)
                    .await
                {
                    Ok(chats) => {
                        exhausted = chats.is_empty();
                        for chat in chats {
                            let abort = self.register(chat.id);
                            runnable.push_back((ChatSender::new(chat, self.ctx.clone()), abort));
                        }
                    }
                    Err(e) => fetch_error = Some(e),
                }
            }

            while running.len() < concurrency {
                match runnable.pop_front() {
                    Some((worker, abort)) => {
                        self.set_running(worker.chat_id(), true);
                        running.push(async move {
                            let outcome = run_step(worker, abort.clone()).await;
                            (outcome, abort)
                        })
                    }
                    None => break,
                }
            }

            if running.is_empty() {
                break;
            }
            let next = tokio::select! {
                next = running.next() => next,
                _ = self.wake.notified() => {
                    exhausted = false;
                    continue;
                }
            };
            let (outcome, abort) = match next {
                Some(next) => next,
                None => break,
            };
            let chat_id = outcome.chat_id;
            match (outcome.worker, outcome.result) {
                (Some(worker), Ok(Step::Sent)) => {
                    sent += 1;
                    self.set_running(chat_id, false);
                    runnable.push_back((worker, abort));
                }
                (_, Ok(_)) => {
                    self.unregister(chat_id);
                    exhausted = false;
                }
                (_, Err(e)) => {
                    log::error!("Delivery to chat {} failed: {:#}", chat_id, e);
                    if let Err(e) = self.ctx.back_off(chat_id).await {
                        log::error!("Failed to postpone chat {}: {:#}", chat_id, e);
                    }
                    self.unregister(chat_id);
                    exhausted = false;
                }
            }
        }

        if sent > 0 {
            log::info!("Handled {} pending deliveries", sent);
        }
        match fetch_error {
            Some(e) => Err(e.context("failed to load chats with pending videos")),
            None => Ok(()),
        }
    }

    /// Abandons steps that ran for too long and postpones their chats.
    /// Queued workers are left alone.
    pub(crate) async fn check_stuck(&self) -> anyhow::Result<()> {
        let window = self.ctx.config.activity_window;
        let grace = self.ctx.config.lock_grace;
        let now = Instant::now();
        let stuck: Vec<i64> = self
            .workers()
            .iter_mut()
            .filter(|(_, activity)| activity.running)
            .filter(|(_, activity)| now.duration_since(activity.last_activity) > window)
            .filter_map(|(chat_id, activity)| {
                activity.lock_count += 1;
                if activity.lock_count >= grace {
                    activity.abort.notify_waiters();
                    Some(*chat_id)
                } else {
                    None
                }
            })
            .collect();
        for chat_id in stuck {
            log::warn!("Worker of chat {} is stuck, aborting it", chat_id);
            self.ctx.back_off(chat_id).await?;
        }
        Ok(())
    }

    /// Removes chats the bot can no longer reach.
    pub(crate) async fn check_chats_exists(&self) -> anyhow::Result<()> {
        let mut offset = 0u64;
        let mut removed_total = 0;
        loop {
            let ids = self
                .ctx
                .db
                .get_chat_ids_page(offset, EXISTS_PAGE_SIZE)
                .await?;
            if ids.is_empty() {
                break;
            }

            let results: Vec<_> = stream::iter(ids.iter().copied())
                .map(|chat_id| async move {
                    (chat_id, self.ctx.telegram.send_chat_action(chat_id).await)
                })
                .buffer_unordered(self.ctx.config.concurrency.max(1))
                .collect()
                .await;

            let mut unreachable = Vec::new();
            let mut migrated = Vec::new();
            for (chat_id, result) in results {
                let error = match result {
                    Ok(()) => continue,
                    Err(error) => error,
                };
                match (error.kind(), error.migrate_to_chat_id) {
                    (TelegramErrorKind::ChatUnreachable, _) => unreachable.push(chat_id),
                    (TelegramErrorKind::ChatMigrated, Some(new_id)) => migrated.push((chat_id, new_id)),
                    _ => log::debug!("Chat {} check failed: {}", chat_id, error),
                }
            }

            for (old_id, new_id) in &migrated {
                log::info!("Chat {} migrated to {}", old_id, new_id);
                self.ctx.db.change_chat_id(*old_id, *new_id).await?;
            }
            if !unreachable.is_empty() {
                removed_total += self.ctx.db.delete_chats(&unreachable).await?;
            }
            let moved = (unreachable.len() + migrated.len()) as u64;
            offset += ids.len() as u64 - moved;
        }
        if removed_total > 0 {
            log::info!("Removed {} unreachable chats", removed_total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SenderConfig;
    use crate::database::memory::{test_video, MemoryDatabase};
    use crate::database::{Channel, Chat};
    use crate::processing::sender::chat_sender::tests::{context, previews, CHANNEL};
    use crate::processing::sender::video_provider::VideoProvider;
    use crate::telegram::fake::{Call, FakeTelegram, Sent};
    use crate::telegram::{PhotoSource, SentMessage, TelegramApi, TelegramError};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn database(videos: &[&str]) -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_channel(Channel::new(CHANNEL, "Channel", "url", Utc::now()));
        let base = Utc::now() - Duration::hours(1);
        for (i, id) in videos.iter().enumerate() {
            db.insert_video(test_video(id, CHANNEL, base + Duration::minutes(i as i64)));
        }
        db
    }

    fn add_chat(db: &MemoryDatabase, chat_id: i64, videos: &[&str]) {
        db.insert_chat(Chat::new(chat_id, Utc::now()));
        for video in videos {
            db.insert_pending(chat_id, video);
        }
    }

    fn config(concurrency: usize) -> SenderConfig {
        SenderConfig {
            concurrency,
            ..SenderConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chats_take_turns() {
        let db = database(&["ytb:v1", "ytb:v2", "ytb:v3"]);
        add_chat(&db, 1, &["ytb:v1", "ytb:v2"]);
        add_chat(&db, 2, &["ytb:v1", "ytb:v2"]);
        add_chat(&db, 3, &["ytb:v3"]);
        let telegram = Arc::new(FakeTelegram::new());
        let sender = Sender::new(context(db.clone(), telegram.clone(), config(1)));

        sender.check().await.unwrap();

        let order: Vec<i64> = telegram.sent().iter().map(Sent::chat_id).collect();
        assert_eq!(order, vec![1, 2, 1, 2, 3]);
        assert!(db.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn chats_sending_the_same_video_share_one_read() {
        let db = database(&["ytb:v1"]);
        for chat_id in 1..=3 {
            add_chat(&db, chat_id, &["ytb:v1"]);
        }
        let telegram = Arc::new(FakeTelegram::new());
        let sender = Sender::new(context(db.clone(), telegram.clone(), config(3)));

        sender.check().await.unwrap();

        assert_eq!(telegram.sent().len(), 3);
        assert_eq!(db.video_reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_chat_does_not_stop_others() {
        let db = database(&["ytb:v1", "ytb:v2"]);
        add_chat(&db, 1, &["ytb:v1", "ytb:v2"]);
        add_chat(&db, 2, &["ytb:v1", "ytb:v2"]);
        let telegram = Arc::new(FakeTelegram::new());
        telegram.fail(
            1,
            Call::Photo,
            TelegramError::api(403, "Forbidden: bot was kicked from the group chat"),
        );
        let sender = Sender::new(context(db.clone(), telegram.clone(), config(2)));

        sender.check().await.unwrap();

        assert!(db.chat(1).is_none());
        let delivered: Vec<i64> = telegram.sent().iter().map(Sent::chat_id).collect();
        assert_eq!(delivered, vec![2, 2]);
        assert!(db.pending().is_empty());
    }

    /// Holds sends to one chat after its first `free_sends` until released.
    struct BlockingTelegram {
        inner: FakeTelegram,
        chat_id: i64,
        free_sends: usize,
        sends: AtomicUsize,
        release: Notify,
    }

    impl BlockingTelegram {
        fn new(chat_id: i64, free_sends: usize) -> Self {
            Self {
                inner: FakeTelegram::new(),
                chat_id,
                free_sends,
                sends: AtomicUsize::new(0),
                release: Notify::new(),
            }
        }

        async fn hold(&self, chat_id: i64) {
            if chat_id == self.chat_id && self.sends.fetch_add(1, Ordering::SeqCst) >= self.free_sends {
                self.release.notified().await;
            }
        }
    }

    #[async_trait]
    impl TelegramApi for BlockingTelegram {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<SentMessage, TelegramError> {
            self.hold(chat_id).await;
            self.inner.send_message(chat_id, text).await
        }

        async fn send_photo(
            &self,
            chat_id: i64,
            photo: PhotoSource,
            caption: &str,
        ) -> Result<SentMessage, TelegramError> {
            self.hold(chat_id).await;
            self.inner.send_photo(chat_id, photo, caption).await
        }

        async fn send_chat_action(&self, chat_id: i64) -> Result<(), TelegramError> {
            self.inner.send_chat_action(chat_id).await
        }
    }

    fn blocking_sender(
        db: &Arc<MemoryDatabase>,
        telegram: Arc<BlockingTelegram>,
        config: SenderConfig,
    ) -> Arc<Sender> {
        let ctx = Arc::new(SenderContext {
            db: db.clone(),
            telegram,
            provider: VideoProvider::new(db.clone(), config.provider_keep_alive),
            previews: Arc::new(previews()),
            config,
        });
        Arc::new(Sender::new(ctx))
    }

    fn watchdog_config(concurrency: usize) -> SenderConfig {
        SenderConfig {
            concurrency,
            activity_window: StdDuration::from_secs(10),
            lock_grace: 1,
            ..SenderConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_worker_is_abandoned() {
        let db = database(&["ytb:v1"]);
        add_chat(&db, 1, &["ytb:v1"]);
        let telegram = Arc::new(BlockingTelegram::new(1, 0));
        let sender = blocking_sender(&db, telegram, watchdog_config(10));
        let check = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.check().await })
        };

        tokio::time::sleep(StdDuration::from_secs(20)).await;
        sender.check_stuck().await.unwrap();
        check.await.unwrap().unwrap();

        assert!(db.chat(1).unwrap().send_timeout_expires_at > Utc::now());
        assert_eq!(db.pending().len(), 1);
        assert!(sender.active_chat_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_worker_survives_watchdog() {
        let db = database(&["ytb:v1"]);
        add_chat(&db, 1, &["ytb:v1"]);
        add_chat(&db, 2, &["ytb:v1"]);
        let telegram = Arc::new(BlockingTelegram::new(1, 0));
        let sender = blocking_sender(&db, telegram.clone(), watchdog_config(1));
        let check = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.check().await })
        };

        tokio::time::sleep(StdDuration::from_secs(20)).await;
        sender.check_stuck().await.unwrap();
        check.await.unwrap().unwrap();

        let delivered: Vec<i64> = telegram.inner.sent().iter().map(Sent::chat_id).collect();
        assert_eq!(delivered, vec![2]);
        assert!(db.chat(2).unwrap().send_timeout_expires_at <= Utc::now());
        assert!(db.chat(1).unwrap().send_timeout_expires_at > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refill_does_not_lock_chats() {
        let db = database(&["ytb:v1", "ytb:v2", "ytb:v3"]);
        add_chat(&db, 1, &["ytb:v1"]);
        add_chat(&db, 2, &["ytb:v1", "ytb:v2"]);
        db.fail_chat_fetch(2);
        let telegram = Arc::new(FakeTelegram::new());
        let sender = Sender::new(context(db.clone(), telegram.clone(), config(1)));

        assert!(sender.check().await.is_err());
        assert!(sender.active_chat_ids().is_empty());

        db.insert_pending(2, "ytb:v3");
        sender.check().await.unwrap();

        assert!(db.pending().is_empty());
        let delivered: Vec<i64> = telegram.sent().iter().map(Sent::chat_id).collect();
        assert_eq!(delivered, vec![1, 2, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn check_during_a_pass_picks_up_new_chats() {
        let db = database(&["ytb:v1", "ytb:v2"]);
        add_chat(&db, 1, &["ytb:v1", "ytb:v2"]);
        let telegram = Arc::new(BlockingTelegram::new(1, 1));
        let sender = blocking_sender(&db, telegram.clone(), config(2));
        let pass = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.check().await })
        };
        tokio::time::sleep(StdDuration::from_secs(1)).await;

        add_chat(&db, 3, &["ytb:v1"]);
        sender.check().await.unwrap();
        tokio::time::sleep(StdDuration::from_secs(1)).await;

        let delivered: Vec<i64> = telegram.inner.sent().iter().map(Sent::chat_id).collect();
        assert_eq!(delivered, vec![1, 3]);

        telegram.release.notify_one();
        pass.await.unwrap().unwrap();
        assert!(db.pending().is_empty());
    }

    #[tokio::test]
    async fn unreachable_chats_are_swept() {
        let db = database(&[]);
        add_chat(&db, 1, &[]);
        add_chat(&db, 2, &[]);
        add_chat(&db, 3, &[]);
        let telegram = Arc::new(FakeTelegram::new());
        telegram.fail(2, Call::Action, TelegramError::api(403, "Forbidden: user is deactivated"));
        telegram.fail(
            3,
            Call::Action,
            TelegramError {
                migrate_to_chat_id: Some(-1003),
                ..TelegramError::api(400, "Bad Request: group chat was upgraded to a supergroup chat")
            },
        );
        let sender = Sender::new(context(db.clone(), telegram, config(10)));

        sender.check_chats_exists().await.unwrap();

        assert!(db.chat(1).is_some());
        assert!(db.chat(2).is_none());
        assert!(db.chat(3).is_none());
        assert!(db.chat(-1003).is_some());
    }
}
