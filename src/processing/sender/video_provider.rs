use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::database::{Channel, Database, Video};
use crate::error::{ErrorCode, ErrorWithCode};

type LoadResult = Result<Option<Arc<VideoAndChannel>>, Arc<anyhow::Error>>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Video row with the channel it was delivered for.
pub(crate) struct VideoAndChannel {
    pub(crate) video: Video,
    pub(crate) channel: Channel,
    preview_file_id: Mutex<Option<String>>,
}

impl VideoAndChannel {
    fn new(video: Video, channel: Channel) -> Self {
        let preview_file_id = Mutex::new(video.telegram_preview_file_id.clone());
        Self {
            video,
            channel,
            preview_file_id,
        }
    }

    pub(crate) fn preview_file_id(&self) -> Option<String> {
        self.preview_file_id.lock().ok().and_then(|id| id.clone())
    }

    pub(crate) fn set_preview_file_id(&self, file_id: &str) {
        if let Ok(mut current) = self.preview_file_id.lock() {
            *current = Some(file_id.to_string());
        }
    }
}

struct Entry {
    load: SharedLoad,
    use_count: usize,
    /// Bumped on every acquire so a pending eviction can tell it is stale.
    generation: u64,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// Shares video lookups between chats sending the same video at the same
/// time and keeps the result around shortly after the last user is done.
pub(crate) struct VideoProvider {
    db: Arc<dyn Database>,
    keep_alive: Duration,
    entries: Entries,
}

impl VideoProvider {
    pub(crate) fn new(db: Arc<dyn Database>, keep_alive: Duration) -> Self {
        Self {
            db,
            keep_alive,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn load(db: Arc<dyn Database>, id: String) -> SharedLoad {
        load_video(db, id).boxed().shared()
    }

    /// Fails with `VIDEO_NOT_FOUND` when the video or its channel no longer exists.
    pub(crate) async fn acquire(&self, id: &str) -> anyhow::Result<VideoLease> {
        let load = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| anyhow::anyhow!("video cache is poisoned"))?;
            let entry = entries.entry(id.to_string()).or_insert_with(|| Entry {
                load: Self::load(self.db.clone(), id.to_string()),
                use_count: 0,
                generation: 0,
            });
            entry.use_count += 1;
            entry.generation += 1;
            entry.load.clone()
        };

        match load.await {
            Ok(Some(value)) => Ok(VideoLease {
                id: id.to_string(),
                value,
                entries: self.entries.clone(),
                keep_alive: self.keep_alive,
            }),
            Ok(None) => {
                release(&self.entries, id, self.keep_alive);
                Err(ErrorWithCode::new(ErrorCode::VideoNotFound, id).into())
            }
            Err(e) => {
                if let Ok(mut entries) = self.entries.lock() {
                    let failed = match entries.get_mut(id) {
                        Some(entry) => {
                            entry.use_count = entry.use_count.saturating_sub(1);
                            matches!(entry.load.peek(), Some(Err(_)))
                        }
                        None => false,
                    };
                    if failed {
                        entries.remove(id);
                    }
                }
                Err(anyhow::anyhow!("failed to load video {}: {:#}", id, e))
            }
        }
    }
}

async fn load_video(db: Arc<dyn Database>, id: String) -> LoadResult {
    let video = match db.get_video_by_id(&id).await.map_err(Arc::new)? {
        Some(video) => video,
        None => return Ok(None),
    };
    let channel = match db
        .get_channel_by_id(&video.channel_id)
        .await
        .map_err(Arc::new)?
    {
        Some(channel) => channel,
        None => return Ok(None),
    };
    Ok(Some(Arc::new(VideoAndChannel::new(video, channel))))
}

fn release(entries: &Entries, id: &str, keep_alive: Duration) {
    let generation = {
        let mut guard = match entries.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let entry = match guard.get_mut(id) {
            Some(entry) => entry,
            None => return,
        };
        entry.use_count = entry.use_count.saturating_sub(1);
        if entry.use_count > 0 {
            return;
        }
        entry.generation
    };

    let evict = {
        let entries = entries.clone();
        let id = id.to_string();
        move || {
            if let Ok(mut guard) = entries.lock() {
                let idle = guard
                    .get(&id)
                    .map_or(false, |e| e.use_count == 0 && e.generation == generation);
                if idle {
                    guard.remove(&id);
                }
            }
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(keep_alive).await;
                evict();
            });
        }
        Err(_) => evict(),
    }
}

pub(crate) struct VideoLease {
    id: String,
    value: Arc<VideoAndChannel>,
    entries: Entries,
    keep_alive: Duration,
}

impl Deref for VideoLease {
    type Target = VideoAndChannel;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl Drop for VideoLease {
    fn drop(&mut self) {
        release(&self.entries, &self.id, self.keep_alive);
    }
}
