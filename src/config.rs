use std::env;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

pub(crate) trait FromEnv: Sized {
    fn from_env() -> anyhow::Result<Self>;
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("{} env variable doesn't exist", name))
}

fn optional<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) if !value.is_empty() => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse {}={}: {}", name, value, e)),
        _ => Ok(default),
    }
}

fn seconds(name: &str, default: i64) -> anyhow::Result<Duration> {
    Ok(Duration::seconds(optional(name, default)?))
}

#[derive(Debug, Clone)]
pub(crate) struct CheckerConfig {
    pub(crate) interval: StdDuration,
    pub(crate) batch_size: usize,
    pub(crate) concurrency: usize,
    /// Max age of `lastSyncAt` before a channel is claimed again.
    pub(crate) sync_interval: Duration,
    pub(crate) full_sync_interval: Duration,
    pub(crate) full_sync_depth: Duration,
    pub(crate) sync_lease: Duration,
    /// Videos older than this are never fanned out.
    pub(crate) video_max_age: Duration,
    pub(crate) video_retention: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(300),
            batch_size: 50,
            concurrency: 10,
            sync_interval: Duration::hours(1),
            full_sync_interval: Duration::hours(4),
            full_sync_depth: Duration::days(7),
            sync_lease: Duration::minutes(5),
            video_max_age: Duration::days(3),
            video_retention: Duration::days(14),
        }
    }
}

impl FromEnv for CheckerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let default = Self::default();
        let mut config = Self {
            interval: StdDuration::from_secs(optional(
                "CHECKER_INTERVAL_SECS",
                default.interval.as_secs(),
            )?),
            batch_size: optional("CHECKER_BATCH_SIZE", default.batch_size)?,
            concurrency: optional("CHECKER_CONCURRENCY", default.concurrency)?,
            sync_interval: seconds("CHECKER_SYNC_INTERVAL_SECS", 3600)?,
            full_sync_interval: seconds("CHECKER_FULL_SYNC_INTERVAL_SECS", 14400)?,
            full_sync_depth: seconds("CHECKER_FULL_SYNC_DEPTH_SECS", 604800)?,
            sync_lease: seconds("CHECKER_SYNC_LEASE_SECS", 300)?,
            video_max_age: seconds("CHECKER_VIDEO_MAX_AGE_SECS", 259200)?,
            video_retention: seconds("VIDEO_RETENTION_SECS", 1209600)?,
        };
        // Deleted videos would be rediscovered by a full check and delivered again.
        if config.video_retention <= config.full_sync_depth {
            log::warn!(
                "VIDEO_RETENTION_SECS must exceed the full check depth, using {} days",
                (config.full_sync_depth + Duration::days(1)).num_days()
            );
            config.video_retention = config.full_sync_depth + Duration::days(1);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SenderConfig {
    pub(crate) concurrency: usize,
    pub(crate) page_size: i64,
    pub(crate) failure_backoff: Duration,
    pub(crate) activity_window: StdDuration,
    pub(crate) lock_grace: u32,
    pub(crate) provider_keep_alive: StdDuration,
    pub(crate) send_attempts: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            page_size: 10,
            failure_backoff: Duration::minutes(5),
            activity_window: StdDuration::from_secs(300),
            lock_grace: 3,
            provider_keep_alive: StdDuration::from_secs(5),
            send_attempts: 3,
        }
    }
}

impl FromEnv for SenderConfig {
    fn from_env() -> anyhow::Result<Self> {
        let default = Self::default();
        Ok(Self {
            concurrency: optional("SENDER_CONCURRENCY", default.concurrency)?.max(1),
            page_size: optional("SENDER_PAGE_SIZE", default.page_size)?.max(1),
            failure_backoff: seconds("SENDER_FAILURE_BACKOFF_SECS", 300)?,
            activity_window: StdDuration::from_secs(optional(
                "SENDER_ACTIVITY_WINDOW_SECS",
                default.activity_window.as_secs(),
            )?),
            lock_grace: optional("SENDER_LOCK_GRACE", default.lock_grace)?,
            ..default
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PubSubConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: String,
    pub(crate) callback_url: String,
    pub(crate) hub_url: String,
    pub(crate) secret: Option<String>,
    pub(crate) lease_seconds: i64,
    pub(crate) renew_lead: Duration,
    pub(crate) renew_lease: Duration,
    pub(crate) feed_retention: Duration,
}

impl PubSubConfig {
    /// Push intake is only enabled when a public callback url is configured.
    fn from_env_optional() -> anyhow::Result<Option<Self>> {
        let callback_url = match env::var("PUBSUB_CALLBACK_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => return Ok(None),
        };
        let secret = env::var("PUBSUB_SECRET").ok().filter(|s| !s.is_empty());
        Ok(Some(Self {
            host: optional("PUBSUB_HOST", "0.0.0.0".to_string())?,
            port: optional("PUBSUB_PORT", 8080)?,
            path: optional("PUBSUB_PATH", "/".to_string())?,
            callback_url,
            hub_url: optional(
                "PUBSUB_HUB_URL",
                "https://pubsubhubbub.appspot.com/subscribe".to_string(),
            )?,
            secret,
            lease_seconds: optional("PUBSUB_LEASE_SECONDS", 86400)?,
            renew_lead: Duration::hours(1),
            renew_lease: Duration::minutes(5),
            feed_retention: Duration::days(1),
        }))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) telegram_token: String,
    pub(crate) admin_id: Option<i64>,
    pub(crate) youtube_api_key: String,
    pub(crate) mongo_con_string: String,
    pub(crate) mongo_database: String,
    pub(crate) checker: CheckerConfig,
    pub(crate) sender: SenderConfig,
    pub(crate) pubsub: Option<PubSubConfig>,
}

impl FromEnv for Config {
    fn from_env() -> anyhow::Result<Self> {
        let admin_id = match env::var("TELEGRAM_ADMIN_ID") {
            Ok(id) if !id.is_empty() => Some(id.parse::<i64>()?),
            _ => None,
        };
        Ok(Self {
            telegram_token: required("TELOXIDE_TOKEN")?,
            admin_id,
            youtube_api_key: required("YOUTUBE_API_KEY")?,
            mongo_con_string: required("MONGO_CON_STRING")?,
            mongo_database: required("MONGO_DATABASE_NAME")?,
            checker: CheckerConfig::from_env()?,
            sender: SenderConfig::from_env()?,
            pubsub: PubSubConfig::from_env_optional()?,
        })
    }
}
