use std::sync::Arc;
use std::time::Duration;

use teloxide::adaptors::throttle::Limits;
use teloxide::prelude::*;

mod api;
mod common;
mod config;
mod database;
mod error;
mod processing;
mod pubsub;
mod regexp;
mod telegram;

use crate::api::youtube::YoutubeApi;
use crate::api::VideoService;
use crate::common::debounce::{run_debounced, Trigger};
use crate::config::{Config, FromEnv};
use crate::database::{Database, MongoDatabase};
use crate::processing::bot::ConfigParameters;
use crate::processing::checker::{AdminAlert, Checker};
use crate::processing::feed_listener::FeedListener;
use crate::processing::run_periodically;
use crate::processing::sender::chat_sender::SenderContext;
use crate::processing::sender::preview::HttpPreviewLoader;
use crate::processing::sender::video_provider::VideoProvider;
use crate::processing::sender::Sender;
use crate::pubsub::hub::HubClient;
use crate::telegram::{TelegramApi, TelegramClient};

const DEBOUNCE_DELAY: Duration = Duration::from_secs(1);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const SENDER_INTERVAL: Duration = Duration::from_secs(60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const RENEW_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    pretty_env_logger::init();
    if let Err(e) = run().await {
        log::error!("Bot stopped with an error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let db: Arc<dyn Database> = Arc::new(
        MongoDatabase::from_connection_string(&config.mongo_con_string, &config.mongo_database)
            .await?,
    );
    let service: Arc<dyn VideoService> = Arc::new(YoutubeApi::new(
        &config.youtube_api_key,
        config.checker.concurrency,
    )?);
    let bot = Bot::new(&config.telegram_token).throttle(Limits::default());
    let telegram: Arc<dyn TelegramApi> = Arc::new(TelegramClient::new(bot.clone()));

    let checker_trigger = Trigger::new();
    let sender_trigger = Trigger::new();

    let alert = config.admin_id.map(|admin_id| AdminAlert {
        telegram: telegram.clone(),
        admin_id,
    });
    let checker = Arc::new(Checker::new(
        db.clone(),
        service.clone(),
        config.checker.clone(),
        sender_trigger.clone(),
        alert,
    ));

    let sender = Arc::new(Sender::new(Arc::new(SenderContext {
        db: db.clone(),
        telegram: telegram.clone(),
        provider: VideoProvider::new(db.clone(), config.sender.provider_keep_alive),
        previews: Arc::new(HttpPreviewLoader::new()?),
        config: config.sender.clone(),
    })));

    let feed_listener = match &config.pubsub {
        Some(pubsub) => {
            let batch_trigger = Trigger::new();
            let listener = Arc::new(FeedListener::new(
                db.clone(),
                Arc::new(HubClient::new(pubsub)?),
                pubsub.clone(),
                checker_trigger.clone(),
                batch_trigger.clone(),
            ));
            spawn_feed_listener(listener.clone(), batch_trigger);
            Some(listener)
        }
        None => {
            log::info!("PUBSUB_CALLBACK_URL is not set, push notifications are disabled");
            None
        }
    };

    spawn_checker(checker, checker_trigger.clone(), config.checker.interval, feed_listener);
    spawn_sender(sender, sender_trigger);

    log::info!("Starting command dispatcher");
    processing::bot::run(
        bot,
        ConfigParameters {
            db,
            service,
            checker_trigger,
        },
    )
    .await;
    Ok(())
}

fn spawn_checker(
    checker: Arc<Checker>,
    trigger: Trigger,
    interval: Duration,
    feed_listener: Option<Arc<FeedListener>>,
) {
    {
        let checker = checker.clone();
        tokio::spawn(async move {
            run_periodically("check", interval, || checker.check()).await
        });
    }
    {
        let checker = checker.clone();
        tokio::spawn(async move {
            run_debounced(trigger, DEBOUNCE_DELAY, || async {
                if let Err(e) = checker.check().await {
                    log::error!("Triggered check failed: {:#}", e);
                }
            })
            .await
        });
    }
    {
        let checker = checker.clone();
        tokio::spawn(async move {
            run_periodically("channels existence check", DAY, || checker.check_channels_exists())
                .await
        });
    }
    tokio::spawn(async move {
        run_periodically("clean", HOUR, || async {
            let removed = checker.clean().await?;
            if let Some(listener) = &feed_listener {
                listener.unsubscribe_channels(&removed).await;
            }
            Ok::<(), anyhow::Error>(())
        })
        .await
    });
}

fn spawn_feed_listener(listener: Arc<FeedListener>, batch_trigger: Trigger) {
    {
        let listener = listener.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.serve().await {
                log::error!("Push listener stopped: {:#}", e);
            }
        });
    }
    {
        let listener = listener.clone();
        tokio::spawn(async move {
            run_debounced(batch_trigger, DEBOUNCE_DELAY, || async {
                if let Err(e) = listener.process_batch().await {
                    log::error!("Failed to process pushed videos: {:#}", e);
                }
            })
            .await
        });
    }
    {
        let listener = listener.clone();
        tokio::spawn(async move {
            run_periodically("subscriptions renewal", RENEW_INTERVAL, || {
                listener.renew_subscriptions()
            })
            .await
        });
    }
    tokio::spawn(async move {
        run_periodically("push feed cleanup", HOUR, || listener.clean_feeds()).await
    });
}

fn spawn_sender(sender: Arc<Sender>, trigger: Trigger) {
    {
        let sender = sender.clone();
        tokio::spawn(async move {
            run_debounced(trigger, DEBOUNCE_DELAY, || async {
                if let Err(e) = sender.check().await {
                    log::error!("Triggered send failed: {:#}", e);
                }
            })
            .await
        });
    }
    {
        let sender = sender.clone();
        tokio::spawn(async move {
            run_periodically("send", SENDER_INTERVAL, || sender.check()).await
        });
    }
    {
        let sender = sender.clone();
        tokio::spawn(async move {
            run_periodically("stuck workers check", WATCHDOG_INTERVAL, || sender.check_stuck())
                .await
        });
    }
    tokio::spawn(async move {
        run_periodically("chats existence check", DAY, || sender.check_chats_exists()).await
    });
}
