use std::sync::Arc;

use chrono::Utc;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::Recipient;
use teloxide::utils::command::BotCommands;

use crate::api::VideoService;
use crate::common::debounce::Trigger;
use crate::database::{Channel, ChatChanges, Database};
use crate::error::{error_code, ErrorCode, ErrorWithCode};
use crate::telegram::BotType;

const START_TEXT: &str = "Send /add with a YouTube channel link, a video link, \
a username or a search query and new videos of the channel will be posted here.";

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub(crate) enum Command {
    #[command(description = "display this text.")]
    Help,
    #[command(description = "show how to start.")]
    Start,
    #[command(description = "subscribe to a channel by link, username or search query.")]
    Add(String),
    #[command(description = "unsubscribe from a channel by id, link or query.")]
    Delete(String),
    #[command(description = "show subscriptions of this chat.")]
    List,
    #[command(description = "turn video previews on or off.")]
    Preview,
    #[command(description = "turn notifications in this chat on or off while a channel is linked.")]
    Mute,
    #[command(description = "post notifications to a Telegram channel (@username or id).")]
    SetChannel(String),
    #[command(description = "stop posting to the Telegram channel.")]
    UnsetChannel,
}

#[derive(Clone)]
pub(crate) struct ConfigParameters {
    pub(crate) db: Arc<dyn Database>,
    pub(crate) service: Arc<dyn VideoService>,
    pub(crate) checker_trigger: Trigger,
}

pub(crate) async fn run(bot: BotType, cfg: ConfigParameters) {
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        log::warn!("Failed to register bot commands: {}", e);
    }

    let handler = Update::filter_message()
        .filter_command::<Command>()
        .endpoint(answer);
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![cfg])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn answer(
    bot: BotType,
    message: Message,
    command: Command,
    cfg: ConfigParameters,
) -> anyhow::Result<()> {
    let chat_id = message.chat.id.0;
    log::info!("Chat {} sent {:?}", chat_id, command);

    let result = match command {
        Command::SetChannel(target) if target.trim().starts_with('@') => {
            match resolve_telegram_channel(&bot, target.trim()).await {
                Ok(channel_id) => execute(&cfg, chat_id, Command::SetChannel(channel_id.to_string())).await,
                Err(e) => Err(e),
            }
        }
        command => execute(&cfg, chat_id, command).await,
    };

    let reply = match result {
        Ok(reply) => reply,
        Err(e) => match error_code(&e) {
            Some(code) => code.user_message().to_string(),
            None => {
                log::error!("Command of chat {} failed: {:#}", chat_id, e);
                "Unfortunately, your request failed. Please, try again later.".to_string()
            }
        },
    };
    bot.send_message(message.chat.id, reply)
        .disable_web_page_preview(true)
        .await?;
    Ok(())
}

async fn resolve_telegram_channel(bot: &BotType, username: &str) -> anyhow::Result<i64> {
    match bot
        .get_chat(Recipient::ChannelUsername(username.to_string()))
        .await
    {
        Ok(chat) => Ok(chat.id.0),
        Err(e) => {
            log::debug!("Failed to resolve {}: {}", username, e);
            Err(ErrorWithCode::new(ErrorCode::ChatNotFound, username).into())
        }
    }
}

/// Runs a command for a chat and returns the reply text.
pub(crate) async fn execute(
    cfg: &ConfigParameters,
    chat_id: i64,
    command: Command,
) -> anyhow::Result<String> {
    let db = &cfg.db;
    match command {
        Command::Help => Ok(Command::descriptions().to_string()),
        Command::Start => {
            db.ensure_chat(chat_id).await?;
            Ok(START_TEXT.to_string())
        }
        Command::Add(query) => {
            let found = cfg.service.resolve_channel(query.trim()).await?;
            db.ensure_chat(chat_id).await?;
            let channel = db
                .ensure_channel(Channel::new(&found.id, &found.title, &found.url, Utc::now()))
                .await?;
            if db.subscribe_chat(chat_id, &channel.id).await? {
                log::info!("Chat {} subscribed to {}", chat_id, channel.id);
                cfg.checker_trigger.fire();
                Ok(format!("Subscribed to {}\n{}", channel.title, channel.url))
            } else {
                Ok(format!("Already subscribed to {}", channel.title))
            }
        }
        Command::Delete(query) => {
            let query = query.trim();
            let channel_id = if cfg.service.api().unwrap_id(query).is_ok() {
                query.to_string()
            } else {
                cfg.service.resolve_channel(query).await?.id
            };
            if db.unsubscribe_chat(chat_id, &channel_id).await? {
                let left = db.count_chat_subscriptions(chat_id).await?;
                Ok(format!("Unsubscribed from {}. Subscriptions left: {}", channel_id, left))
            } else {
                Err(ErrorWithCode::new(ErrorCode::ChannelNotFound, channel_id).into())
            }
        }
        Command::List => {
            let channels = db.get_channels_by_chat_id(chat_id).await?;
            if channels.is_empty() {
                return Ok("This chat has no subscriptions yet.".to_string());
            }
            Ok(channels
                .iter()
                .map(|c| format!("{} ({})\n{}", c.title, c.id, c.url))
                .collect::<Vec<_>>()
                .join("\n\n"))
        }
        Command::Preview => {
            let chat = db.ensure_chat(chat_id).await?;
            let is_hide_preview = !chat.is_hide_preview;
            let changes = ChatChanges {
                is_hide_preview: Some(is_hide_preview),
                ..Default::default()
            };
            db.update_chat(chat_id, &changes).await?;
            Ok(if is_hide_preview {
                "Previews are off."
            } else {
                "Previews are on."
            }
            .to_string())
        }
        Command::Mute => {
            let chat = db.ensure_chat(chat_id).await?;
            if chat.channel_id.is_none() {
                return Ok("Link a Telegram channel with /setchannel first.".to_string());
            }
            let is_muted = !chat.is_muted;
            let changes = ChatChanges {
                is_muted: Some(is_muted),
                ..Default::default()
            };
            db.update_chat(chat_id, &changes).await?;
            Ok(if is_muted {
                "Notifications go only to the linked channel."
            } else {
                "Notifications go to this chat and the linked channel."
            }
            .to_string())
        }
        Command::SetChannel(target) => {
            let channel_id: i64 = target
                .trim()
                .parse()
                .map_err(|_| ErrorWithCode::new(ErrorCode::ChatNotFound, target.trim()))?;
            db.ensure_chat(chat_id).await?;
            db.link_chat_channel(chat_id, channel_id).await?;
            Ok(format!("Notifications will be posted to {}", channel_id))
        }
        Command::UnsetChannel => {
            let linked = db
                .get_chat_by_id(chat_id)
                .await?
                .and_then(|chat| chat.channel_id);
            match linked {
                Some(channel_id) => {
                    db.unlink_chat_channel(chat_id).await?;
                    Ok(format!("Telegram channel {} is unlinked.", channel_id))
                }
                None => Ok("No Telegram channel is linked.".to_string()),
            }
        }
    }
}
