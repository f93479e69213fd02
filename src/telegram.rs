#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use teloxide::adaptors::Throttle;
use teloxide::payloads::{SendMessageSetters, SendPhotoSetters};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, ParseMode};
use teloxide::RequestError;

use crate::regexp;

/// Structured failure of a Bot API call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("telegram error {code}: {description}")]
pub(crate) struct TelegramError {
    pub(crate) code: u16,
    pub(crate) description: String,
    pub(crate) migrate_to_chat_id: Option<i64>,
    pub(crate) retry_after: Option<u32>,
    pub(crate) is_network: bool,
}

impl TelegramError {
    pub(crate) fn api(code: u16, description: &str) -> Self {
        Self {
            code,
            description: description.to_string(),
            migrate_to_chat_id: None,
            retry_after: None,
            is_network: false,
        }
    }

    pub(crate) fn kind(&self) -> TelegramErrorKind {
        if self.migrate_to_chat_id.is_some() {
            return TelegramErrorKind::ChatMigrated;
        }
        if self.retry_after.is_some() {
            return TelegramErrorKind::RateLimited;
        }
        if self.is_network {
            return TelegramErrorKind::Transient;
        }
        if let Some((_, kind)) = regexp::TELEGRAM_ERRORS
            .iter()
            .find(|(pattern, _)| pattern.is_match(&self.description))
        {
            return *kind;
        }
        match self.code {
            403 => TelegramErrorKind::ChatUnreachable,
            429 => TelegramErrorKind::RateLimited,
            code if code >= 500 => TelegramErrorKind::Transient,
            _ => TelegramErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TelegramErrorKind {
    /// Blocked, kicked, deactivated or deleted: the chat is gone for good.
    ChatUnreachable,
    /// Group was upgraded to a supergroup with a new id.
    ChatMigrated,
    /// Chat is reachable but photos are not allowed.
    PhotoForbidden,
    /// Forum topic was removed; only the current message is affected.
    ThreadGone,
    /// Telegram could not fetch the photo by url or file id.
    PhotoUrlRejected,
    RateLimited,
    Transient,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PhotoSource {
    Url(String),
    FileId(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SentMessage {
    /// File id of the largest photo size, when a photo was sent.
    pub(crate) photo_file_id: Option<String>,
}

#[async_trait]
pub(crate) trait TelegramApi: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<SentMessage, TelegramError>;

    async fn send_photo(
        &self,
        chat_id: i64,
        photo: PhotoSource,
        caption: &str,
    ) -> Result<SentMessage, TelegramError>;

    async fn send_chat_action(&self, chat_id: i64) -> Result<(), TelegramError>;
}

pub(crate) type BotType = Throttle<Bot>;

pub(crate) struct TelegramClient {
    bot: BotType,
}

impl TelegramClient {
    pub(crate) fn new(bot: BotType) -> Self {
        Self { bot }
    }
}

fn error_code(description: &str) -> u16 {
    if description.starts_with("Forbidden") {
        403
    } else if description.starts_with("Too Many Requests") {
        429
    } else if description.starts_with("Bad Request") {
        400
    } else {
        0
    }
}

impl From<RequestError> for TelegramError {
    fn from(error: RequestError) -> Self {
        match error {
            RequestError::Api(api_error) => {
                let description = api_error.to_string();
                TelegramError::api(error_code(&description), &description)
            }
            RequestError::MigrateToChatId(chat_id) => TelegramError {
                migrate_to_chat_id: Some(chat_id),
                ..TelegramError::api(400, "Bad Request: group chat was upgraded to a supergroup chat")
            },
            RequestError::RetryAfter(seconds) => TelegramError {
                retry_after: Some(seconds.as_secs() as u32),
                ..TelegramError::api(429, "Too Many Requests: retry later")
            },
            RequestError::Network(network_error) => TelegramError {
                is_network: true,
                ..TelegramError::api(0, &network_error.to_string())
            },
            other => TelegramError {
                is_network: matches!(other, RequestError::Io(_)),
                ..TelegramError::api(0, &other.to_string())
            },
        }
    }
}

fn largest_photo_file_id(message: &Message) -> Option<String> {
    message
        .photo()
        .and_then(|sizes| sizes.iter().max_by_key(|size| size.width * size.height))
        .map(|size| size.file.id.clone())
}

#[async_trait]
impl TelegramApi for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<SentMessage, TelegramError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(SentMessage::default())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo: PhotoSource,
        caption: &str,
    ) -> Result<SentMessage, TelegramError> {
        let file = match photo {
            PhotoSource::Url(url) => {
                let url = url::Url::parse(&url).map_err(|e| {
                    TelegramError::api(400, &format!("Bad Request: wrong file identifier/HTTP URL specified ({})", e))
                })?;
                InputFile::url(url)
            }
            PhotoSource::FileId(file_id) => InputFile::file_id(file_id),
            PhotoSource::Bytes(bytes) => InputFile::memory(bytes).file_name("preview.jpg"),
        };
        let message = self
            .bot
            .send_photo(ChatId(chat_id), file)
            .caption(caption)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(SentMessage {
            photo_file_id: largest_photo_file_id(&message),
        })
    }

    async fn send_chat_action(&self, chat_id: i64) -> Result<(), TelegramError> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await?;
        Ok(())
    }
}
