use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    ChannelByUrlNotFound,
    ChannelByVideoIdNotFound,
    ChannelByUserNotFound,
    ChannelByQueryNotFound,
    QueryIsEmpty,
    IncorrectChannelId,
    ChannelNotFound,
    VideoNotFound,
    ChatNotFound,
    ChannelAlreadyLinked,
}

impl ErrorCode {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ChannelByUrlNotFound => "CHANNEL_BY_URL_NOT_FOUND",
            ErrorCode::ChannelByVideoIdNotFound => "CHANNEL_BY_VIDEO_ID_NOT_FOUND",
            ErrorCode::ChannelByUserNotFound => "CHANNEL_BY_USER_NOT_FOUND",
            ErrorCode::ChannelByQueryNotFound => "CHANNEL_BY_QUERY_NOT_FOUND",
            ErrorCode::QueryIsEmpty => "QUERY_IS_EMPTY",
            ErrorCode::IncorrectChannelId => "INCORRECT_CHANNEL_ID",
            ErrorCode::ChannelNotFound => "CHANNEL_NOT_FOUND",
            ErrorCode::VideoNotFound => "VIDEO_NOT_FOUND",
            ErrorCode::ChatNotFound => "CHAT_NOT_FOUND",
            ErrorCode::ChannelAlreadyLinked => "CHANNEL_ALREADY_LINKED",
        }
    }

    pub(crate) fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::ChannelByUrlNotFound => "Channel is not found by this link.",
            ErrorCode::ChannelByVideoIdNotFound => "Channel is not found by this video link.",
            ErrorCode::ChannelByUserNotFound => "Channel is not found by this username.",
            ErrorCode::ChannelByQueryNotFound => "Nothing is found for this query.",
            ErrorCode::QueryIsEmpty => "Query is empty. Send a channel link or a search query.",
            ErrorCode::IncorrectChannelId => "Channel id is incorrect.",
            ErrorCode::ChannelNotFound => "Channel is not found.",
            ErrorCode::VideoNotFound => "Video is not found.",
            ErrorCode::ChatNotFound => "Telegram channel is not found or the bot is not an admin there.",
            ErrorCode::ChannelAlreadyLinked => "This Telegram channel is already linked to another chat.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected failure with a code the presentation layer turns into a precise message.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub(crate) struct ErrorWithCode {
    pub(crate) code: ErrorCode,
    pub(crate) message: String,
}

impl ErrorWithCode {
    pub(crate) fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub(crate) fn error_code(error: &anyhow::Error) -> Option<ErrorCode> {
    error.downcast_ref::<ErrorWithCode>().map(|e| e.code)
}
