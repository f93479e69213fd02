use lazy_static::lazy_static;
use regex::Regex;

use crate::telegram::TelegramErrorKind;

lazy_static! {
    pub(crate) static ref YOUTUBE_CHANNEL_ID: Regex = Regex::new(r#"^UC[\w-]{22}$"#).unwrap();
    pub(crate) static ref YOUTUBE_CHANNEL_LINK: Regex =
        Regex::new(r#"youtube\.com/channel/(UC[\w-]{22})"#).unwrap();
    pub(crate) static ref YOUTUBE_HANDLE_LINK: Regex =
        Regex::new(r#"youtube\.com/(@[\w.\-]+)"#).unwrap();
    pub(crate) static ref YOUTUBE_CUSTOM_LINK: Regex =
        Regex::new(r#"youtube\.com/c/([^/?#\s]+)"#).unwrap();
    pub(crate) static ref YOUTUBE_USER_LINK: Regex =
        Regex::new(r#"youtube\.com/user/([^/?#\s]+)"#).unwrap();
    pub(crate) static ref YOUTUBE_VIDEO_LINKS: Vec<Regex> = vec![
        Regex::new(r#"youtu\.be/([\w-]{11})"#).unwrap(),
        Regex::new(r#"youtube\.com/watch\?(?:.*&)?v=([\w-]{11})"#).unwrap(),
        Regex::new(r#"youtube\.com/(?:shorts|live|embed)/([\w-]{11})"#).unwrap(),
    ];
    pub(crate) static ref LINK_HEADER_SELF: Regex =
        Regex::new(r#"<([^>]+)>\s*;\s*rel="?self"?"#).unwrap();

    /// Telegram error descriptions and what they mean for the chat.
    pub(crate) static ref TELEGRAM_ERRORS: Vec<(Regex, TelegramErrorKind)> = [
        (r#"bot was blocked by the user"#, TelegramErrorKind::ChatUnreachable),
        (r#"bot was kicked from the (?:channel|group|supergroup) chat"#, TelegramErrorKind::ChatUnreachable),
        (r#"bot is not a member of the (?:channel|group|supergroup) chat"#, TelegramErrorKind::ChatUnreachable),
        (r#"user is deactivated"#, TelegramErrorKind::ChatUnreachable),
        (r#"group chat was deactivated"#, TelegramErrorKind::ChatUnreachable),
        (r#"the group chat was deleted"#, TelegramErrorKind::ChatUnreachable),
        (r#"chat not found"#, TelegramErrorKind::ChatUnreachable),
        (r#"have no rights to send a message"#, TelegramErrorKind::ChatUnreachable),
        (r#"need administrator rights in the channel chat"#, TelegramErrorKind::ChatUnreachable),
        (r#"CHAT_WRITE_FORBIDDEN"#, TelegramErrorKind::ChatUnreachable),
        (r#"CHAT_RESTRICTED"#, TelegramErrorKind::ChatUnreachable),
        (r#"PEER_ID_INVALID"#, TelegramErrorKind::ChatUnreachable),
        (r#"not enough rights to send photos"#, TelegramErrorKind::PhotoForbidden),
        (r#"CHAT_SEND_PHOTOS_FORBIDDEN"#, TelegramErrorKind::PhotoForbidden),
        (r#"CHAT_SEND_MEDIA_FORBIDDEN"#, TelegramErrorKind::PhotoForbidden),
        (r#"message thread not found"#, TelegramErrorKind::ThreadGone),
        (r#"TOPIC_DELETED"#, TelegramErrorKind::ThreadGone),
        (r#"TOPIC_CLOSED"#, TelegramErrorKind::ThreadGone),
        (r#"wrong file identifier/HTTP URL specified"#, TelegramErrorKind::PhotoUrlRejected),
        (r#"failed to get HTTP URL content"#, TelegramErrorKind::PhotoUrlRejected),
        (r#"wrong type of the web page content"#, TelegramErrorKind::PhotoUrlRejected),
        (r#"IMAGE_PROCESS_FAILED"#, TelegramErrorKind::PhotoUrlRejected),
        (r#"WEBPAGE_CURL_FAILED"#, TelegramErrorKind::PhotoUrlRejected),
        (r#"WEBPAGE_MEDIA_EMPTY"#, TelegramErrorKind::PhotoUrlRejected),
        (r#"wrong remote file identifier specified"#, TelegramErrorKind::PhotoUrlRejected),
        (r#"Too Many Requests"#, TelegramErrorKind::RateLimited),
    ]
    .iter()
    .map(|(pattern, kind)| (Regex::new(pattern).unwrap(), *kind))
    .collect();
}
