pub(crate) mod feed_parser;
pub(crate) mod hub;
pub(crate) mod signature;

use crate::regexp;

const TOPIC_PREFIX: &str = "https://www.youtube.com/xml/feeds/videos.xml?channel_id=";

pub(crate) fn topic_url(raw_channel_id: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, raw_channel_id)
}

/// Topic url announced by the hub in the `Link: <..>; rel="self"` header.
pub(crate) fn topic_from_link_header(header: &str) -> Option<&str> {
    regexp::LINK_HEADER_SELF
        .captures(header)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
}
