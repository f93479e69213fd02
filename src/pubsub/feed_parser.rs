use anyhow::anyhow;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FeedEntry {
    Video {
        video_id: String,
        channel_id: String,
        published_at: DateTime<Utc>,
    },
    /// Tombstone sent when a video is removed or made private.
    Deleted { video_id: String },
}

#[derive(Copy, Clone)]
enum Field {
    VideoId,
    ChannelId,
    Published,
}

#[derive(Default)]
struct EntryBuilder {
    video_id: Option<String>,
    channel_id: Option<String>,
    published: Option<String>,
}

impl EntryBuilder {
    fn build(self) -> anyhow::Result<FeedEntry> {
        let video_id = self.video_id.ok_or_else(|| anyhow!("entry without yt:videoId"))?;
        let channel_id = self
            .channel_id
            .ok_or_else(|| anyhow!("entry {} without yt:channelId", video_id))?;
        let published = self
            .published
            .ok_or_else(|| anyhow!("entry {} without published", video_id))?;
        let published_at = DateTime::parse_from_rfc3339(&published)?.with_timezone(&Utc);
        Ok(FeedEntry::Video {
            video_id,
            channel_id,
            published_at,
        })
    }
}

fn deleted_entry(element: &BytesStart) -> anyhow::Result<FeedEntry> {
    let reference = element
        .try_get_attribute("ref")?
        .ok_or_else(|| anyhow!("deleted entry without ref"))?
        .unescape_value()?
        .to_string();
    let video_id = reference
        .strip_prefix("yt:video:")
        .unwrap_or(&reference)
        .to_string();
    Ok(FeedEntry::Deleted { video_id })
}

/// Parses the Atom document the hub posts for a topic update.
pub(crate) fn parse_feed(xml: &str) -> anyhow::Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut field: Option<Field> = None;
    loop {
        match reader.read_event()? {
            Event::Start(element) => match element.name().as_ref() {
                b"entry" => entry = Some(EntryBuilder::default()),
                b"yt:videoId" => field = Some(Field::VideoId),
                b"yt:channelId" => field = Some(Field::ChannelId),
                b"published" => field = Some(Field::Published),
                b"at:deleted-entry" => entries.push(deleted_entry(&element)?),
                _ => field = None,
            },
            Event::Empty(element) => {
                if element.name().as_ref() == b"at:deleted-entry" {
                    entries.push(deleted_entry(&element)?);
                }
            }
            Event::Text(text) => {
                if let (Some(builder), Some(current)) = (entry.as_mut(), field) {
                    let value = text.unescape()?.trim().to_string();
                    match current {
                        Field::VideoId => builder.video_id = Some(value),
                        Field::ChannelId => builder.channel_id = Some(value),
                        Field::Published => builder.published = Some(value),
                    }
                }
            }
            Event::End(element) => {
                field = None;
                if element.name().as_ref() == b"entry" {
                    if let Some(builder) = entry.take() {
                        entries.push(builder.build()?);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}
