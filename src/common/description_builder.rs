pub(crate) const CAPTION_SIZE_LIMIT: usize = 1024;
pub(crate) const MESSAGE_SIZE_LIMIT: usize = 4096;

pub(crate) struct DescriptionBuilder {
    channel: Option<TextedLink>,
    video: Option<TextedLink>,
    duration: Option<String>,
    size_limit: Option<usize>,
}

impl DescriptionBuilder {
    pub(crate) fn new() -> Self {
        Self {
            channel: None,
            video: None,
            duration: None,
            size_limit: None,
        }
    }

    pub(crate) fn channel(&mut self, text: &str, url: &str) -> &mut Self {
        self.channel = Some(TextedLink::new(text, url));
        self
    }

    pub(crate) fn video(&mut self, text: &str, url: &str) -> &mut Self {
        self.video = Some(TextedLink::new(text, url));
        self
    }

    pub(crate) fn duration(&mut self, duration: Option<&str>) -> &mut Self {
        self.duration = duration.map(|d| d.to_string());
        self
    }

    pub(crate) fn size_limit(&mut self, size_limit: usize) -> &mut Self {
        self.size_limit = Some(size_limit);
        self
    }

    pub(crate) fn build(&self) -> String {
        let mut description = String::new();

        if let Some(video) = &self.video {
            description.push_str("<b>");
            description.push_str(&video.create_link());
            description.push_str("</b>");
        }

        let mut footer = Vec::new();
        if let Some(channel) = &self.channel {
            footer.push(channel.create_link());
        }
        if let Some(duration) = &self.duration {
            footer.push(html_escape::encode_text(duration).to_string());
        }
        if !footer.is_empty() {
            if !description.is_empty() {
                description.push('\n');
            }
            description.push_str("<i>");
            description.push_str(&footer.join(" · "));
            description.push_str("</i>");
        }

        match self.size_limit {
            Some(size_limit) if description.chars().count() > size_limit => {
                self.build_short(size_limit)
            }
            _ => description,
        }
    }

    // Truncating markup would break the message, so the long form degrades
    // to the bare video link with a clipped title.
    fn build_short(&self, size_limit: usize) -> String {
        let end_message = "...";
        match &self.video {
            Some(video) => {
                let url_len = video.url.chars().count() + "<a href=\"\"></a>".len();
                let room = size_limit.saturating_sub(url_len + end_message.len());
                let mut text = String::new();
                let mut text_len = 0;
                let mut buf = [0u8; 4];
                for c in video.title.chars() {
                    let escaped = html_escape::encode_text(c.encode_utf8(&mut buf));
                    let escaped_len = escaped.chars().count();
                    if text_len + escaped_len > room {
                        break;
                    }
                    text.push_str(&escaped);
                    text_len += escaped_len;
                }
                format!("<a href=\"{}\">{}{}</a>", video.url, text, end_message)
            }
            None => String::new(),
        }
    }
}

struct TextedLink {
    /// Unescaped, for clipping.
    title: String,
    text: String,
    url: String,
}

impl TextedLink {
    fn new(text: &str, url: &str) -> Self {
        Self {
            title: text.to_string(),
            text: html_escape::encode_text(text).to_string(),
            url: html_escape::encode_double_quoted_attribute(url).to_string(),
        }
    }

    fn create_link(&self) -> String {
        format!(
            "<a href=\"{url}\">{text}</a>",
            text = self.text,
            url = self.url
        )
    }
}
