use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::common::retry::retry;

const API_URL: &str = "https://www.googleapis.com/youtube/v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) enum Request<'a> {
    PlaylistItems {
        playlist_id: &'a str,
        page_token: Option<&'a str>,
        max_results: u8,
    },
    Videos(&'a [String]),
    Channels(&'a [String]),
    ChannelById(&'a str),
    ChannelByUsername(&'a str),
    ChannelByHandle(&'a str),
    SearchChannel(&'a str),
}

impl<'a> Request<'a> {
    fn method(&self) -> &'static str {
        match self {
            Request::PlaylistItems { .. } => "playlistItems",
            Request::Videos(_) => "videos",
            Request::Channels(_)
            | Request::ChannelById(_)
            | Request::ChannelByUsername(_)
            | Request::ChannelByHandle(_) => "channels",
            Request::SearchChannel(_) => "search",
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Request::PlaylistItems {
                playlist_id,
                page_token,
                max_results,
            } => {
                let mut query = vec![
                    ("part", "contentDetails".to_string()),
                    ("playlistId", playlist_id.to_string()),
                    ("maxResults", max_results.to_string()),
                ];
                if let Some(token) = page_token {
                    query.push(("pageToken", token.to_string()));
                }
                query
            }
            Request::Videos(ids) => vec![
                ("part", "snippet,contentDetails".to_string()),
                ("id", ids.join(",")),
                ("maxResults", "50".to_string()),
            ],
            Request::Channels(ids) => vec![
                ("part", "id".to_string()),
                ("id", ids.join(",")),
                ("maxResults", "50".to_string()),
            ],
            Request::ChannelById(id) => {
                vec![("part", "snippet".to_string()), ("id", id.to_string())]
            }
            Request::ChannelByUsername(username) => vec![
                ("part", "snippet".to_string()),
                ("forUsername", username.to_string()),
            ],
            Request::ChannelByHandle(handle) => vec![
                ("part", "snippet".to_string()),
                ("forHandle", handle.to_string()),
            ],
            Request::SearchChannel(query) => vec![
                ("part", "snippet".to_string()),
                ("type", "channel".to_string()),
                ("maxResults", "1".to_string()),
                ("q", query.to_string()),
            ],
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("YouTube API error {status}: {message} ({reasons:?})")]
pub(crate) struct YoutubeApiError {
    pub(crate) status: u16,
    pub(crate) reasons: Vec<String>,
    pub(crate) message: String,
}

impl YoutubeApiError {
    fn has_reason(&self, reason: &str) -> bool {
        self.reasons.iter().any(|r| r == reason)
    }

    pub(crate) fn is_quota_exceeded(&self) -> bool {
        self.has_reason("quotaExceeded") || self.has_reason("dailyLimitExceeded")
    }

    pub(crate) fn is_backend_error(&self) -> bool {
        self.has_reason("backendError")
    }

    pub(crate) fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub(crate) fn is_transient(&self) -> bool {
        !self.is_quota_exceeded()
            && (self.status >= 500
                || self.is_backend_error()
                || self.has_reason("rateLimitExceeded"))
    }
}

pub(crate) fn is_quota_error(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<YoutubeApiError>()
        .map_or(false, |e| e.is_quota_exceeded())
}

pub(crate) fn is_backend_error(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<YoutubeApiError>()
        .map_or(false, |e| e.is_backend_error())
}

fn is_transient(error: &anyhow::Error) -> bool {
    if let Some(api_error) = error.downcast_ref::<YoutubeApiError>() {
        return api_error.is_transient();
    }
    if let Some(http_error) = error.downcast_ref::<reqwest::Error>() {
        return http_error.is_timeout() || http_error.is_connect() || http_error.is_request();
    }
    false
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

fn parse_error(status: StatusCode, text: &str) -> YoutubeApiError {
    match serde_json::from_str::<ErrorResponse>(text) {
        Ok(response) => YoutubeApiError {
            status: status.as_u16(),
            reasons: response.error.errors.into_iter().map(|e| e.reason).collect(),
            message: response.error.message,
        },
        Err(_) => YoutubeApiError {
            status: status.as_u16(),
            reasons: Vec::new(),
            message: text.chars().take(256).collect(),
        },
    }
}

pub(crate) struct ApiDataFetcher {
    client: Client,
    api_url: String,
    api_key: String,
}

impl ApiDataFetcher {
    pub(crate) fn new(api_key: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(ApiDataFetcher {
            client,
            api_url: API_URL.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub(crate) async fn get_data<'a, T>(&self, request: Request<'a>) -> anyhow::Result<T>
    where
        for<'b> T: Deserialize<'b>,
    {
        retry(
            RETRY_ATTEMPTS,
            RETRY_DELAY,
            || self.get_data_once(&request),
            is_transient,
        )
        .await
    }

    async fn get_data_once<'a, T>(&self, request: &Request<'a>) -> anyhow::Result<T>
    where
        for<'b> T: Deserialize<'b>,
    {
        let url = format!("{}/{}", self.api_url, request.method());
        log::debug!("Requesting data from {}", &url);
        let response = self
            .client
            .get(&url)
            .query(&request.query())
            .query(&[("key", &self.api_key)])
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to decode json response from {}: {}\ndata is:\n{}",
                    url,
                    e,
                    text
                )
            })
        } else {
            let error = parse_error(status, &text);
            if error.is_quota_exceeded() {
                log::error!("YouTube API quota exceeded: {}", error.message);
            }
            Err(error.into())
        }
    }
}
