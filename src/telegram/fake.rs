use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::telegram::{PhotoSource, SentMessage, TelegramApi, TelegramError};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sent {
    Text { chat_id: i64, text: String },
    Photo { chat_id: i64, photo: PhotoSource, caption: String },
}

impl Sent {
    pub(crate) fn chat_id(&self) -> i64 {
        match self {
            Sent::Text { chat_id, .. } | Sent::Photo { chat_id, .. } => *chat_id,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    Text,
    Photo,
    Action,
}

/// Records deliveries and replays scripted failures per chat and call.
#[derive(Default)]
pub(crate) struct FakeTelegram {
    sent: Mutex<Vec<Sent>>,
    failures: Mutex<HashMap<(i64, Call), VecDeque<TelegramError>>>,
}

impl FakeTelegram {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail(&self, chat_id: i64, call: Call, error: TelegramError) {
        self.failures
            .lock()
            .unwrap()
            .entry((chat_id, call))
            .or_default()
            .push_back(error);
    }

    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn next_failure(&self, chat_id: i64, call: Call) -> Result<(), TelegramError> {
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(chat_id, call))
            .and_then(|errors| errors.pop_front())
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TelegramApi for FakeTelegram {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<SentMessage, TelegramError> {
        tokio::task::yield_now().await;
        self.next_failure(chat_id, Call::Text)?;
        self.sent.lock().unwrap().push(Sent::Text {
            chat_id,
            text: text.to_string(),
        });
        Ok(SentMessage::default())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo: PhotoSource,
        caption: &str,
    ) -> Result<SentMessage, TelegramError> {
        tokio::task::yield_now().await;
        self.next_failure(chat_id, Call::Photo)?;
        let photo_file_id = match &photo {
            PhotoSource::FileId(file_id) => file_id.clone(),
            _ => "uploaded-file-id".to_string(),
        };
        self.sent.lock().unwrap().push(Sent::Photo {
            chat_id,
            photo,
            caption: caption.to_string(),
        });
        Ok(SentMessage {
            photo_file_id: Some(photo_file_id),
        })
    }

    async fn send_chat_action(&self, chat_id: i64) -> Result<(), TelegramError> {
        self.next_failure(chat_id, Call::Action)
    }
}
