use std::collections::HashSet;

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, Document},
    options::{
        ClientOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
        UpdateOptions,
    },
    Client, ClientSession, Collection, Database as Db, IndexModel,
};
use serde::Deserialize;

use crate::database::{
    Channel, ChannelFeedUpdate, Chat, ChatChanges, ChatIdChannelId, ChatIdVideoId, Database,
    Subscriber, SyncResults, Video, YtPubSubFeed, BULK_SIZE,
};
use crate::error::{ErrorCode, ErrorWithCode};

const CHANNELS: &str = "channels";
const VIDEOS: &str = "videos";
const CHATS: &str = "chats";
const CHAT_ID_CHANNEL_ID: &str = "chatIdChannelId";
const CHAT_ID_VIDEO_ID: &str = "chatIdVideoId";
const YT_PUBSUB_FEEDS: &str = "ytPubSubFeeds";

fn date(value: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(value)
}

fn without_id(mut document: Document) -> Document {
    document.remove("_id");
    document
}

fn upsert() -> UpdateOptions {
    UpdateOptions::builder().upsert(true).build()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriberRow {
    channel_id: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    chat: Chat,
}

pub(crate) struct MongoDatabase {
    client: Client,
    db: Db,
}

impl MongoDatabase {
    pub(crate) async fn from_connection_string(
        con_str: &str,
        database: &str,
    ) -> Result<MongoDatabase, anyhow::Error> {
        let client_options = ClientOptions::parse(con_str).await?;
        let client = Client::with_options(client_options)?;
        let db = client.database(database);
        let database = MongoDatabase { client, db };
        database.create_indexes().await?;
        Ok(database)
    }

    async fn create_indexes(&self) -> Result<(), anyhow::Error> {
        let unique = || IndexOptions::builder().unique(true).build();
        let index = |keys: Document, options: Option<IndexOptions>| {
            IndexModel::builder().keys(keys).options(options).build()
        };

        self.edges()
            .create_indexes(
                [
                    index(doc! {"chatId": 1, "channelId": 1}, Some(unique())),
                    index(doc! {"channelId": 1}, None),
                ],
                None,
            )
            .await?;
        self.pending()
            .create_indexes(
                [
                    index(doc! {"chatId": 1, "videoId": 1}, Some(unique())),
                    index(doc! {"videoId": 1}, None),
                ],
                None,
            )
            .await?;
        self.chats()
            .create_index(
                index(
                    doc! {"channelId": 1},
                    Some(IndexOptions::builder().unique(true).sparse(true).build()),
                ),
                None,
            )
            .await?;
        self.videos()
            .create_index(index(doc! {"publishedAt": 1}, None), None)
            .await?;
        self.channels()
            .create_index(index(doc! {"syncTimeoutExpiresAt": 1}, None), None)
            .await?;
        self.feeds()
            .create_index(index(doc! {"createdAt": 1}, None), None)
            .await?;
        Ok(())
    }

    fn channels(&self) -> Collection<Channel> {
        self.db.collection(CHANNELS)
    }

    fn videos(&self) -> Collection<Video> {
        self.db.collection(VIDEOS)
    }

    fn chats(&self) -> Collection<Chat> {
        self.db.collection(CHATS)
    }

    fn edges(&self) -> Collection<ChatIdChannelId> {
        self.db.collection(CHAT_ID_CHANNEL_ID)
    }

    fn pending(&self) -> Collection<ChatIdVideoId> {
        self.db.collection(CHAT_ID_VIDEO_ID)
    }

    fn feeds(&self) -> Collection<YtPubSubFeed> {
        self.db.collection(YT_PUBSUB_FEEDS)
    }

    fn documents(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }

    async fn claim_channels(
        &self,
        limit: usize,
        filter: Document,
        update: Document,
        sort: Document,
    ) -> Result<Vec<Channel>, anyhow::Error> {
        let options = FindOneAndUpdateOptions::builder()
            .sort(sort)
            .return_document(ReturnDocument::After)
            .build();
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            match self
                .channels()
                .find_one_and_update(filter.clone(), update.clone(), options.clone())
                .await?
            {
                Some(channel) => claimed.push(channel),
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn remove_chat_rows(&self, id: i64) -> Result<(), anyhow::Error> {
        self.edges().delete_many(doc! {"chatId": id}, None).await?;
        self.pending().delete_many(doc! {"chatId": id}, None).await?;
        self.chats().delete_one(doc! {"_id": id}, None).await?;
        Ok(())
    }

    async fn ids_of(&self, collection: &str, pipeline: Vec<Document>) -> Result<Vec<Bson>, anyhow::Error> {
        let rows: Vec<Document> = self
            .documents(collection)
            .aggregate(pipeline, None)
            .await?
            .try_collect()
            .await?;
        Ok(rows.into_iter().filter_map(|mut row| row.remove("_id")).collect())
    }

    async fn write_sync_results(
        &self,
        results: &SyncResults,
        session: &mut ClientSession,
    ) -> Result<(), anyhow::Error> {
        for update in &results.channels {
            let mut set = doc! {"lastSyncAt": date(update.last_sync_at)};
            if let Some(title) = &update.title {
                set.insert("title", title.as_str());
            }
            if let Some(last_full_sync_at) = update.last_full_sync_at {
                set.insert("lastFullSyncAt", date(last_full_sync_at));
            }
            let mut modifications = doc! {"$set": set};
            if let Some(published_at) = update.last_video_published_at {
                modifications.insert("$max", doc! {"lastVideoPublishedAt": date(published_at)});
            }
            self.channels()
                .update_one_with_session(doc! {"_id": &update.id}, modifications, None, session)
                .await?;
        }

        let video_ids: Vec<&str> = results.videos.iter().map(|v| v.id.as_str()).collect();
        let mut existing = HashSet::new();
        for chunk in video_ids.chunks(BULK_SIZE) {
            let options = FindOptions::builder().projection(doc! {"_id": 1}).build();
            let mut cursor = self
                .documents(VIDEOS)
                .find_with_session(doc! {"_id": {"$in": chunk}}, options, session)
                .await?;
            let rows: Vec<Document> = cursor.stream(session).try_collect().await?;
            existing.extend(
                rows.iter()
                    .filter_map(|row| row.get_str("_id").ok().map(|id| id.to_string())),
            );
        }

        let new_videos: Vec<Video> = results
            .videos
            .iter()
            .filter(|v| !existing.contains(&v.id))
            .cloned()
            .collect();
        let inserted: HashSet<&str> = new_videos.iter().map(|v| v.id.as_str()).collect();
        for chunk in new_videos.chunks(BULK_SIZE) {
            self.videos()
                .insert_many_with_session(chunk.to_vec(), None, session)
                .await?;
        }

        let mut seen = HashSet::new();
        let rows: Vec<ChatIdVideoId> = results
            .chat_id_video_ids
            .iter()
            .filter(|row| inserted.contains(row.video_id.as_str()))
            .filter(|row| seen.insert((*row).clone()))
            .cloned()
            .collect();
        for chunk in rows.chunks(BULK_SIZE) {
            self.pending()
                .insert_many_with_session(chunk.to_vec(), None, session)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MongoDatabase {
    async fn claim_channels_for_sync(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        synced_before: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Channel>> {
        self.claim_channels(
            limit,
            doc! {
                "syncTimeoutExpiresAt": {"$lte": date(now)},
                "$or": [
                    {"hasChanges": true},
                    {"lastSyncAt": {"$lt": date(synced_before)}},
                ],
            },
            doc! {"$set": {"syncTimeoutExpiresAt": date(lease_until), "hasChanges": false}},
            doc! {"hasChanges": -1, "lastSyncAt": 1},
        )
        .await
    }

    async fn get_channel_by_id(&self, id: &str) -> anyhow::Result<Option<Channel>> {
        Ok(self.channels().find_one(doc! {"_id": id}, None).await?)
    }

    async fn get_channels_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<Channel>> {
        let cursor = self
            .channels()
            .find(doc! {"_id": {"$in": ids}}, None)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn ensure_channel(&self, channel: Channel) -> anyhow::Result<Channel> {
        let id = channel.id.clone();
        let fields = without_id(bson::to_document(&channel)?);
        self.channels()
            .update_one(doc! {"_id": &id}, doc! {"$setOnInsert": fields}, upsert())
            .await?;
        self.channels()
            .find_one(doc! {"_id": &id}, None)
            .await?
            .ok_or_else(|| ErrorWithCode::new(ErrorCode::ChannelNotFound, id).into())
    }

    async fn get_channel_ids_page(&self, offset: u64, limit: i64) -> anyhow::Result<Vec<String>> {
        let options = FindOptions::builder()
            .sort(doc! {"_id": 1})
            .skip(offset)
            .limit(limit)
            .projection(doc! {"_id": 1})
            .build();
        let rows: Vec<Document> = self
            .documents(CHANNELS)
            .find(None, options)
            .await?
            .try_collect()
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_str("_id").ok().map(|id| id.to_string()))
            .collect())
    }

    async fn remove_channels(&self, ids: &[String]) -> anyhow::Result<u64> {
        self.edges()
            .delete_many(doc! {"channelId": {"$in": ids}}, None)
            .await?;
        let result = self
            .channels()
            .delete_many(doc! {"_id": {"$in": ids}}, None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn remove_unused_channels(&self) -> anyhow::Result<Vec<String>> {
        let ids = self
            .ids_of(
                CHANNELS,
                vec![
                    doc! {"$lookup": {
                        "from": CHAT_ID_CHANNEL_ID,
                        "localField": "_id",
                        "foreignField": "channelId",
                        "as": "edges",
                    }},
                    doc! {"$match": {"edges": {"$size": 0}}},
                    doc! {"$project": {"_id": 1}},
                ],
            )
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.channels()
            .delete_many(doc! {"_id": {"$in": ids.clone()}}, None)
            .await?;
        Ok(ids
            .into_iter()
            .filter_map(|id| id.as_str().map(|id| id.to_string()))
            .collect())
    }

    async fn claim_channels_for_subscription(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        expires_before: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Channel>> {
        self.claim_channels(
            limit,
            doc! {
                "subscriptionTimeoutExpiresAt": {"$lte": date(now)},
                "subscriptionExpiresAt": {"$lt": date(expires_before)},
            },
            doc! {"$set": {"subscriptionTimeoutExpiresAt": date(lease_until)}},
            doc! {"subscriptionExpiresAt": 1},
        )
        .await
    }

    async fn set_channel_subscription(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.channels()
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {"subscriptionExpiresAt": date(expires_at)}},
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_existing_video_ids(&self, ids: &[String]) -> anyhow::Result<Vec<String>> {
        let mut existing = Vec::new();
        for chunk in ids.chunks(BULK_SIZE) {
            let options = FindOptions::builder().projection(doc! {"_id": 1}).build();
            let rows: Vec<Document> = self
                .documents(VIDEOS)
                .find(doc! {"_id": {"$in": chunk}}, options)
                .await?
                .try_collect()
                .await?;
            existing.extend(
                rows.iter()
                    .filter_map(|row| row.get_str("_id").ok().map(|id| id.to_string())),
            );
        }
        Ok(existing)
    }

    async fn get_video_by_id(&self, id: &str) -> anyhow::Result<Option<Video>> {
        Ok(self.videos().find_one(doc! {"_id": id}, None).await?)
    }

    async fn get_videos_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<Video>> {
        let mut videos = Vec::new();
        for chunk in ids.chunks(BULK_SIZE) {
            let cursor = self.videos().find(doc! {"_id": {"$in": chunk}}, None).await?;
            let rows: Vec<Video> = cursor.try_collect().await?;
            videos.extend(rows);
        }
        Ok(videos)
    }

    async fn set_video_preview_file_id(&self, id: &str, file_id: &str) -> anyhow::Result<()> {
        self.videos()
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {"telegramPreviewFileId": file_id}},
                None,
            )
            .await?;
        Ok(())
    }

    async fn remove_videos_older_than(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let ids = self
            .ids_of(
                VIDEOS,
                vec![
                    doc! {"$match": {"publishedAt": {"$lt": date(before)}}},
                    doc! {"$project": {"_id": 1}},
                ],
            )
            .await?;
        let mut removed = 0;
        for chunk in ids.chunks(BULK_SIZE * 10) {
            self.pending()
                .delete_many(doc! {"videoId": {"$in": chunk}}, None)
                .await?;
            removed += self
                .videos()
                .delete_many(doc! {"_id": {"$in": chunk}}, None)
                .await?
                .deleted_count;
        }
        Ok(removed)
    }

    async fn put_sync_results(&self, results: &SyncResults) -> anyhow::Result<()> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        match self.write_sync_results(results, &mut session).await {
            Ok(()) => {
                session.commit_transaction().await?;
                Ok(())
            }
            Err(error) => {
                if let Err(abort_error) = session.abort_transaction().await {
                    log::warn!("Failed to abort sync transaction: {}", abort_error);
                }
                Err(error)
            }
        }
    }

    async fn ensure_chat(&self, id: i64) -> anyhow::Result<Chat> {
        let fields = without_id(bson::to_document(&Chat::new(id, Utc::now()))?);
        self.chats()
            .update_one(doc! {"_id": id}, doc! {"$setOnInsert": fields}, upsert())
            .await?;
        self.chats()
            .find_one(doc! {"_id": id}, None)
            .await?
            .ok_or_else(|| ErrorWithCode::new(ErrorCode::ChatNotFound, id.to_string()).into())
    }

    async fn get_chat_by_id(&self, id: i64) -> anyhow::Result<Option<Chat>> {
        Ok(self.chats().find_one(doc! {"_id": id}, None).await?)
    }

    async fn update_chat(&self, id: i64, changes: &ChatChanges) -> anyhow::Result<()> {
        let mut set = Document::new();
        if let Some(is_hide_preview) = changes.is_hide_preview {
            set.insert("isHidePreview", is_hide_preview);
        }
        if let Some(is_muted) = changes.is_muted {
            set.insert("isMuted", is_muted);
        }
        if set.is_empty() {
            return Ok(());
        }
        self.chats()
            .update_one(doc! {"_id": id}, doc! {"$set": set}, None)
            .await?;
        Ok(())
    }

    async fn link_chat_channel(&self, chat_id: i64, channel_id: i64) -> anyhow::Result<()> {
        let taken = self
            .chats()
            .find_one(doc! {"channelId": channel_id, "_id": {"$ne": chat_id}}, None)
            .await?;
        if taken.is_some() {
            return Err(
                ErrorWithCode::new(ErrorCode::ChannelAlreadyLinked, channel_id.to_string()).into(),
            );
        }
        let chat = self
            .get_chat_by_id(chat_id)
            .await?
            .ok_or_else(|| ErrorWithCode::new(ErrorCode::ChatNotFound, chat_id.to_string()))?;
        if let Some(previous) = chat.channel_id.filter(|previous| *previous != channel_id) {
            self.delete_chat(previous).await?;
        }
        self.chats()
            .update_one(
                doc! {"_id": chat_id},
                doc! {"$set": {"channelId": channel_id}},
                None,
            )
            .await?;
        let fields = without_id(bson::to_document(&Chat::new(channel_id, Utc::now()))?);
        self.chats()
            .update_one(
                doc! {"_id": channel_id},
                doc! {"$setOnInsert": fields, "$set": {"parentChatId": chat_id}},
                upsert(),
            )
            .await?;
        Ok(())
    }

    async fn unlink_chat_channel(&self, chat_id: i64) -> anyhow::Result<()> {
        let chat = match self.get_chat_by_id(chat_id).await? {
            Some(chat) => chat,
            None => return Ok(()),
        };
        if let Some(channel_id) = chat.channel_id {
            self.chats()
                .update_one(
                    doc! {"_id": chat_id},
                    doc! {"$unset": {"channelId": ""}},
                    None,
                )
                .await?;
            self.remove_chat_rows(channel_id).await?;
        }
        Ok(())
    }

    async fn delete_chat(&self, id: i64) -> anyhow::Result<()> {
        let chat = match self.get_chat_by_id(id).await? {
            Some(chat) => chat,
            None => return Ok(()),
        };
        self.remove_chat_rows(id).await?;
        if let Some(parent_id) = chat.parent_chat_id {
            self.chats()
                .update_one(
                    doc! {"_id": parent_id, "channelId": id},
                    doc! {"$unset": {"channelId": ""}},
                    None,
                )
                .await?;
        }
        if let Some(channel_id) = chat.channel_id {
            let linked = self
                .chats()
                .find_one(doc! {"_id": channel_id, "parentChatId": id}, None)
                .await?;
            if linked.is_some() {
                self.remove_chat_rows(channel_id).await?;
            }
        }
        Ok(())
    }

    async fn delete_chats(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let mut deleted = 0;
        for id in ids {
            if self.get_chat_by_id(*id).await?.is_some() {
                self.delete_chat(*id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn set_chat_send_timeout(&self, id: i64, until: DateTime<Utc>) -> anyhow::Result<()> {
        self.chats()
            .update_one(
                doc! {"_id": id},
                doc! {"$max": {"sendTimeoutExpiresAt": date(until)}},
                None,
            )
            .await?;
        Ok(())
    }

    async fn change_chat_id(&self, old_id: i64, new_id: i64) -> anyhow::Result<()> {
        if let Some(mut chat) = self.get_chat_by_id(old_id).await? {
            if self.get_chat_by_id(new_id).await?.is_none() {
                chat.id = new_id;
                self.chats().insert_one(chat, None).await?;
            }
            self.chats().delete_one(doc! {"_id": old_id}, None).await?;
        }
        self.chats()
            .update_many(
                doc! {"parentChatId": old_id},
                doc! {"$set": {"parentChatId": new_id}},
                None,
            )
            .await?;
        self.chats()
            .update_many(
                doc! {"channelId": old_id},
                doc! {"$set": {"channelId": new_id}},
                None,
            )
            .await?;

        let taken_channels: Vec<String> = self
            .edges()
            .find(doc! {"chatId": new_id}, None)
            .await?
            .map_ok(|edge| edge.channel_id)
            .try_collect()
            .await?;
        self.edges()
            .delete_many(
                doc! {"chatId": old_id, "channelId": {"$in": taken_channels}},
                None,
            )
            .await?;
        self.edges()
            .update_many(
                doc! {"chatId": old_id},
                doc! {"$set": {"chatId": new_id}},
                None,
            )
            .await?;

        let taken_videos: Vec<String> = self
            .pending()
            .find(doc! {"chatId": new_id}, None)
            .await?
            .map_ok(|row| row.video_id)
            .try_collect()
            .await?;
        self.pending()
            .delete_many(
                doc! {"chatId": old_id, "videoId": {"$in": taken_videos}},
                None,
            )
            .await?;
        self.pending()
            .update_many(
                doc! {"chatId": old_id},
                doc! {"$set": {"chatId": new_id}},
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_chat_ids_page(&self, offset: u64, limit: i64) -> anyhow::Result<Vec<i64>> {
        let options = FindOptions::builder()
            .sort(doc! {"_id": 1})
            .skip(offset)
            .limit(limit)
            .projection(doc! {"_id": 1})
            .build();
        let rows: Vec<Document> = self
            .documents(CHATS)
            .find(None, options)
            .await?
            .try_collect()
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_i64("_id").ok())
            .collect())
    }

    async fn remove_unused_chats(&self) -> anyhow::Result<u64> {
        let ids = self
            .ids_of(
                CHATS,
                vec![
                    doc! {"$match": {"channelId": Bson::Null, "parentChatId": Bson::Null}},
                    doc! {"$lookup": {
                        "from": CHAT_ID_CHANNEL_ID,
                        "localField": "_id",
                        "foreignField": "chatId",
                        "as": "edges",
                    }},
                    doc! {"$match": {"edges": {"$size": 0}}},
                    doc! {"$project": {"_id": 1}},
                ],
            )
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.pending()
            .delete_many(doc! {"chatId": {"$in": ids.clone()}}, None)
            .await?;
        let result = self
            .chats()
            .delete_many(doc! {"_id": {"$in": ids}}, None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn subscribe_chat(&self, chat_id: i64, channel_id: &str) -> anyhow::Result<bool> {
        let result = self
            .edges()
            .update_one(
                doc! {"chatId": chat_id, "channelId": channel_id},
                doc! {"$setOnInsert": {"createdAt": date(Utc::now())}},
                upsert(),
            )
            .await?;
        Ok(result.upserted_id.is_some())
    }

    async fn unsubscribe_chat(&self, chat_id: i64, channel_id: &str) -> anyhow::Result<bool> {
        let result = self
            .edges()
            .delete_one(doc! {"chatId": chat_id, "channelId": channel_id}, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn count_chat_subscriptions(&self, chat_id: i64) -> anyhow::Result<u64> {
        Ok(self
            .edges()
            .count_documents(doc! {"chatId": chat_id}, None)
            .await?)
    }

    async fn get_subscribers_by_channel_ids(
        &self,
        channel_ids: &[String],
    ) -> anyhow::Result<Vec<Subscriber>> {
        let rows: Vec<Document> = self
            .documents(CHAT_ID_CHANNEL_ID)
            .aggregate(
                vec![
                    doc! {"$match": {"channelId": {"$in": channel_ids}}},
                    doc! {"$lookup": {
                        "from": CHATS,
                        "localField": "chatId",
                        "foreignField": "_id",
                        "as": "chat",
                    }},
                    doc! {"$unwind": "$chat"},
                ],
                None,
            )
            .await?
            .try_collect()
            .await?;
        rows.into_iter()
            .map(|row| -> anyhow::Result<Subscriber> {
                let row: SubscriberRow = bson::from_document(row)?;
                Ok(Subscriber {
                    channel_id: row.channel_id,
                    created_at: row.created_at,
                    chat: row.chat,
                })
            })
            .collect()
    }

    async fn get_channels_by_chat_id(&self, chat_id: i64) -> anyhow::Result<Vec<Channel>> {
        let rows: Vec<Document> = self
            .documents(CHAT_ID_CHANNEL_ID)
            .aggregate(
                vec![
                    doc! {"$match": {"chatId": chat_id}},
                    doc! {"$sort": {"createdAt": 1}},
                    doc! {"$lookup": {
                        "from": CHANNELS,
                        "localField": "channelId",
                        "foreignField": "_id",
                        "as": "channel",
                    }},
                    doc! {"$unwind": "$channel"},
                    doc! {"$replaceRoot": {"newRoot": "$channel"}},
                ],
                None,
            )
            .await?
            .try_collect()
            .await?;
        rows.into_iter()
            .map(|row| bson::from_document(row).map_err(anyhow::Error::from))
            .collect()
    }

    async fn get_chats_for_send(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        exclude: &[i64],
    ) -> anyhow::Result<Vec<Chat>> {
        let rows: Vec<Document> = self
            .documents(CHAT_ID_VIDEO_ID)
            .aggregate(
                vec![
                    doc! {"$match": {"chatId": {"$nin": exclude}}},
                    doc! {"$group": {"_id": "$chatId"}},
                    doc! {"$lookup": {
                        "from": CHATS,
                        "localField": "_id",
                        "foreignField": "_id",
                        "as": "chat",
                    }},
                    doc! {"$unwind": "$chat"},
                    doc! {"$match": {"chat.sendTimeoutExpiresAt": {"$lte": date(now)}}},
                    doc! {"$limit": limit},
                    doc! {"$replaceRoot": {"newRoot": "$chat"}},
                ],
                None,
            )
            .await?
            .try_collect()
            .await?;
        rows.into_iter()
            .map(|row| bson::from_document(row).map_err(anyhow::Error::from))
            .collect()
    }

    async fn get_video_ids_by_chat_id(
        &self,
        chat_id: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<String>> {
        let rows: Vec<Document> = self
            .documents(CHAT_ID_VIDEO_ID)
            .aggregate(
                vec![
                    doc! {"$match": {"chatId": chat_id}},
                    doc! {"$lookup": {
                        "from": VIDEOS,
                        "localField": "videoId",
                        "foreignField": "_id",
                        "as": "video",
                    }},
                    doc! {"$unwind": {"path": "$video", "preserveNullAndEmptyArrays": true}},
                    doc! {"$sort": {"video.publishedAt": 1, "videoId": 1}},
                    doc! {"$limit": limit},
                    doc! {"$project": {"videoId": 1}},
                ],
                None,
            )
            .await?
            .try_collect()
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_str("videoId").ok().map(|id| id.to_string()))
            .collect())
    }

    async fn delete_chat_video_id(&self, chat_id: i64, video_id: &str) -> anyhow::Result<()> {
        self.pending()
            .delete_one(doc! {"chatId": chat_id, "videoId": video_id}, None)
            .await?;
        Ok(())
    }

    async fn put_feeds(
        &self,
        feeds: &[YtPubSubFeed],
        channels: &[ChannelFeedUpdate],
    ) -> anyhow::Result<()> {
        for feed in feeds {
            let fields = without_id(bson::to_document(feed)?);
            self.feeds()
                .update_one(doc! {"_id": &feed.id}, doc! {"$setOnInsert": fields}, upsert())
                .await?;
        }
        for update in channels {
            let mut modifications = doc! {"$set": {"hasChanges": true}};
            if let Some(published_at) = update.last_video_published_at {
                modifications.insert("$min", doc! {"lastVideoPublishedAt": date(published_at)});
            }
            self.channels()
                .update_one(doc! {"_id": &update.id}, modifications, None)
                .await?;
        }
        Ok(())
    }

    async fn remove_feeds_older_than(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = self
            .feeds()
            .delete_many(doc! {"createdAt": {"$lt": date(before)}}, None)
            .await?;
        Ok(result.deleted_count)
    }
}
