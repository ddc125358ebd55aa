//! Persistence for creators and posts.
//!
//! Two backends implement [`PostStore`]: [`SupabaseStore`] talks to the
//! hosted PostgREST endpoint, [`SqliteStore`] keeps a local libsql mirror
//! with the same tables and unique constraints. In both, the database
//! constraint on `posts.source_url` and `creators.slug` is the authority;
//! lookups before inserting only save round trips.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::registry::Language;

mod sqlite;
mod supabase;

pub use sqlite::SqliteStore;
pub use supabase::SupabaseStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreatorId(pub String);

impl fmt::Display for CreatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A creator row as it is inserted. `id` and `created_at` come from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewCreator {
    pub name: String,
    pub slug: String,
    pub channel_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
}

impl PostType {
    pub fn as_str(self) -> &'static str {
        match self {
            PostType::Review => "review",
        }
    }
}

impl PostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
        }
    }
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
        }
    }
}

/// A `posts` row as it is inserted. `created_at` is assigned by the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub creator_id: CreatorId,
    #[serde(rename = "type")]
    pub post_type: PostType,
    pub status: PostStatus,
    pub language: Language,
    pub source: Platform,
    pub platform: Platform,
    pub title: String,
    /// Filled by later processing, never by the sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub source_url: String,
    pub thumbnail_url: Option<String>,
    pub transcript: Option<String>,
    pub transcript_en: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    AlreadyExists,
}

#[allow(async_fn_in_trait)]
pub trait PostStore {
    /// Returns the id of the creator with `creator.slug`, inserting it first
    /// when absent. Losing an insert race falls back to the lookup.
    async fn ensure_creator(&self, creator: &NewCreator) -> Result<CreatorId, SyncError>;

    async fn post_exists(&self, source_url: &str) -> Result<bool, SyncError>;

    /// Single-row insert. A unique violation on `source_url` is reported as
    /// [`WriteOutcome::AlreadyExists`], not as an error.
    async fn insert_post(&self, post: &Post) -> Result<WriteOutcome, SyncError>;

    async fn upsert_if_new(&self, post: &Post) -> Result<WriteOutcome, SyncError> {
        if self.post_exists(&post.source_url).await? {
            return Ok(WriteOutcome::AlreadyExists);
        }
        self.insert_post(post).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn sample_creator(name: &str) -> NewCreator {
        NewCreator {
            name: name.to_owned(),
            slug: crate::mapper::slugify(name),
            channel_url: "https://www.youtube.com/channel/UCtest".into(),
            avatar_url: Some("https://img/avatar.jpg".into()),
        }
    }

    pub fn sample_post(creator_id: &CreatorId, video_id: &str) -> Post {
        Post {
            creator_id: creator_id.clone(),
            post_type: PostType::Review,
            status: PostStatus::Draft,
            language: Language::Vi,
            source: Platform::Youtube,
            platform: Platform::Youtube,
            title: format!("Video {video_id}"),
            summary: None,
            source_url: crate::ytdlp::watch_url(video_id),
            thumbnail_url: Some(format!("https://i.ytimg.com/vi/{video_id}/hq.jpg")),
            transcript: Some("xin chao".into()),
            transcript_en: None,
            published_at: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).single(),
        }
    }
}
