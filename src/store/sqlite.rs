//! Local libsql mirror of the `creators`/`posts` schema.
//!
//! Used for `--sqlite` dry runs and as the store behind the pipeline tests.
//! The UNIQUE constraints carry the same meaning as in Postgres, and inserts
//! use `ON CONFLICT DO NOTHING` so a duplicate is visible as zero changed rows.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use libsql::{Builder, Connection, Row, params};
use log::debug;

use super::{CreatorId, NewCreator, Post, PostStore, WriteOutcome};
use crate::error::SyncError;

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        PRAGMA busy_timeout=5000;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS creators (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            channel_url TEXT,
            avatar_url TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS posts (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            creator_id TEXT NOT NULL REFERENCES creators(id),
            type TEXT NOT NULL,
            status TEXT NOT NULL,
            language TEXT NOT NULL,
            source TEXT NOT NULL,
            platform TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT,
            source_url TEXT NOT NULL UNIQUE,
            thumbnail_url TEXT,
            transcript TEXT,
            transcript_en TEXT,
            published_at TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_posts_creator ON posts(creator_id);
        "#,
    )
    .await?;
    Ok(())
}

/// A `posts` row read back from the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPost {
    pub creator_id: String,
    pub language: String,
    pub title: String,
    pub summary: Option<String>,
    pub source_url: String,
    pub transcript: Option<String>,
    pub transcript_en: Option<String>,
    pub published_at: Option<String>,
    pub created_at: String,
}

fn row_to_post(row: &Row) -> Result<StoredPost, SyncError> {
    // Column order must match the SELECT in `get_post`.
    Ok(StoredPost {
        creator_id: row.get(0)?,
        language: row.get(1)?,
        title: row.get(2)?,
        summary: row.get(3)?,
        source_url: row.get(4)?,
        transcript: row.get(5)?,
        transcript_en: row.get(6)?,
        published_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening local database {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    async fn find_creator(&self, slug: &str) -> Result<Option<CreatorId>, SyncError> {
        let mut rows = self
            .conn
            .query("SELECT id FROM creators WHERE slug = ?1", params![slug])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(CreatorId(row.get::<String>(0)?))),
            None => Ok(None),
        }
    }

    /// Insert that tolerates a concurrent writer having taken the slug first.
    async fn insert_creator_or_lookup(&self, creator: &NewCreator) -> Result<CreatorId, SyncError> {
        let changed = self
            .conn
            .execute(
                r#"
                INSERT INTO creators (name, slug, channel_url, avatar_url)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(slug) DO NOTHING
                "#,
                params![
                    creator.name.as_str(),
                    creator.slug.as_str(),
                    creator.channel_url.as_str(),
                    creator.avatar_url.as_deref(),
                ],
            )
            .await?;
        if changed == 0 {
            debug!("Creator {} was inserted concurrently; reusing it", creator.slug);
        }
        self.find_creator(&creator.slug).await?.ok_or_else(|| {
            SyncError::DatabaseFatal(format!("creator {} missing after insert", creator.slug))
        })
    }

    pub async fn post_count(&self) -> Result<i64, SyncError> {
        self.count("SELECT COUNT(*) FROM posts").await
    }

    pub async fn creator_count(&self) -> Result<i64, SyncError> {
        self.count("SELECT COUNT(*) FROM creators").await
    }

    async fn count(&self, sql: &str) -> Result<i64, SyncError> {
        let mut rows = self.conn.query(sql, params![]).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| SyncError::DatabaseFatal("COUNT returned no row".into()))?;
        Ok(row.get::<i64>(0)?)
    }

    pub async fn get_post(&self, source_url: &str) -> Result<Option<StoredPost>, SyncError> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT creator_id, language, title, summary, source_url,
                       transcript, transcript_en, published_at, created_at
                FROM posts
                WHERE source_url = ?1
                "#,
                params![source_url],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_post(&row)?)),
            None => Ok(None),
        }
    }
}

impl PostStore for SqliteStore {
    async fn ensure_creator(&self, creator: &NewCreator) -> Result<CreatorId, SyncError> {
        if let Some(id) = self.find_creator(&creator.slug).await? {
            return Ok(id);
        }
        self.insert_creator_or_lookup(creator).await
    }

    async fn post_exists(&self, source_url: &str) -> Result<bool, SyncError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM posts WHERE source_url = ?1 LIMIT 1",
                params![source_url],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    async fn insert_post(&self, post: &Post) -> Result<WriteOutcome, SyncError> {
        let published_at = post
            .published_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true));

        let changed = self
            .conn
            .execute(
                r#"
                INSERT INTO posts (
                    creator_id, type, status, language, source, platform,
                    title, summary, source_url, thumbnail_url,
                    transcript, transcript_en, published_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(source_url) DO NOTHING
                "#,
                params![
                    post.creator_id.0.as_str(),
                    post.post_type.as_str(),
                    post.status.as_str(),
                    post.language.as_tag(),
                    post.source.as_str(),
                    post.platform.as_str(),
                    post.title.as_str(),
                    post.summary.as_deref(),
                    post.source_url.as_str(),
                    post.thumbnail_url.as_deref(),
                    post.transcript.as_deref(),
                    post.transcript_en.as_deref(),
                    published_at,
                ],
            )
            .await?;

        Ok(if changed == 0 {
            WriteOutcome::AlreadyExists
        } else {
            WriteOutcome::Inserted
        })
    }
}
