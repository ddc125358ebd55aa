//! PostgREST client for the hosted Supabase tables.
//!
//! Requests are blocking `ureq` calls moved onto tokio's blocking pool so a
//! slow database never stalls the runtime. Every request carries the service
//! key both as `apikey` and as a bearer token.

use std::time::Duration;

use log::debug;
use serde::Deserialize;

use super::{CreatorId, NewCreator, Post, PostStore, WriteOutcome};
use crate::error::SyncError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
}

enum RestFailure {
    Conflict,
    Failed(SyncError),
}

/// Maps a failed request onto the error taxonomy. Auth, server and transport
/// problems are fatal; any other rejection only costs the row.
fn classify(table: &str, err: ureq::Error) -> RestFailure {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            let detail: PostgrestError = serde_json::from_str(&body).unwrap_or_default();
            let code = detail.code.as_deref();
            if code == Some(UNIQUE_VIOLATION) || (status == 409 && code.is_none()) {
                return RestFailure::Conflict;
            }
            let message = detail.message.unwrap_or(body);
            let reason = match code {
                Some(code) => format!("{table}: HTTP {status} ({code}): {message}"),
                None => format!("{table}: HTTP {status}: {message}"),
            };
            if status == 401 || status == 403 || status >= 500 {
                RestFailure::Failed(SyncError::DatabaseFatal(reason))
            } else {
                RestFailure::Failed(SyncError::RowRejected(reason))
            }
        }
        ureq::Error::Transport(transport) => {
            RestFailure::Failed(SyncError::DatabaseFatal(format!("{table}: {transport}")))
        }
    }
}

fn unexpected(table: &str, err: impl std::fmt::Display) -> SyncError {
    SyncError::DatabaseFatal(format!("{table}: unreadable response: {err}"))
}

#[derive(Clone)]
struct RestClient {
    agent: ureq::Agent,
    rest_url: String,
    key: String,
}

impl RestClient {
    fn get(&self, table: &str) -> ureq::Request {
        self.authorize(self.agent.get(&format!("{}/{table}", self.rest_url)))
    }

    fn post(&self, table: &str) -> ureq::Request {
        self.authorize(self.agent.post(&format!("{}/{table}", self.rest_url)))
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        request
            .set("apikey", &self.key)
            .set("Authorization", &format!("Bearer {}", self.key))
    }

    fn first_id(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<String>, SyncError> {
        let response = self
            .get(table)
            .query("select", "id")
            .query(column, &format!("eq.{value}"))
            .query("limit", "1")
            .call()
            .map_err(|err| match classify(table, err) {
                RestFailure::Conflict => {
                    SyncError::DatabaseFatal(format!("{table}: conflict reported for a read"))
                }
                RestFailure::Failed(err) => err,
            })?;
        let rows: Vec<IdRow> = response.into_json().map_err(|err| unexpected(table, err))?;
        Ok(rows.into_iter().next().map(|row| row.id))
    }

    fn find_creator(&self, slug: &str) -> Result<Option<CreatorId>, SyncError> {
        Ok(self.first_id("creators", "slug", slug)?.map(CreatorId))
    }

    fn ensure_creator(&self, creator: &NewCreator) -> Result<CreatorId, SyncError> {
        if let Some(id) = self.find_creator(&creator.slug)? {
            return Ok(id);
        }

        let inserted = self
            .post("creators")
            .set("Prefer", "return=representation")
            .send_json(creator);
        match inserted {
            Ok(response) => {
                let rows: Vec<IdRow> = response
                    .into_json()
                    .map_err(|err| unexpected("creators", err))?;
                if let Some(row) = rows.into_iter().next() {
                    return Ok(CreatorId(row.id));
                }
            }
            Err(err) => match classify("creators", err) {
                RestFailure::Conflict => {
                    debug!("Creator {} was inserted concurrently; reusing it", creator.slug);
                }
                RestFailure::Failed(err) => return Err(err),
            },
        }

        self.find_creator(&creator.slug)?.ok_or_else(|| {
            SyncError::DatabaseFatal(format!("creator {} missing after insert", creator.slug))
        })
    }

    fn post_exists(&self, source_url: &str) -> Result<bool, SyncError> {
        Ok(self.first_id("posts", "source_url", source_url)?.is_some())
    }

    fn insert_post(&self, post: &Post) -> Result<WriteOutcome, SyncError> {
        let result = self
            .post("posts")
            .set("Prefer", "return=minimal")
            .send_json(post);
        match result {
            Ok(_) => Ok(WriteOutcome::Inserted),
            Err(err) => match classify("posts", err) {
                RestFailure::Conflict => Ok(WriteOutcome::AlreadyExists),
                RestFailure::Failed(err) => Err(err),
            },
        }
    }
}

pub struct SupabaseStore {
    client: RestClient,
}

impl SupabaseStore {
    /// `base_url` is the project URL, e.g. `https://xyz.supabase.co`.
    pub fn new(base_url: &str, key: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            client: RestClient {
                agent,
                rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
                key: key.to_owned(),
            },
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&RestClient) -> Result<T, SyncError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || op(&client))
            .await
            .map_err(|err| SyncError::DatabaseFatal(format!("database worker failed: {err}")))?
    }
}

impl PostStore for SupabaseStore {
    async fn ensure_creator(&self, creator: &NewCreator) -> Result<CreatorId, SyncError> {
        let creator = creator.clone();
        self.blocking(move |client| client.ensure_creator(&creator))
            .await
    }

    async fn post_exists(&self, source_url: &str) -> Result<bool, SyncError> {
        let source_url = source_url.to_owned();
        self.blocking(move |client| client.post_exists(&source_url))
            .await
    }

    async fn insert_post(&self, post: &Post) -> Result<WriteOutcome, SyncError> {
        let post = post.clone();
        self.blocking(move |client| client.insert_post(&post)).await
    }
}
