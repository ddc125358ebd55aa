//! Error taxonomy shared by the sync pipeline.
//!
//! Only [`SyncError::DatabaseFatal`] aborts a run. Everything else is
//! recovered at channel or video granularity and shows up in the run summary.
//! "No transcript" and "already synced" are outcomes, not errors, so they do
//! not appear here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The channel listing could not be produced (bad id, yt-dlp failure,
    /// unparsable listing). Recovered per channel.
    #[error("channel {channel_id} unavailable: {reason}")]
    ChannelUnavailable { channel_id: String, reason: String },

    /// Details for a single listed video could not be fetched.
    #[error("video {video_id} unavailable: {reason}")]
    VideoUnavailable { video_id: String, reason: String },

    /// Transient caption failure. Retried once, then downgraded to an
    /// unavailable transcript by the resolver.
    #[error("transcript fetch failed for {video_id}: {reason}")]
    TranscriptFetchFailed { video_id: String, reason: String },

    /// The database refused a single row for a non-uniqueness reason.
    #[error("row rejected: {0}")]
    RowRejected(String),

    /// Connectivity, authentication or server failure. Ends the run.
    #[error("database failure: {0}")]
    DatabaseFatal(String),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::DatabaseFatal(_))
    }
}

impl From<libsql::Error> for SyncError {
    fn from(err: libsql::Error) -> Self {
        SyncError::DatabaseFatal(err.to_string())
    }
}
