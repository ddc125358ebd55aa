//! Transcript resolution with an explicit fallback chain.
//!
//! Vietnamese channels try manual Vietnamese captions, then auto-generated
//! Vietnamese, then English. English channels only try English; there is no
//! Vietnamese fallback for them. A video without usable captions resolves
//! to [`TranscriptResult::Unavailable`], which is a normal outcome.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;

use crate::error::SyncError;
use crate::registry::Language;
use crate::ytdlp::{blocking_section, capture_stdout, watch_url, yt_dlp_command};

pub const TRANSCRIPT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionKind {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptionAttempt {
    pub language: Language,
    pub kind: CaptionKind,
}

impl CaptionAttempt {
    const fn new(language: Language, kind: CaptionKind) -> Self {
        Self { language, kind }
    }
}

const VI_CHAIN: &[CaptionAttempt] = &[
    CaptionAttempt::new(Language::Vi, CaptionKind::Manual),
    CaptionAttempt::new(Language::Vi, CaptionKind::Automatic),
    CaptionAttempt::new(Language::En, CaptionKind::Manual),
    CaptionAttempt::new(Language::En, CaptionKind::Automatic),
];

const EN_CHAIN: &[CaptionAttempt] = &[
    CaptionAttempt::new(Language::En, CaptionKind::Manual),
    CaptionAttempt::new(Language::En, CaptionKind::Automatic),
];

/// Attempts made for a channel of the given language, in order.
pub fn fallback_chain(preferred: Language) -> &'static [CaptionAttempt] {
    match preferred {
        Language::Vi => VI_CHAIN,
        Language::En => EN_CHAIN,
    }
}

/// Result of a single caption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionFetch {
    Found(String),
    /// No captions of that language and kind (including captions disabled).
    NotAvailable,
}

pub trait CaptionSource {
    /// Fetches one caption track. Errors are transient failures only; a
    /// missing track is `Ok(CaptionFetch::NotAvailable)`.
    fn fetch(&self, video_id: &str, attempt: CaptionAttempt) -> Result<CaptionFetch, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptResult {
    Resolved { language: Language, text: String },
    Unavailable,
}

impl TranscriptResult {
    pub fn language(&self) -> Option<Language> {
        match self {
            TranscriptResult::Resolved { language, .. } => Some(*language),
            TranscriptResult::Unavailable => None,
        }
    }

    /// The transcript text if it was resolved in `language`.
    pub fn text_for(&self, language: Language) -> Option<&str> {
        match self {
            TranscriptResult::Resolved {
                language: resolved,
                text,
            } if *resolved == language => Some(text.as_str()),
            _ => None,
        }
    }
}

pub struct TranscriptResolver<C> {
    source: C,
    retry_delay: Duration,
}

impl<C: CaptionSource> TranscriptResolver<C> {
    pub fn new(source: C) -> Self {
        Self::with_retry_delay(source, TRANSCRIPT_RETRY_DELAY)
    }

    pub fn with_retry_delay(source: C, retry_delay: Duration) -> Self {
        Self {
            source,
            retry_delay,
        }
    }

    pub fn source(&self) -> &C {
        &self.source
    }

    pub async fn resolve(&self, video_id: &str, preferred: Language) -> TranscriptResult {
        for attempt in fallback_chain(preferred) {
            match self.fetch_with_retry(video_id, *attempt).await {
                Ok(CaptionFetch::Found(text)) => {
                    debug!(
                        "Resolved {} {:?} transcript for {video_id} ({} chars)",
                        attempt.language,
                        attempt.kind,
                        text.len()
                    );
                    return TranscriptResult::Resolved {
                        language: attempt.language,
                        text,
                    };
                }
                Ok(CaptionFetch::NotAvailable) => continue,
                Err(err) => {
                    warn!("{err}; continuing without transcript");
                    return TranscriptResult::Unavailable;
                }
            }
        }
        TranscriptResult::Unavailable
    }

    async fn fetch_with_retry(
        &self,
        video_id: &str,
        attempt: CaptionAttempt,
    ) -> Result<CaptionFetch, SyncError> {
        match blocking_section(|| self.source.fetch(video_id, attempt)) {
            Err(err) => {
                warn!("{err}; retrying once");
                tokio::time::sleep(self.retry_delay).await;
                blocking_section(|| self.source.fetch(video_id, attempt))
            }
            outcome => outcome,
        }
    }
}

/// json3 subtitle payload as written by yt-dlp.
#[derive(Debug, Deserialize)]
struct Json3 {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
struct Json3Event {
    #[serde(default)]
    segs: Vec<Json3Segment>,
}

#[derive(Debug, Deserialize)]
struct Json3Segment {
    #[serde(default)]
    utf8: String,
}

/// Flattens json3 caption events into plain text, one space between cues.
pub fn parse_json3(raw: &str) -> Result<String, serde_json::Error> {
    let parsed: Json3 = serde_json::from_str(raw)?;
    let lines: Vec<String> = parsed
        .events
        .iter()
        .map(|event| {
            event
                .segs
                .iter()
                .map(|seg| seg.utf8.as_str())
                .collect::<String>()
                .trim()
                .to_owned()
        })
        .filter(|line| !line.is_empty())
        .collect();
    Ok(lines.join(" "))
}

/// Downloads caption tracks with yt-dlp into a scratch directory.
#[derive(Debug, Clone, Default)]
pub struct YtDlpCaptions;

impl YtDlpCaptions {
    fn run(&self, video_id: &str, attempt: CaptionAttempt, dir: &Path) -> Result<(), String> {
        let output_pattern = dir.join(video_id).to_string_lossy().to_string();
        let mut command = yt_dlp_command();
        command
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg(match attempt.kind {
                CaptionKind::Manual => "--write-subs",
                CaptionKind::Automatic => "--write-auto-subs",
            })
            .arg("--sub-langs")
            .arg(attempt.language.as_tag())
            .arg("--sub-format")
            .arg("json3")
            .arg("--output")
            .arg(output_pattern)
            .arg(watch_url(video_id));
        capture_stdout(command).map(|_| ())
    }
}

impl CaptionSource for YtDlpCaptions {
    fn fetch(&self, video_id: &str, attempt: CaptionAttempt) -> Result<CaptionFetch, SyncError> {
        let failed = |reason: String| SyncError::TranscriptFetchFailed {
            video_id: video_id.to_owned(),
            reason,
        };

        let scratch = tempfile::tempdir().map_err(|err| failed(err.to_string()))?;
        self.run(video_id, attempt, scratch.path()).map_err(failed)?;

        let track = scratch
            .path()
            .join(format!("{video_id}.{}.json3", attempt.language.as_tag()));
        if !track.exists() {
            return Ok(CaptionFetch::NotAvailable);
        }

        let raw = fs::read_to_string(&track)
            .map_err(|err| failed(format!("reading {}: {err}", track.display())))?;
        let text = parse_json3(&raw).map_err(|err| failed(format!("malformed json3: {err}")))?;
        if text.is_empty() {
            return Ok(CaptionFetch::NotAvailable);
        }
        Ok(CaptionFetch::Found(text))
    }
}
