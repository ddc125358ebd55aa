//! Video lister: turns a channel id into a lazy, most-recent-first sequence
//! of [`VideoDescriptor`]s.
//!
//! The yt-dlp backend does one cheap flat-playlist listing per channel and
//! then fetches full details for each entry only when the iterator is
//! advanced, so a caller that stops after `limit` videos never pays for the
//! rest of the window.

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::error::SyncError;
use crate::registry::channel_url;
use crate::ytdlp::{capture_stdout, watch_url, yt_dlp_command};

/// Videos at or below this many seconds are classified as Shorts.
pub const SHORT_MAX_SECONDS: f64 = 60.0;

/// Listing window multiplier so the shorts filter can still fill the limit.
const DEFAULT_OVERFETCH: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoDescriptor {
    pub video_id: String,
    pub title: String,
    /// Epoch seconds, when yt-dlp knows the exact publish time.
    pub timestamp: Option<i64>,
    /// `YYYYMMDD` upload date.
    pub upload_date: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub is_short: bool,
    pub view_count: Option<i64>,
    pub channel_id: String,
}

/// What the listing reports about the channel itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelProfile {
    pub title: Option<String>,
    pub channel_url: String,
    pub avatar_url: Option<String>,
}

pub type VideoStream<'a> = Box<dyn Iterator<Item = Result<VideoDescriptor, SyncError>> + 'a>;

pub struct ChannelListing<'a> {
    pub profile: ChannelProfile,
    pub videos: VideoStream<'a>,
}

pub trait VideoLister {
    /// Lists recent uploads of `channel_id`, newest first. Fails with
    /// [`SyncError::ChannelUnavailable`] when the channel cannot be listed.
    fn list_recent(
        &self,
        channel_id: &str,
        max_count: usize,
    ) -> Result<ChannelListing<'_>, SyncError>;
}

/// Short policy: explicit `/shorts/` URL, or a known duration at or below
/// [`SHORT_MAX_SECONDS`].
pub fn is_short(duration_seconds: Option<f64>, urls: &[Option<&str>]) -> bool {
    let flagged = urls
        .iter()
        .flatten()
        .any(|url| url.contains("/shorts/"));
    flagged || duration_seconds.is_some_and(|seconds| seconds > 0.0 && seconds <= SHORT_MAX_SECONDS)
}

#[derive(Debug, Clone, Deserialize)]
struct Thumbnail {
    url: Option<String>,
    #[serde(default)]
    id: Option<Value>,
}

impl Thumbnail {
    fn id_str(&self) -> Option<&str> {
        self.id.as_ref().and_then(Value::as_str)
    }
}

/// `yt-dlp --flat-playlist --dump-single-json` payload for a channel tab.
#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    channel: Option<String>,
    uploader: Option<String>,
    channel_url: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    #[serde(default)]
    entries: Vec<Option<FlatEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    view_count: Option<i64>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

/// Subset of `yt-dlp --dump-single-json` for a single video.
#[derive(Debug, Deserialize)]
struct VideoDetails {
    title: Option<String>,
    fulltitle: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    upload_date: Option<String>,
    timestamp: Option<f64>,
    release_timestamp: Option<f64>,
    view_count: Option<i64>,
    webpage_url: Option<String>,
}

/// Picks the uncropped avatar when present, else any avatar-like thumbnail.
fn avatar_from(thumbnails: &[Thumbnail]) -> Option<String> {
    let exact = thumbnails
        .iter()
        .find(|thumb| thumb.id_str() == Some("avatar_uncropped"));
    let loose = || {
        thumbnails
            .iter()
            .find(|thumb| thumb.id_str().is_some_and(|id| id.contains("avatar")))
    };
    exact
        .or_else(loose)
        .and_then(|thumb| thumb.url.clone())
}

/// Lists channels by shelling out to yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlpLister {
    offset: usize,
    overfetch: usize,
    short_details: bool,
}

impl Default for YtDlpLister {
    fn default() -> Self {
        Self::new(0)
    }
}

impl YtDlpLister {
    /// `offset` skips that many of the newest uploads (pagination).
    pub fn new(offset: usize) -> Self {
        Self {
            offset,
            overfetch: DEFAULT_OVERFETCH,
            short_details: false,
        }
    }

    /// Whether entries the listing already marks as shorts get a detail
    /// fetch. Off by default: excluded shorts only need the flag.
    pub fn fetch_short_details(mut self, enabled: bool) -> Self {
        self.short_details = enabled;
        self
    }

    fn playlist_window(&self, max_count: usize) -> String {
        let start = self.offset + 1;
        let span = max_count.max(1) * self.overfetch;
        format!("{start}-{}", self.offset + span)
    }

    fn fetch_listing(&self, channel_id: &str, max_count: usize) -> Result<FlatPlaylist, String> {
        let list_url = format!("{}/videos", channel_url(channel_id));
        let mut command = yt_dlp_command();
        command
            .arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg("--playlist-items")
            .arg(self.playlist_window(max_count))
            .arg(&list_url);

        let raw = capture_stdout(command)?;
        serde_json::from_str(&raw).map_err(|err| format!("unparsable listing: {err}"))
    }

    fn describe(&self, channel_id: &str, entry: FlatEntry) -> Result<VideoDescriptor, SyncError> {
        let Some(video_id) = entry.id.clone().filter(|id| !id.trim().is_empty()) else {
            return Err(SyncError::VideoUnavailable {
                video_id: "<unknown>".into(),
                reason: "listing entry without an id".into(),
            });
        };

        if !self.short_details && is_short(entry.duration, &[entry.url.as_deref()]) {
            debug!("{video_id} is listed as a short; skipping details");
            return Ok(listed_short(channel_id, video_id, entry));
        }

        debug!("Fetching details for {video_id}");
        let details = fetch_details(&video_id).map_err(|reason| SyncError::VideoUnavailable {
            video_id: video_id.clone(),
            reason,
        })?;

        let duration_seconds = details.duration.or(entry.duration);
        let short = is_short(
            duration_seconds,
            &[entry.url.as_deref(), details.webpage_url.as_deref()],
        );
        let title = details
            .fulltitle
            .or(details.title)
            .or(entry.title)
            .unwrap_or_default();
        let thumbnail_url = details.thumbnail.or_else(|| {
            entry
                .thumbnails
                .iter()
                .rev()
                .find_map(|thumb| thumb.url.clone())
        });

        Ok(VideoDescriptor {
            video_id,
            title,
            timestamp: details
                .timestamp
                .or(details.release_timestamp)
                .map(|value| value as i64),
            upload_date: details.upload_date,
            thumbnail_url,
            duration_seconds,
            is_short: short,
            view_count: details.view_count.or(entry.view_count),
            channel_id: channel_id.to_owned(),
        })
    }
}

/// Descriptor built from the flat listing alone.
fn listed_short(channel_id: &str, video_id: String, entry: FlatEntry) -> VideoDescriptor {
    VideoDescriptor {
        title: entry.title.unwrap_or_default(),
        timestamp: None,
        upload_date: None,
        thumbnail_url: entry.thumbnails.into_iter().rev().find_map(|thumb| thumb.url),
        duration_seconds: entry.duration,
        is_short: true,
        view_count: entry.view_count,
        channel_id: channel_id.to_owned(),
        video_id,
    }
}

fn fetch_details(video_id: &str) -> Result<VideoDetails, String> {
    let mut command = yt_dlp_command();
    command
        .arg("--dump-single-json")
        .arg("--skip-download")
        .arg("--no-warnings")
        .arg("--no-playlist")
        .arg(watch_url(video_id));

    let raw = capture_stdout(command)?;
    serde_json::from_str(&raw).map_err(|err| format!("unparsable video details: {err}"))
}

impl VideoLister for YtDlpLister {
    fn list_recent(
        &self,
        channel_id: &str,
        max_count: usize,
    ) -> Result<ChannelListing<'_>, SyncError> {
        let listing =
            self.fetch_listing(channel_id, max_count)
                .map_err(|reason| SyncError::ChannelUnavailable {
                    channel_id: channel_id.to_owned(),
                    reason,
                })?;

        let profile = ChannelProfile {
            title: listing.channel.or(listing.uploader),
            channel_url: listing
                .channel_url
                .unwrap_or_else(|| channel_url(channel_id)),
            avatar_url: avatar_from(&listing.thumbnails),
        };

        let owner = channel_id.to_owned();
        let videos = listing
            .entries
            .into_iter()
            .flatten()
            .map(move |entry| self.describe(&owner, entry));

        Ok(ChannelListing {
            profile,
            videos: Box::new(videos),
        })
    }
}
