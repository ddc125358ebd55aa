//! Drives one sync run: channel by channel, video by video, sequentially.
//!
//! Recoverable failures are counted in [`RunSummary`] and the run moves on.
//! Only [`SyncError::DatabaseFatal`] ends it early.

use std::fmt;
use std::time::Duration;

use log::{error, info, warn};

use crate::error::SyncError;
use crate::lister::{VideoDescriptor, VideoLister};
use crate::mapper::{map_post, new_creator};
use crate::registry::{ChannelEntry, DEFAULT_LIMIT, Language};
use crate::store::{CreatorId, PostStore, WriteOutcome};
use crate::transcript::{CaptionSource, TranscriptResolver};
use crate::ytdlp::{blocking_section, watch_url};

pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Listed non-short videos taken per channel.
    pub limit: usize,
    pub include_shorts: bool,
    /// Zero disables the view-count filter.
    pub min_views: u64,
    /// Pause between videos that reach the transcript fetch.
    pub delay: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            include_shorts: false,
            min_views: 0,
            delay: DEFAULT_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub channels_processed: usize,
    pub channels_failed: usize,
    pub inserted: usize,
    /// Already present in the database.
    pub skipped: usize,
    /// Shorts and videos under the view threshold.
    pub filtered: usize,
    pub failed: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Channels processed: {}", self.channels_processed)?;
        writeln!(f, "Channels failed:    {}", self.channels_failed)?;
        writeln!(f, "Videos inserted:    {}", self.inserted)?;
        writeln!(f, "Videos skipped:     {}", self.skipped)?;
        writeln!(f, "Videos filtered:    {}", self.filtered)?;
        write!(f, "Videos failed:      {}", self.failed)
    }
}

enum Filter {
    Short,
    FewViews(i64),
}

pub struct Pipeline<L, C, S> {
    lister: L,
    resolver: TranscriptResolver<C>,
    store: S,
    options: RunOptions,
}

impl<L, C, S> Pipeline<L, C, S>
where
    L: VideoLister,
    C: CaptionSource,
    S: PostStore,
{
    pub fn new(lister: L, resolver: TranscriptResolver<C>, store: S, options: RunOptions) -> Self {
        Self {
            lister,
            resolver,
            store,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn run(&self, channels: &[&ChannelEntry]) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::default();
        let mut pause = false;

        for (index, entry) in channels.iter().enumerate() {
            info!(
                "[{}/{}] Syncing {} ({}, {})",
                index + 1,
                channels.len(),
                display_name(entry),
                entry.channel_id,
                entry.language
            );
            match self.sync_channel(entry, &mut summary, &mut pause).await {
                Ok(()) => summary.channels_processed += 1,
                Err(err) if err.is_fatal() => {
                    error!("{err}; aborting run");
                    return Err(err);
                }
                Err(err) => {
                    warn!("{err}; skipping channel");
                    summary.channels_failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn sync_channel(
        &self,
        entry: &ChannelEntry,
        summary: &mut RunSummary,
        pause: &mut bool,
    ) -> Result<(), SyncError> {
        let listing = blocking_section(|| {
            self.lister
                .list_recent(&entry.channel_id, self.options.limit)
        })?;
        let creator = new_creator(entry, &listing.profile);
        let creator_id = self.store.ensure_creator(&creator).await?;

        let mut videos = listing.videos;
        let mut taken = 0;
        while taken < self.options.limit {
            let Some(item) = blocking_section(|| videos.next()) else {
                break;
            };
            let descriptor = match item {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    taken += 1;
                    warn!("{err}");
                    summary.failed += 1;
                    continue;
                }
            };
            if descriptor.is_short && !self.options.include_shorts {
                self.log_filtered(&descriptor, Filter::Short);
                summary.filtered += 1;
                continue;
            }
            taken += 1;
            if let Some(views) = self.below_view_threshold(&descriptor) {
                self.log_filtered(&descriptor, Filter::FewViews(views));
                summary.filtered += 1;
                continue;
            }

            match self
                .sync_video(&creator_id, &descriptor, entry.language, pause)
                .await
            {
                Ok(WriteOutcome::Inserted) => {
                    info!("  inserted {} ({})", descriptor.video_id, descriptor.title);
                    summary.inserted += 1;
                }
                Ok(WriteOutcome::AlreadyExists) => {
                    info!("  {} already synced", descriptor.video_id);
                    summary.skipped += 1;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("  {}: {err}", descriptor.video_id);
                    summary.failed += 1;
                }
            }
        }

        Ok(())
    }

    async fn sync_video(
        &self,
        creator_id: &CreatorId,
        descriptor: &VideoDescriptor,
        language: Language,
        pause: &mut bool,
    ) -> Result<WriteOutcome, SyncError> {
        // Checked before the transcript fetch, which is the expensive part.
        if self.store.post_exists(&watch_url(&descriptor.video_id)).await? {
            return Ok(WriteOutcome::AlreadyExists);
        }

        if *pause && !self.options.delay.is_zero() {
            tokio::time::sleep(self.options.delay).await;
        }
        *pause = true;

        let transcript = self.resolver.resolve(&descriptor.video_id, language).await;
        if transcript.language().is_none() {
            info!("  no transcript for {}", descriptor.video_id);
        }
        let post = map_post(creator_id, descriptor, &transcript, language);
        // The existence check above already ran; a conflict here means a
        // concurrent run got there first.
        self.store.insert_post(&post).await
    }

    fn below_view_threshold(&self, descriptor: &VideoDescriptor) -> Option<i64> {
        if self.options.min_views == 0 {
            return None;
        }
        let views = descriptor.view_count.unwrap_or(0);
        (u64::try_from(views).unwrap_or(0) < self.options.min_views).then_some(views)
    }

    fn log_filtered(&self, descriptor: &VideoDescriptor, reason: Filter) {
        match reason {
            Filter::Short => info!("  {} is a short; filtered", descriptor.video_id),
            Filter::FewViews(views) => info!(
                "  {} has {views} views (minimum {}); filtered",
                descriptor.video_id, self.options.min_views
            ),
        }
    }
}

fn display_name(entry: &ChannelEntry) -> &str {
    if entry.name.is_empty() {
        &entry.channel_id
    } else {
        &entry.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lister::{ChannelListing, ChannelProfile, YtDlpLister};
    use crate::store::{NewCreator, Post, SqliteStore};
    use crate::transcript::{CaptionAttempt, CaptionFetch, CaptionKind};
    use crate::ytdlp::{install_stub_script, set_ytdlp_stub_path};
    use anyhow::Result;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::tempdir;

    type Listing = Vec<Result<VideoDescriptor, String>>;

    fn video(id: &str, duration: f64) -> VideoDescriptor {
        VideoDescriptor {
            video_id: id.into(),
            title: format!("Review {id}"),
            timestamp: Some(1_709_640_000),
            upload_date: None,
            thumbnail_url: None,
            duration_seconds: Some(duration),
            is_short: duration <= 60.0,
            view_count: Some(1_000),
            channel_id: "UCfake".into(),
        }
    }

    fn long_videos(ids: &[&str]) -> Listing {
        ids.iter().map(|id| Ok(video(id, 600.0))).collect()
    }

    #[derive(Default)]
    struct FakeLister {
        channels: HashMap<String, Listing>,
        listed: RefCell<Vec<(String, usize)>>,
    }

    impl FakeLister {
        fn with(mut self, channel_id: &str, videos: Listing) -> Self {
            self.channels.insert(channel_id.into(), videos);
            self
        }

        fn listed_ids(&self) -> Vec<String> {
            self.listed.borrow().iter().map(|(id, _)| id.clone()).collect()
        }
    }

    impl VideoLister for FakeLister {
        fn list_recent(
            &self,
            channel_id: &str,
            max_count: usize,
        ) -> Result<ChannelListing<'_>, SyncError> {
            self.listed
                .borrow_mut()
                .push((channel_id.to_owned(), max_count));
            let videos = self
                .channels
                .get(channel_id)
                .ok_or_else(|| SyncError::ChannelUnavailable {
                    channel_id: channel_id.to_owned(),
                    reason: "not found".into(),
                })?;
            let stream = videos.iter().take(max_count * 2).map(|item| {
                item.clone().map_err(|reason| SyncError::VideoUnavailable {
                    video_id: "unknown".into(),
                    reason,
                })
            });
            Ok(ChannelListing {
                profile: ChannelProfile {
                    title: Some(format!("Title of {channel_id}")),
                    channel_url: crate::registry::channel_url(channel_id),
                    avatar_url: None,
                },
                videos: Box::new(stream),
            })
        }
    }

    /// Manual captions keyed by `(video_id, language)`.
    #[derive(Default)]
    struct FakeCaptions {
        tracks: HashMap<(String, Language), String>,
        calls: RefCell<usize>,
    }

    impl CaptionSource for FakeCaptions {
        fn fetch(
            &self,
            video_id: &str,
            attempt: CaptionAttempt,
        ) -> Result<CaptionFetch, SyncError> {
            *self.calls.borrow_mut() += 1;
            if attempt.kind != CaptionKind::Manual {
                return Ok(CaptionFetch::NotAvailable);
            }
            Ok(self
                .tracks
                .get(&(video_id.to_owned(), attempt.language))
                .map(|text| CaptionFetch::Found(text.clone()))
                .unwrap_or(CaptionFetch::NotAvailable))
        }
    }

    /// SQLite store whose inserts fail for chosen source URLs.
    struct FailingStore {
        inner: SqliteStore,
        fatal: Vec<String>,
        rejected: Vec<String>,
    }

    impl PostStore for FailingStore {
        async fn ensure_creator(&self, creator: &NewCreator) -> Result<CreatorId, SyncError> {
            self.inner.ensure_creator(creator).await
        }

        async fn post_exists(&self, source_url: &str) -> Result<bool, SyncError> {
            self.inner.post_exists(source_url).await
        }

        async fn insert_post(&self, post: &Post) -> Result<WriteOutcome, SyncError> {
            if self.fatal.contains(&post.source_url) {
                return Err(SyncError::DatabaseFatal("connection reset by peer".into()));
            }
            if self.rejected.contains(&post.source_url) {
                return Err(SyncError::RowRejected("value too long for type".into()));
            }
            self.inner.insert_post(post).await
        }
    }

    fn options(limit: usize) -> RunOptions {
        RunOptions {
            limit,
            delay: Duration::ZERO,
            ..RunOptions::default()
        }
    }

    fn assemble<L: VideoLister, S: PostStore>(
        lister: L,
        captions: FakeCaptions,
        store: S,
        options: RunOptions,
    ) -> Pipeline<L, FakeCaptions, S> {
        let resolver = TranscriptResolver::with_retry_delay(captions, Duration::ZERO);
        Pipeline::new(lister, resolver, store, options)
    }

    async fn pipeline(
        lister: FakeLister,
        db: &Path,
        options: RunOptions,
    ) -> Result<Pipeline<FakeLister, FakeCaptions, SqliteStore>> {
        let store = SqliteStore::open(db).await?;
        Ok(assemble(lister, FakeCaptions::default(), store, options))
    }

    fn vi_channel(id: &str) -> ChannelEntry {
        ChannelEntry::new(&format!("Channel {id}"), id, Language::Vi)
    }

    #[tokio::test]
    async fn shorts_are_never_written_when_excluded() -> Result<()> {
        let dir = tempdir()?;
        let lister = FakeLister::default().with(
            "UCa",
            vec![Ok(video("s1", 30.0)), Ok(video("v1", 600.0)), Ok(video("s2", 60.0))],
        );
        let run = pipeline(lister, &dir.path().join("db"), options(5)).await?;
        let entry = vi_channel("UCa");

        let summary = run.run(&[&entry]).await?;
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.filtered, 2);
        let store = run.store();
        assert_eq!(store.post_count().await?, 1);
        assert!(store.get_post(&watch_url("s1")).await?.is_none());
        assert!(store.get_post(&watch_url("s2")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn included_shorts_are_written() -> Result<()> {
        let dir = tempdir()?;
        let lister = FakeLister::default().with("UCa", vec![Ok(video("s1", 30.0))]);
        let mut opts = options(5);
        opts.include_shorts = true;
        let run = pipeline(lister, &dir.path().join("db"), opts).await?;

        let summary = run.run(&[&vi_channel("UCa")]).await?;
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.filtered, 0);
        Ok(())
    }

    #[tokio::test]
    async fn listed_short_with_broken_details_does_not_take_a_slot() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_stub_script(
            temp.path(),
            r#"
url="${@: -1}"
if [[ " $* " == *" --flat-playlist "* ]]; then
  cat <<'JSON'
{"channel": "Stub", "entries": [
  {"id": "sh1", "url": "https://www.youtube.com/shorts/sh1", "title": "Tiny"},
  {"id": "long1", "url": "https://www.youtube.com/watch?v=long1", "title": "Long", "duration": 600}
]}
JSON
  exit 0
fi
case "$url" in
  *long1*) echo '{"title": "Long", "duration": 600, "upload_date": "20240305"}' ;;
  *) echo "ERROR: [youtube] sh1: Video unavailable" >&2; exit 1 ;;
esac
"#,
        )?;
        let _guard = set_ytdlp_stub_path(stub);

        let store = SqliteStore::open(&temp.path().join("db")).await?;
        let run = assemble(YtDlpLister::new(0), FakeCaptions::default(), store, options(1));

        let summary = run.run(&[&vi_channel("UCstub")]).await?;
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.filtered, 1);
        assert!(run.store().get_post(&watch_url("long1")).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn second_run_inserts_nothing() -> Result<()> {
        let dir = tempdir()?;
        let db = dir.path().join("db");
        let entry = vi_channel("UCa");

        let lister = FakeLister::default().with("UCa", long_videos(&["v1", "v2"]));
        let first = pipeline(lister, &db, options(5)).await?;
        assert_eq!(first.run(&[&entry]).await?.inserted, 2);

        let lister = FakeLister::default().with("UCa", long_videos(&["v1", "v2"]));
        let second = pipeline(lister, &db, options(5)).await?;
        let summary = second.run(&[&entry]).await?;
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.skipped, 2);
        assert_eq!(second.store().post_count().await?, 2);
        assert_eq!(second.store().creator_count().await?, 1);
        assert_eq!(
            *second.resolver.source().calls.borrow(),
            0,
            "existing videos skip transcript fetches"
        );
        Ok(())
    }

    #[tokio::test]
    async fn posts_without_captions_are_still_written() -> Result<()> {
        let dir = tempdir()?;
        let mut captions = FakeCaptions::default();
        captions
            .tracks
            .insert(("v2".into(), Language::En), "hello there".into());
        let lister = FakeLister::default().with("UCa", long_videos(&["v1", "v2"]));
        let store = SqliteStore::open(&dir.path().join("db")).await?;
        let run = assemble(lister, captions, store, options(5));

        let summary = run.run(&[&vi_channel("UCa")]).await?;
        assert_eq!(summary.inserted, 2);

        let bare = run.store().get_post(&watch_url("v1")).await?.expect("v1 written");
        assert_eq!(bare.transcript, None);
        assert_eq!(bare.transcript_en, None);

        let fallback = run.store().get_post(&watch_url("v2")).await?.expect("v2 written");
        assert_eq!(fallback.language, "vi");
        assert_eq!(fallback.transcript, None);
        assert_eq!(fallback.transcript_en.as_deref(), Some("hello there"));
        assert_eq!(fallback.published_at.as_deref(), Some("2024-03-05T12:00:00Z"));
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_channel_does_not_stop_the_run() -> Result<()> {
        let dir = tempdir()?;
        let lister = FakeLister::default()
            .with("UCa", long_videos(&["a1"]))
            .with("UCc", long_videos(&["c1"]));
        let run = pipeline(lister, &dir.path().join("db"), options(5)).await?;
        let channels = [vi_channel("UCa"), vi_channel("UCbroken"), vi_channel("UCc")];
        let refs: Vec<&ChannelEntry> = channels.iter().collect();

        let summary = run.run(&refs).await?;
        assert_eq!(summary.channels_processed, 2);
        assert_eq!(summary.channels_failed, 1);
        assert_eq!(summary.inserted, 2);
        assert_eq!(run.lister.listed_ids(), ["UCa", "UCbroken", "UCc"]);
        Ok(())
    }

    #[tokio::test]
    async fn fatal_database_error_aborts_before_later_channels() -> Result<()> {
        let dir = tempdir()?;
        let lister = FakeLister::default()
            .with("UCa", long_videos(&["a1", "a2", "a3"]))
            .with("UCb", long_videos(&["b1"]));
        let store = FailingStore {
            inner: SqliteStore::open(&dir.path().join("db")).await?,
            fatal: vec![watch_url("a2")],
            rejected: Vec::new(),
        };
        let run = assemble(lister, FakeCaptions::default(), store, options(5));
        let channels = [vi_channel("UCa"), vi_channel("UCb")];
        let refs: Vec<&ChannelEntry> = channels.iter().collect();

        let err = run.run(&refs).await.unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert_eq!(run.lister.listed_ids(), ["UCa"]);

        let inner = &run.store().inner;
        assert_eq!(inner.post_count().await?, 1, "rows before the failure stay committed");
        assert!(inner.get_post(&watch_url("a3")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rejected_row_counts_as_failed_and_the_run_continues() -> Result<()> {
        let dir = tempdir()?;
        let lister = FakeLister::default()
            .with("UCa", long_videos(&["r1", "r2"]))
            .with("UCb", long_videos(&["b1"]));
        let store = FailingStore {
            inner: SqliteStore::open(&dir.path().join("db")).await?,
            fatal: Vec::new(),
            rejected: vec![watch_url("r1")],
        };
        let run = assemble(lister, FakeCaptions::default(), store, options(5));
        let channels = [vi_channel("UCa"), vi_channel("UCb")];
        let refs: Vec<&ChannelEntry> = channels.iter().collect();

        let summary = run.run(&refs).await?;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.channels_processed, 2);
        assert_eq!(summary.channels_failed, 0);
        assert!(run.store().inner.get_post(&watch_url("r2")).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_video_in_listing_leaves_one_row() -> Result<()> {
        let dir = tempdir()?;
        let lister = FakeLister::default().with("UCa", long_videos(&["dup", "dup"]));
        let run = pipeline(lister, &dir.path().join("db"), options(5)).await?;

        let summary = run.run(&[&vi_channel("UCa")]).await?;
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(run.store().post_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_creator() -> Result<()> {
        let dir = tempdir()?;
        let db = dir.path().join("db");
        let entry = vi_channel("UCa");
        let first = pipeline(
            FakeLister::default().with("UCa", long_videos(&["v1"])),
            &db,
            options(5),
        )
        .await?;
        let second = pipeline(
            FakeLister::default().with("UCa", long_videos(&["v1"])),
            &db,
            options(5),
        )
        .await?;

        let entries = [&entry];
        let (a, b) = tokio::join!(first.run(&entries), second.run(&entries));
        let (a, b) = (a?, b?);
        assert_eq!(a.inserted + b.inserted, 1);
        assert_eq!(a.skipped + b.skipped, 1);
        assert_eq!(first.store().creator_count().await?, 1);
        assert_eq!(first.store().post_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn limit_counts_failures_but_not_shorts() -> Result<()> {
        let dir = tempdir()?;
        let lister = FakeLister::default().with(
            "UCa",
            vec![
                Ok(video("s1", 20.0)),
                Err("private video".into()),
                Ok(video("v1", 600.0)),
                Ok(video("v2", 600.0)),
            ],
        );
        let run = pipeline(lister, &dir.path().join("db"), options(2)).await?;

        let summary = run.run(&[&vi_channel("UCa")]).await?;
        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.inserted, 1);
        assert!(run.store().get_post(&watch_url("v2")).await?.is_none());
        assert_eq!(run.lister.listed.borrow()[0], ("UCa".to_owned(), 2));
        Ok(())
    }

    #[tokio::test]
    async fn min_views_filters_quiet_videos() -> Result<()> {
        let dir = tempdir()?;
        let mut quiet = video("quiet", 600.0);
        quiet.view_count = Some(10);
        let mut unknown = video("unknown", 600.0);
        unknown.view_count = None;
        let lister = FakeLister::default()
            .with("UCa", vec![Ok(quiet), Ok(unknown), Ok(video("loud", 600.0))]);
        let mut opts = options(5);
        opts.min_views = 500;
        let run = pipeline(lister, &dir.path().join("db"), opts).await?;

        let summary = run.run(&[&vi_channel("UCa")]).await?;
        assert_eq!(summary.filtered, 2);
        assert_eq!(summary.inserted, 1);
        assert!(run.store().get_post(&watch_url("loud")).await?.is_some());
        Ok(())
    }

    #[test]
    fn summary_renders_every_counter() {
        let summary = RunSummary {
            channels_processed: 3,
            channels_failed: 1,
            inserted: 4,
            skipped: 2,
            filtered: 5,
            failed: 1,
        };
        let text = summary.to_string();
        assert!(text.contains("Channels processed: 3"));
        assert!(text.contains("Videos filtered:    5"));
        assert!(text.ends_with("Videos failed:      1"));
    }
}
