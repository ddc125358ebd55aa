#![forbid(unsafe_code)]

//! Syncs recent uploads of the configured YouTube channels into the posts
//! table. Meant to be run on a schedule; rerunning is always safe.

use anyhow::{Result, bail};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tubesync_tools::{
    config::{CredentialOverrides, DEFAULT_ENV_PATH, resolve_credentials},
    lister::YtDlpLister,
    pipeline::{Pipeline, RunOptions, RunSummary},
    registry::{ChannelEntry, ChannelRegistry, LanguageSelector},
    store::{SqliteStore, SupabaseStore},
    transcript::{TranscriptResolver, YtDlpCaptions},
    ytdlp::ensure_program_available,
};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "sync_channels",
    about = "Fetch recent YouTube uploads with transcripts and store them as draft posts"
)]
struct SyncArgs {
    /// Language group to sync. With --channel, the channel's language ("all" means vi).
    #[arg(long, value_enum, default_value_t = LanguageSelector::All)]
    lang: LanguageSelector,

    /// Videos per channel. Defaults to the registry's default_limit, or 5.
    #[arg(long, value_parser = parse_positive)]
    limit: Option<usize>,

    #[arg(long)]
    include_shorts: bool,

    /// Skip this many of the newest uploads.
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Seconds to wait between videos.
    #[arg(long, default_value_t = 2)]
    delay: u64,

    /// Ignore videos with fewer views. 0 disables the filter.
    #[arg(long, default_value_t = 0)]
    min_views: u64,

    /// Sync a single channel id instead of the registry.
    #[arg(long, value_name = "CHANNEL_ID")]
    channel: Option<String>,

    /// TOML channel registry replacing the built-in one.
    #[arg(long, value_name = "FILE")]
    registry: Option<PathBuf>,

    #[arg(long, value_name = "PATH", default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,

    /// Overrides SUPABASE_URL from the environment and env file.
    #[arg(long, value_name = "URL")]
    supabase_url: Option<String>,

    /// Overrides SUPABASE_KEY. Prefer the environment on shared machines.
    #[arg(long, value_name = "KEY")]
    supabase_key: Option<String>,

    /// Write to a local SQLite mirror instead of Supabase.
    #[arg(long, value_name = "PATH")]
    sqlite: Option<PathBuf>,
}

fn parse_positive(value: &str) -> Result<usize, String> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err("must be a positive integer".into()),
        Ok(parsed) => Ok(parsed),
        Err(err) => Err(err.to_string()),
    }
}

impl SyncArgs {
    fn load_registry(&self) -> Result<ChannelRegistry> {
        match &self.registry {
            Some(path) => ChannelRegistry::load(path),
            None => Ok(ChannelRegistry::builtin()),
        }
    }

    fn channels(&self, registry: &ChannelRegistry) -> Result<Vec<ChannelEntry>> {
        if let Some(channel_id) = &self.channel {
            let channel_id = channel_id.trim();
            if channel_id.is_empty() {
                bail!("--channel needs a channel id");
            }
            return Ok(vec![ChannelEntry::ad_hoc(
                channel_id,
                self.lang.single_language(),
            )]);
        }
        let selected: Vec<ChannelEntry> = registry.select(self.lang).into_iter().cloned().collect();
        if selected.is_empty() {
            bail!("no channels configured for --lang {:?}", self.lang);
        }
        Ok(selected)
    }

    fn credential_overrides(&self) -> CredentialOverrides {
        CredentialOverrides {
            supabase_url: self.supabase_url.clone(),
            supabase_key: self.supabase_key.clone(),
            env_path: Some(self.env_file.clone()),
        }
    }

    fn run_options(&self, registry: &ChannelRegistry) -> RunOptions {
        RunOptions {
            limit: self.limit.unwrap_or_else(|| registry.limit()),
            include_shorts: self.include_shorts,
            min_views: self.min_views,
            delay: Duration::from_secs(self.delay),
        }
    }
}

async fn run(args: SyncArgs) -> Result<RunSummary> {
    let registry = args.load_registry()?;
    let channels = args.channels(&registry)?;
    let options = args.run_options(&registry);
    let channel_refs: Vec<&ChannelEntry> = channels.iter().collect();

    ensure_program_available("yt-dlp")?;
    let lister = YtDlpLister::new(args.offset).fetch_short_details(options.include_shorts);
    let resolver = TranscriptResolver::new(YtDlpCaptions);

    info!(
        "Syncing {} channel(s): limit {}, offset {}, shorts {}, delay {}s",
        channels.len(),
        options.limit,
        args.offset,
        if options.include_shorts { "included" } else { "excluded" },
        args.delay
    );

    if let Some(path) = &args.sqlite {
        let store = SqliteStore::open(path).await?;
        let pipeline = Pipeline::new(lister, resolver, store, options);
        let summary = pipeline.run(&channel_refs).await?;
        info!(
            "{} now holds {} post(s)",
            path.display(),
            pipeline.store().post_count().await?
        );
        return Ok(summary);
    }

    let credentials = resolve_credentials(args.credential_overrides())?;
    let store = SupabaseStore::new(&credentials.supabase_url, &credentials.supabase_key);
    let pipeline = Pipeline::new(lister, resolver, store, options);
    Ok(pipeline.run(&channel_refs).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let summary = run(SyncArgs::parse()).await?;
    println!("{summary}");
    Ok(())
}
