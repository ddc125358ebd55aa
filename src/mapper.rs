//! Row mapping: pure functions from listed videos and resolved transcripts
//! to the rows the store writes. Nothing here does I/O.

use chrono::{DateTime, NaiveDate, Utc};

use crate::lister::{ChannelProfile, VideoDescriptor};
use crate::registry::{ChannelEntry, Language};
use crate::store::{CreatorId, NewCreator, Platform, Post, PostStatus, PostType};
use crate::transcript::TranscriptResult;
use crate::ytdlp::watch_url;

/// Lowercases `name`, drops apostrophes and dots, and collapses every other
/// run of non-alphanumeric characters into a single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if matches!(ch, '\'' | '’' | '.') {
            continue;
        }
        if ch.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Builds the creator row for a channel. Registry names win over the title
/// YouTube reports; ad-hoc channels fall back to the reported title and then
/// to the channel id.
pub fn new_creator(entry: &ChannelEntry, profile: &ChannelProfile) -> NewCreator {
    let name = Some(entry.name.trim())
        .filter(|name| !name.is_empty())
        .or_else(|| profile.title.as_deref().map(str::trim).filter(|t| !t.is_empty()))
        .unwrap_or(entry.channel_id.as_str())
        .to_owned();

    let slug = match slugify(&name) {
        slug if slug.is_empty() => entry.channel_id.to_ascii_lowercase(),
        slug => slug,
    };

    NewCreator {
        name,
        slug,
        channel_url: entry.channel_url(),
        avatar_url: profile.avatar_url.clone(),
    }
}

/// Prefers the exact epoch timestamp; otherwise a `YYYYMMDD` upload date is
/// taken as midnight UTC.
pub fn normalize_published(
    timestamp: Option<i64>,
    upload_date: Option<&str>,
) -> Option<DateTime<Utc>> {
    if let Some(datetime) = timestamp.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)) {
        return Some(datetime);
    }
    let date = NaiveDate::parse_from_str(upload_date?.trim(), "%Y%m%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

pub fn map_post(
    creator_id: &CreatorId,
    descriptor: &VideoDescriptor,
    transcript: &TranscriptResult,
    language: Language,
) -> Post {
    let title = match descriptor.title.trim() {
        "" => descriptor.video_id.clone(),
        title => title.to_owned(),
    };

    Post {
        creator_id: creator_id.clone(),
        post_type: PostType::Review,
        status: PostStatus::Draft,
        language,
        source: Platform::Youtube,
        platform: Platform::Youtube,
        title,
        summary: None,
        source_url: watch_url(&descriptor.video_id),
        thumbnail_url: descriptor.thumbnail_url.clone(),
        transcript: transcript.text_for(Language::Vi).map(str::to_owned),
        transcript_en: transcript.text_for(Language::En).map(str::to_owned),
        published_at: normalize_published(descriptor.timestamp, descriptor.upload_date.as_deref()),
    }
}
