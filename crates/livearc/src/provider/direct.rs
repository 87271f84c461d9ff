use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{DownloadUrls, LiveStatus, MetadataProvider};
use crate::error::{ArchiveError, Result};
use crate::quality::AUDIO_ITAG;
use crate::track::{TrackKind, UrlTemplate};

const FRAGMENT_HOST_SUFFIX: &str = ".googlevideo.com";

/// A raw fragment URL taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectUrl {
    pub template: UrlTemplate,
    pub itag: u32,
    pub video_id: Option<String>,
}

/// Turn a copied fragment URL into a template for `track`.
///
/// The URL must point at the fragment CDN, be fragmented (`noclen`) and carry
/// an itag matching the track. Any `&sq=` tail is replaced by the placeholder.
pub fn parse_direct_url(input: &str, track: TrackKind) -> Result<DirectUrl> {
    let parsed = Url::parse(input).map_err(|e| ArchiveError::invalid_direct_url(input, e.to_string()))?;

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if !host.ends_with(FRAGMENT_HOST_SUFFIX) {
        return Err(ArchiveError::invalid_direct_url(
            input,
            "not a fragment CDN URL",
        ));
    }

    let mut noclen = false;
    let mut itag = None;
    let mut id = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "noclen" => noclen = true,
            "itag" => itag = Some(value.into_owned()),
            "id" => id = Some(value.into_owned()),
            _ => {}
        }
    }

    if !noclen {
        return Err(ArchiveError::invalid_direct_url(
            input,
            "URL is not for a fragmented stream",
        ));
    }

    let itag: u32 = itag
        .as_deref()
        .ok_or_else(|| ArchiveError::invalid_direct_url(input, "missing itag parameter"))?
        .parse()
        .map_err(|_| ArchiveError::invalid_direct_url(input, "itag is not a number"))?;

    match track {
        TrackKind::Audio if itag != AUDIO_ITAG => {
            return Err(ArchiveError::invalid_direct_url(
                input,
                format!("audio URL must use itag {AUDIO_ITAG}, found {itag}"),
            ));
        }
        TrackKind::Video if itag == AUDIO_ITAG => {
            return Err(ArchiveError::invalid_direct_url(
                input,
                "video URL carries the audio itag",
            ));
        }
        _ => {}
    }

    let escaped = input.replace('%', "%%");
    let cut = escaped.find("&sq=").unwrap_or(escaped.len());
    let template = UrlTemplate::parse(format!("{}&sq=%d", &escaped[..cut]))?;

    let video_id = id.map(|id| match id.rfind('.') {
        Some(dot) => id[..dot].to_owned(),
        None => id,
    });

    Ok(DirectUrl {
        template,
        itag,
        video_id,
    })
}

/// Provider over fixed fragment URLs. It can never produce a fresh URL, and
/// its live status is whatever it was told at construction.
#[derive(Debug, Clone)]
pub struct DirectUrlProvider {
    templates: BTreeMap<u32, UrlTemplate>,
    live: bool,
    target_duration: Option<Duration>,
}

impl DirectUrlProvider {
    /// One URL per recorded track.
    pub fn new(urls: impl IntoIterator<Item = DirectUrl>) -> Self {
        let templates = urls.into_iter().map(|url| (url.itag, url.template)).collect();
        Self {
            templates,
            live: false,
            target_duration: None,
        }
    }

    /// Build from already validated templates, bypassing the CDN checks.
    pub fn from_templates(templates: BTreeMap<u32, UrlTemplate>) -> Self {
        Self {
            templates,
            live: false,
            target_duration: None,
        }
    }

    /// Treat the stream as live. Fragment failures are then retried forever
    /// instead of ending the track.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn with_target_duration(mut self, duration: Duration) -> Self {
        self.target_duration = Some(duration);
        self
    }
}

#[async_trait]
impl MetadataProvider for DirectUrlProvider {
    async fn download_urls(&self) -> Result<DownloadUrls> {
        Ok(DownloadUrls {
            templates: self.templates.clone(),
            last_sq: None,
        })
    }

    async fn live_status(&self) -> Result<LiveStatus> {
        Ok(LiveStatus {
            is_live: self.live,
            target_duration: self.target_duration,
            ..Default::default()
        })
    }

    async fn refresh_track_url(&self, _track: TrackKind, _itag: u32) -> Result<Option<UrlTemplate>> {
        Ok(None)
    }

    fn can_refresh(&self) -> bool {
        false
    }
}
