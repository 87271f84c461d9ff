//! Contract with whatever knows about the broadcast: its fragment URLs and
//! whether it is still live.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::track::{TrackKind, UrlTemplate};

pub mod direct;
pub mod refresher;

pub use direct::{DirectUrl, DirectUrlProvider, parse_direct_url};
pub use refresher::MetadataRefresher;

/// Per-itag URL templates plus the highest sequence number any manifest reported.
#[derive(Debug, Clone, Default)]
pub struct DownloadUrls {
    pub templates: BTreeMap<u32, UrlTemplate>,
    pub last_sq: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStatus {
    pub is_live: bool,
    /// Private, removed or members only. Terminal.
    pub is_unavailable: bool,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    /// Fragment length advertised by the stream.
    pub target_duration: Option<Duration>,
}

impl LiveStatus {
    /// The broadcast has not started and has not ended.
    pub fn is_upcoming(&self) -> bool {
        !self.is_live && !self.is_unavailable && self.end_timestamp.is_none()
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn download_urls(&self) -> Result<DownloadUrls>;

    async fn live_status(&self) -> Result<LiveStatus>;

    /// Derive a fresh signed URL for a track. `None` when nothing better is known.
    async fn refresh_track_url(&self, track: TrackKind, itag: u32) -> Result<Option<UrlTemplate>>;

    /// Providers over fixed URLs cannot produce fresh ones.
    fn can_refresh(&self) -> bool {
        true
    }
}
