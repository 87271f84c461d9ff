//! Capture settings, grouped per concern, and the shared HTTP client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::error::{ArchiveError, Result};
use crate::track::TrackKind;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";
pub const DEFAULT_ORIGIN: &str = "https://www.youtube.com";

/// Lowest poll interval accepted while waiting for a stream or revalidating
/// metadata. Providers rate limit aggressive pollers.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// HTTP client settings shared by every fragment worker.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,

    /// Sent as `Origin`; the `Referer` is derived from it.
    pub origin: String,

    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,

    /// Maximum time to wait for response headers or the next body chunk.
    pub read_timeout: Duration,

    /// Optional proxy URL (`http://`, `https://` or `socks5://`).
    pub proxy: Option<String>,

    pub force_ipv4: bool,

    pub force_ipv6: bool,

    /// Extra headers added to every request.
    pub headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            origin: DEFAULT_ORIGIN.to_owned(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            proxy: None,
            force_ipv4: false,
            force_ipv6: false,
            headers: Vec::new(),
        }
    }
}

/// Fragment worker behaviour.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Concurrent fragment workers per track.
    pub jobs: usize,

    /// Attempts for one fragment before live status is consulted. 0 means
    /// retry forever.
    pub frag_max_tries: u32,

    /// Extra rounds of `frag_max_tries` granted to a fragment well behind the
    /// known end of a finished stream.
    pub full_retries: u32,

    /// Stage downloaded fragments in side files instead of memory.
    pub stage_to_files: bool,

    /// A fetch slower than `slow_factor * target_duration` counts as slow.
    pub slow_factor: f64,

    /// Fragments within this many sequence numbers of the live edge are never
    /// considered slow.
    pub slow_edge_margin: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            frag_max_tries: 10,
            full_retries: 3,
            stage_to_files: true,
            slow_factor: 1.5,
            slow_edge_margin: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Consecutive failed writes tolerated before the capture is aborted.
    pub max_write_tries: u32,

    /// Sleep between loop turns when nothing completed and nothing can be issued.
    pub idle_poll_interval: Duration,

    /// How far back an origin keeps fragments of a running broadcast.
    pub live_seekable_window: Duration,

    /// Bytes handed to a single `write` call.
    pub write_chunk_size: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_write_tries: 10,
            idle_poll_interval: Duration::from_millis(100),
            live_seekable_window: Duration::from_secs(5 * 24 * 60 * 60),
            write_chunk_size: 8192,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Minimum spacing between two metadata provider calls.
    pub min_interval: Duration,

    /// Wall-clock period after which a running capture revalidates its
    /// metadata even when nothing failed.
    pub revalidate_interval: Duration,

    /// Slow fragments needed to force a URL refresh.
    pub slow_threshold: u32,

    /// Window, in sequence numbers, within which slow fragments accumulate.
    pub slow_window: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_interval: MIN_POLL_INTERVAL,
            revalidate_interval: Duration::from_secs(60 * 60),
            slow_threshold: 10,
            slow_window: 10,
        }
    }
}

/// What to do when the stream has not started yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Fail right away.
    #[default]
    NoWait,
    /// Sleep until the scheduled start, then poll at the minimum interval.
    UntilScheduled,
    /// Poll on a fixed interval.
    Poll(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct WaitConfig {
    pub policy: WaitPolicy,
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        match self.policy {
            WaitPolicy::Poll(interval) => interval,
            WaitPolicy::NoWait | WaitPolicy::UntilScheduled => MIN_POLL_INTERVAL,
        }
    }
}

/// Which tracks a capture records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrackSelection {
    #[default]
    Both,
    AudioOnly,
    VideoOnly,
}

impl TrackSelection {
    pub fn includes(self, kind: TrackKind) -> bool {
        match self {
            TrackSelection::Both => true,
            TrackSelection::AudioOnly => kind == TrackKind::Audio,
            TrackSelection::VideoOnly => kind == TrackKind::Video,
        }
    }

    pub fn kinds(self) -> impl Iterator<Item = TrackKind> {
        TrackKind::ALL.into_iter().filter(move |&kind| self.includes(kind))
    }
}

/// Everything a capture needs to know, grouped per concern.
#[derive(Debug, Clone, Default)]
pub struct ArchiveConfig {
    pub tracks: TrackSelection,
    pub http: HttpConfig,
    pub fetcher: FetcherConfig,
    pub sequencer: SequencerConfig,
    pub refresh: RefreshConfig,
    pub wait: WaitConfig,
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fetcher.jobs == 0 {
            return Err(ArchiveError::configuration("jobs must be at least 1"));
        }
        if self.sequencer.max_write_tries == 0 {
            return Err(ArchiveError::configuration(
                "max_write_tries must be at least 1",
            ));
        }
        if self.sequencer.write_chunk_size == 0 {
            return Err(ArchiveError::configuration(
                "write_chunk_size must be at least 1",
            ));
        }
        if !(self.fetcher.slow_factor > 0.0) {
            return Err(ArchiveError::configuration("slow_factor must be positive"));
        }
        if let WaitPolicy::Poll(interval) = self.wait.policy
            && interval < MIN_POLL_INTERVAL
        {
            return Err(ArchiveError::configuration(format!(
                "poll interval must be at least {}s",
                MIN_POLL_INTERVAL.as_secs()
            )));
        }
        if self.http.force_ipv4 && self.http.force_ipv6 {
            return Err(ArchiveError::configuration(
                "force_ipv4 and force_ipv6 are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Build the HTTP client used by fragment workers and providers.
pub fn create_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Ignoring invalid custom header"),
        }
    }

    let mut builder = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout);

    if config.force_ipv4 {
        builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    } else if config.force_ipv6 {
        builder = builder.local_address(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| ArchiveError::configuration(format!("invalid proxy URL: {e}")))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}
