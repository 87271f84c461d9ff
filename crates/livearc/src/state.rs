//! Shared flags of one capture and the per-track handles.
//!
//! Stream-wide flags sit behind one coarse read/write lock because every
//! fragment completion reads them and only the refresher writes them. Each
//! track keeps its own lock so a URL swap on one track never stalls the other.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::track::{TrackKind, UrlTemplate};

/// Fallback fragment duration until the provider reports one.
pub const DEFAULT_TARGET_DURATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct StreamFlags {
    live: bool,
    unavailable: bool,
    stopping: bool,
    target_duration: Duration,
    last_sq: Option<u64>,
    last_updated: Option<Instant>,
}

/// Cross-track state of a single capture. A track left out of the capture
/// is `None`.
#[derive(Debug)]
pub struct StreamState {
    flags: RwLock<StreamFlags>,
    audio: Option<Arc<TrackHandle>>,
    video: Option<Arc<TrackHandle>>,
    token: CancellationToken,
}

impl StreamState {
    pub fn new(audio: Option<TrackHandle>, video: Option<TrackHandle>, live: bool) -> Arc<Self> {
        Arc::new(Self {
            flags: RwLock::new(StreamFlags {
                live,
                unavailable: false,
                stopping: false,
                target_duration: DEFAULT_TARGET_DURATION,
                last_sq: None,
                last_updated: None,
            }),
            audio: audio.map(Arc::new),
            video: video.map(Arc::new),
            token: CancellationToken::new(),
        })
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<TrackHandle>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Captured tracks, audio first.
    pub fn tracks(&self) -> impl Iterator<Item = &Arc<TrackHandle>> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn is_live(&self) -> bool {
        self.flags.read().live
    }

    pub fn set_live(&self, live: bool) {
        self.flags.write().live = live;
    }

    pub fn is_unavailable(&self) -> bool {
        self.flags.read().unavailable
    }

    /// The stream went private or was removed. Terminal.
    pub fn mark_unavailable(&self) {
        let mut flags = self.flags.write();
        flags.unavailable = true;
        flags.live = false;
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.read().stopping
    }

    pub fn target_duration(&self) -> Duration {
        self.flags.read().target_duration
    }

    pub fn set_target_duration(&self, duration: Duration) {
        if !duration.is_zero() {
            self.flags.write().target_duration = duration;
        }
    }

    /// Highest sequence number a manifest has reported.
    pub fn last_sq(&self) -> Option<u64> {
        self.flags.read().last_sq
    }

    /// Raise the known last sequence number; lower values are ignored.
    pub fn observe_last_sq(&self, seq: u64) {
        let mut flags = self.flags.write();
        if flags.last_sq.is_none_or(|current| seq > current) {
            flags.last_sq = Some(seq);
        }
    }

    /// Time since the provider was last consulted, `None` if never.
    pub fn since_updated(&self) -> Option<Duration> {
        self.flags.read().last_updated.map(|at| at.elapsed())
    }

    pub fn mark_updated(&self) {
        self.flags.write().last_updated = Some(Instant::now());
    }

    /// Request a halt. Idempotent; every track is marked finished so no new
    /// work is issued, and every cancellable sleep wakes up.
    pub fn stop(&self) {
        {
            let mut flags = self.flags.write();
            if flags.stopping {
                return;
            }
            flags.stopping = true;
        }
        info!("Stopping capture");
        for track in self.tracks() {
            track.mark_finished();
        }
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Sleep unless the capture is stopped first. Returns `false` when the
    /// sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[derive(Debug)]
struct TrackData {
    url: UrlTemplate,
    host: Option<String>,
    finished: bool,
    in_progress: bool,
}

/// One track's mutable fields behind their own lock, plus a live worker count.
#[derive(Debug)]
pub struct TrackHandle {
    kind: TrackKind,
    itag: u32,
    base_path: PathBuf,
    data: RwLock<TrackData>,
    active_jobs: AtomicUsize,
}

impl TrackHandle {
    /// `base_path` is the output path without the `.ts` extension; staged
    /// fragments and the output file are derived from it.
    pub fn new(kind: TrackKind, itag: u32, url: UrlTemplate, base_path: impl Into<PathBuf>) -> Self {
        let host = url.host();
        Self {
            kind,
            itag,
            base_path: base_path.into(),
            data: RwLock::new(TrackData {
                url,
                host,
                finished: false,
                in_progress: false,
            }),
            active_jobs: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn itag(&self) -> u32 {
        self.itag
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn output_path(&self) -> PathBuf {
        with_suffix(&self.base_path, ".ts")
    }

    pub fn staged_fragment_path(&self, seq: u64) -> PathBuf {
        with_suffix(&self.base_path, &format!(".frag{seq}.ts"))
    }

    pub fn url(&self) -> UrlTemplate {
        self.data.read().url.clone()
    }

    pub fn host(&self) -> Option<String> {
        self.data.read().host.clone()
    }

    /// Swap in a new URL. Returns `false` when it equals the current one.
    pub fn set_url(&self, url: UrlTemplate) -> bool {
        let mut data = self.data.write();
        if data.url == url {
            return false;
        }
        debug!(track = %self.kind, "Download URL replaced");
        data.host = url.host();
        data.url = url;
        true
    }

    pub fn is_finished(&self) -> bool {
        self.data.read().finished
    }

    /// Once set, never cleared.
    pub fn mark_finished(&self) {
        let mut data = self.data.write();
        if !data.finished {
            data.finished = true;
            debug!(track = %self.kind, "Track marked finished");
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.data.read().in_progress
    }

    pub fn set_in_progress(&self, in_progress: bool) {
        self.data.write().in_progress = in_progress;
    }

    /// Workers currently holding a fragment.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Acquire)
    }

    pub fn begin_job(&self) -> JobGuard<'_> {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
        JobGuard { track: self }
    }
}

/// Decrements the active job count when dropped.
#[derive(Debug)]
pub struct JobGuard<'a> {
    track: &'a TrackHandle,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.track.active_jobs.fetch_sub(1, Ordering::AcqRel);
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_state(live: bool) -> Arc<StreamState> {
        let url = UrlTemplate::parse("https://media.example.com/vp?itag=140&sq=%d").unwrap();
        let audio = TrackHandle::new(TrackKind::Audio, 140, url.clone(), "/tmp/x.f140");
        let video = TrackHandle::new(TrackKind::Video, 299, url, "/tmp/x.f299");
        StreamState::new(Some(audio), Some(video), live)
    }

    #[test]
    fn stop_is_idempotent_and_finishes_tracks() {
        let state = test_state(true);
        assert!(!state.track(TrackKind::Audio).unwrap().is_finished());
        state.stop();
        state.stop();
        assert!(state.is_stopping());
        assert!(state.token().is_cancelled());
        assert_eq!(state.tracks().count(), 2);
        for track in state.tracks() {
            assert!(track.is_finished());
        }
    }

    #[test]
    fn single_track_capture_has_no_other_track() {
        let url = UrlTemplate::parse("https://media.example.com/vp?itag=299&sq=%d").unwrap();
        let video = TrackHandle::new(TrackKind::Video, 299, url, "/tmp/x.f299");
        let state = StreamState::new(None, Some(video), true);
        assert!(state.track(TrackKind::Audio).is_none());
        let kinds: Vec<_> = state.tracks().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec![TrackKind::Video]);

        state.stop();
        assert!(state.track(TrackKind::Video).unwrap().is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn update_age_follows_the_runtime_clock() {
        let state = test_state(true);
        assert_eq!(state.since_updated(), None);
        state.mark_updated();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(state.since_updated().is_some_and(|age| age >= Duration::from_secs(90)));
    }

    #[test]
    fn last_sq_never_decreases() {
        let state = test_state(true);
        assert_eq!(state.last_sq(), None);
        state.observe_last_sq(10);
        state.observe_last_sq(4);
        assert_eq!(state.last_sq(), Some(10));
        state.observe_last_sq(11);
        assert_eq!(state.last_sq(), Some(11));
    }

    #[test]
    fn unavailable_clears_live() {
        let state = test_state(true);
        state.mark_unavailable();
        assert!(!state.is_live());
        assert!(state.is_unavailable());
    }

    #[test]
    fn url_swap_reports_changes() {
        let state = test_state(false);
        let track = state.track(TrackKind::Video).unwrap();
        assert!(!track.set_url(track.url()));
        let fresh = UrlTemplate::parse("https://other.example.com/vp?sq=%d").unwrap();
        assert!(track.set_url(fresh));
        assert_eq!(track.host().as_deref(), Some("other.example.com"));
    }

    #[test]
    fn derived_paths_and_job_guard() {
        let state = test_state(false);
        let track = state.track(TrackKind::Audio).unwrap();
        assert_eq!(track.output_path(), PathBuf::from("/tmp/x.f140.ts"));
        assert_eq!(
            track.staged_fragment_path(12),
            PathBuf::from("/tmp/x.f140.frag12.ts")
        );
        {
            let _a = track.begin_job();
            let _b = track.begin_job();
            assert_eq!(track.active_jobs(), 2);
        }
        assert_eq!(track.active_jobs(), 0);
    }

    #[tokio::test]
    async fn sleep_wakes_on_stop() {
        let state = test_state(true);
        let sleeper = Arc::clone(&state);
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });
        state.stop();
        assert!(!handle.await.unwrap());
    }
}
