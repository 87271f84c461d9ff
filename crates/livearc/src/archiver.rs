//! Stream archiver: sets up one capture, spawns a worker pool and a sequencer
//! per recorded track and hands the caller a handle to follow and stop it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{ArchiveConfig, create_client};
use crate::error::{ArchiveError, Result};
use crate::events::ArchiveEvent;
use crate::fetcher::{FragmentSource, HttpFragmentSource};
use crate::persistence::{DownloadState, load_state, remove_state, state_path};
use crate::provider::{LiveStatus, MetadataProvider, MetadataRefresher};
use crate::quality::{QualitySelector, SelectedFormats};
use crate::sequencer::{TrackOutcome, TrackSequencer};
use crate::state::{StreamState, TrackHandle};
use crate::template::{DEFAULT_OUTPUT_TEMPLATE, OutputFields, format_output_name, track_base_path};
use crate::track::TrackKind;
use crate::waiter::LiveWaiter;
use crate::worker::FragmentWorker;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-track result, the input of whatever muxes the tracks together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSummary {
    pub track: TrackKind,
    pub itag: u32,
    pub path: PathBuf,
    pub fragments: u64,
    pub bytes: u64,
    pub start_frag: u64,
}

impl From<TrackOutcome> for TrackSummary {
    fn from(outcome: TrackOutcome) -> Self {
        Self {
            track: outcome.track,
            itag: outcome.itag,
            path: outcome.path,
            fragments: outcome.fragments,
            bytes: outcome.bytes,
            start_frag: outcome.start_frag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Formatted output name, without track suffix or extension.
    pub name: String,
    pub audio: Option<TrackSummary>,
    pub video: Option<TrackSummary>,
    /// The capture was stopped before the stream finished. Outputs then stay
    /// in the working directory next to their resume records.
    pub stopped: bool,
}

impl ArchiveSummary {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackSummary> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Recorded tracks, audio first.
    pub fn tracks(&self) -> impl Iterator<Item = &TrackSummary> {
        self.audio.iter().chain(self.video.iter())
    }
}

/// A running capture.
pub struct ArchiveHandle {
    events: mpsc::Receiver<ArchiveEvent>,
    stop: CancellationToken,
    task: JoinHandle<Result<ArchiveSummary>>,
}

impl ArchiveHandle {
    /// Next progress notification; `None` once every track is done.
    pub async fn next_event(&mut self) -> Option<ArchiveEvent> {
        self.events.recv().await
    }

    /// Ask the capture to stop. Committed data and resume records are kept.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// A token that stops the capture when cancelled, for signal handlers.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait for the capture to end.
    pub async fn wait(self) -> Result<ArchiveSummary> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| ArchiveError::internal(format!("archive task failed: {e}")))?
    }
}

/// Resume inputs of one recorded track.
struct TrackPlan {
    kind: TrackKind,
    state_file: PathBuf,
    resume: Option<DownloadState>,
}

pub struct StreamArchiver {
    config: ArchiveConfig,
    provider: Arc<dyn MetadataProvider>,
    quality: QualitySelector,
    output_dir: PathBuf,
    output_template: String,
    fields: OutputFields,
    source: Option<Arc<dyn FragmentSource>>,
    resume: bool,
}

impl StreamArchiver {
    pub fn new(config: ArchiveConfig, provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            config,
            provider,
            quality: QualitySelector::default(),
            output_dir: PathBuf::from("."),
            output_template: DEFAULT_OUTPUT_TEMPLATE.to_owned(),
            fields: OutputFields::default(),
            source: None,
            resume: true,
        }
    }

    pub fn with_quality(mut self, quality: QualitySelector) -> Self {
        self.quality = quality;
        self
    }

    /// Where finished track files and resume records are written.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_output_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = template.into();
        self
    }

    pub fn with_fields(mut self, fields: OutputFields) -> Self {
        self.fields = fields;
        self
    }

    /// Fetch fragments through `source` instead of an HTTP client built from
    /// the configuration.
    pub fn with_source(mut self, source: Arc<dyn FragmentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// With `false`, resume records of an earlier capture of the same stream
    /// are deleted along with its working directory and the capture starts
    /// over.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Validate the configuration and start the capture in the background.
    pub fn start(self) -> Result<ArchiveHandle> {
        self.config.validate()?;
        // checked here so a bad template never waits for a stream
        format_output_name(&self.output_template, &self.fields)?;

        let stop = CancellationToken::new();
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let span = info_span!("archive", id = %self.fields.id);
        let task = tokio::spawn(self.run_capture(stop.clone(), events_tx).instrument(span));
        Ok(ArchiveHandle { events, stop, task })
    }

    /// Start and wait, discarding progress events.
    pub async fn run(self) -> Result<ArchiveSummary> {
        self.start()?.wait().await
    }

    async fn run_capture(
        self,
        stop: CancellationToken,
        events_tx: mpsc::Sender<ArchiveEvent>,
    ) -> Result<ArchiveSummary> {
        // fixed fragment URLs mean the broadcast has started, nothing to wait for
        let status = if self.provider.can_refresh() {
            let waiter = LiveWaiter::new(Arc::clone(&self.provider), self.config.wait.clone(), stop.clone());
            waiter.wait().await?
        } else {
            self.provider.live_status().await?
        };

        let urls = self.provider.download_urls().await?;
        let formats = self.quality.select_tracks(&urls.templates, self.config.tracks)?;
        info!(
            audio_itag = ?formats.audio.as_ref().map(|f| f.itag),
            video_itag = ?formats.video.as_ref().map(|f| f.itag),
            quality = ?formats.label,
            live = status.is_live,
            "Selected formats"
        );

        let name = format_output_name(&self.output_template, &self.fields)?;
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let state_id = if self.fields.id.is_empty() { name.as_str() } else { self.fields.id.as_str() };

        let mut plans = Vec::with_capacity(2);
        for kind in TrackKind::ALL {
            let Some(format) = formats.get(kind) else {
                continue;
            };
            let state_file = state_path(&self.output_dir, state_id, format.itag);
            let resume = if self.resume { load_resume(&state_file).await } else { None };
            plans.push(TrackPlan { kind, state_file, resume });
        }
        if !self.resume {
            discard_previous(&self.output_dir, state_id, &plans).await;
        }

        let work_dir = self.working_dir(state_id, &plans).await;
        let state = self.build_state(&formats, &name, &work_dir, status.is_live);
        apply_initial_status(&state, &status, urls.last_sq);

        let stop_link = tokio::spawn({
            let state = Arc::clone(&state);
            let stop = stop.clone();
            async move {
                tokio::select! {
                    _ = stop.cancelled() => {
                        info!("Stopping capture");
                        state.stop();
                    }
                    _ = state.token().cancelled() => {}
                }
            }
        });

        let refresher = Arc::new(MetadataRefresher::new(
            Arc::clone(&self.provider),
            Arc::clone(&state),
            self.config.refresh.clone(),
        ));
        let source = match &self.source {
            Some(source) => Arc::clone(source),
            None => {
                let client = create_client(&self.config.http)?;
                Arc::new(HttpFragmentSource::new(client, self.config.http.origin.clone())) as Arc<dyn FragmentSource>
            }
        };

        let monitor = tokio::spawn(
            monitor(Arc::clone(&refresher), self.config.refresh.min_interval).instrument(info_span!("monitor")),
        );

        let state_files: Vec<PathBuf> = plans.iter().map(|plan| plan.state_file.clone()).collect();
        let mut sequencers = Vec::with_capacity(plans.len());
        let mut workers = Vec::new();
        for plan in plans {
            let Some(track) = state.track(plan.kind).cloned() else {
                continue;
            };

            let jobs = self.config.fetcher.jobs;
            let (work_tx, work_rx) = flume::bounded(jobs * 2);
            let (done_tx, done_rx) = mpsc::channel(jobs * 2);

            let worker = Arc::new(FragmentWorker::new(
                Arc::clone(&state),
                Arc::clone(&track),
                Arc::clone(&source),
                Arc::clone(&refresher),
                self.config.fetcher.clone(),
            ));
            workers.extend(worker.spawn_pool(work_rx, done_tx));

            let sequencer = TrackSequencer::new(
                Arc::clone(&state),
                track,
                Arc::clone(&refresher),
                self.config.sequencer.clone(),
                &self.config.refresh,
                jobs,
                work_dir.clone(),
            )
            .with_state_file(plan.state_file, plan.resume)
            .with_events(events_tx.clone());
            sequencers.push(tokio::spawn(sequencer.run(work_tx, done_rx)));
        }
        drop(events_tx);

        let mut outcomes = Vec::with_capacity(sequencers.len());
        let mut failure = None;
        for handle in sequencers {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    error!(error = %e, "Track failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Sequencer task failed");
                    state.stop();
                    failure.get_or_insert(ArchiveError::internal(format!("sequencer task failed: {e}")));
                }
            }
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }

        let stopped = stop.is_cancelled();
        // ends the monitor and the stop link
        state.stop();
        monitor.abort();
        join_helper("monitor", monitor).await;
        join_helper("stop link", stop_link).await;

        if let Some(e) = failure {
            return Err(e);
        }
        if outcomes.len() != state_files.len() {
            return Err(ArchiveError::internal("missing track outcome"));
        }

        if let [first, second] = outcomes.as_slice()
            && first.fragments != second.fragments
        {
            warn!(
                audio = first.fragments,
                video = second.fragments,
                "Tracks ended with different fragment counts, the result may be out of sync"
            );
        }

        if stopped {
            info!(dir = %work_dir.display(), "Capture stopped, keeping state files to resume later");
        } else {
            let mut all_moved = true;
            for outcome in &mut outcomes {
                match move_to_output(&outcome.path, &self.output_dir).await {
                    Some(path) => outcome.path = path,
                    None => all_moved = false,
                }
            }
            for path in &state_files {
                remove_state(path).await;
            }
            if all_moved && work_dir != self.output_dir {
                remove_work_dir(&work_dir).await;
            }
        }

        let mut summary = ArchiveSummary {
            name,
            audio: None,
            video: None,
            stopped,
        };
        for outcome in outcomes {
            let slot = match outcome.track {
                TrackKind::Audio => &mut summary.audio,
                TrackKind::Video => &mut summary.video,
            };
            *slot = Some(outcome.into());
        }
        Ok(summary)
    }

    /// Directory holding outputs and staged fragments while the capture runs.
    /// A resumed capture continues where its records point; otherwise
    /// `<id>__work` inside the output directory.
    async fn working_dir(&self, state_id: &str, plans: &[TrackPlan]) -> PathBuf {
        for record in plans.iter().filter_map(|plan| plan.resume.as_ref()) {
            if record.temp_dir.as_os_str().is_empty() {
                continue;
            }
            if tokio::fs::metadata(&record.temp_dir).await.is_ok_and(|m| m.is_dir()) {
                debug!(dir = %record.temp_dir.display(), "Continuing in previous working directory");
                return record.temp_dir.clone();
            }
        }

        let dir = work_dir_path(&self.output_dir, state_id);
        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => dir,
            Err(e) => {
                warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Error creating working directory, writing to the output directory instead"
                );
                self.output_dir.clone()
            }
        }
    }

    fn build_state(&self, formats: &SelectedFormats, name: &str, work_dir: &Path, live: bool) -> Arc<StreamState> {
        let handle = |kind: TrackKind| {
            formats.get(kind).map(|format| {
                TrackHandle::new(
                    kind,
                    format.itag,
                    format.url.clone(),
                    track_base_path(work_dir, name, format.itag),
                )
            })
        };
        StreamState::new(handle(TrackKind::Audio), handle(TrackKind::Video), live)
    }
}

fn work_dir_path(output_dir: &Path, state_id: &str) -> PathBuf {
    output_dir.join(format!("{state_id}__work"))
}

/// Seed the shared state with what the startup provider calls returned.
fn apply_initial_status(state: &StreamState, status: &LiveStatus, last_sq: Option<u64>) {
    if let Some(duration) = status.target_duration {
        state.set_target_duration(duration);
    }
    if let Some(last_sq) = last_sq {
        state.observe_last_sq(last_sq);
    }
    // the provider was just consulted, revalidation starts counting now
    state.mark_updated();
}

async fn load_resume(path: &Path) -> Option<DownloadState> {
    match load_state(path).await {
        Ok(state) => state,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
            None
        }
    }
}

/// Forget an earlier capture of the same stream.
async fn discard_previous(output_dir: &Path, state_id: &str, plans: &[TrackPlan]) {
    for plan in plans {
        remove_state(&plan.state_file).await;
    }
    let dir = work_dir_path(output_dir, state_id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => info!(dir = %dir.display(), "Discarded previous partial capture"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove previous working directory"),
    }
}

/// Move a finished output into `output_dir`. `None` if it had to stay put.
async fn move_to_output(path: &Path, output_dir: &Path) -> Option<PathBuf> {
    let target = output_dir.join(path.file_name()?);
    if target == path {
        return Some(target);
    }
    match tokio::fs::rename(path, &target).await {
        Ok(()) => {
            debug!(from = %path.display(), to = %target.display(), "Moved output");
            Some(target)
        }
        Err(e) => {
            warn!(
                from = %path.display(),
                to = %target.display(),
                error = %e,
                "Could not move output out of the working directory"
            );
            None
        }
    }
}

async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove working directory"),
    }
}

/// Await a background helper. Returns false if it panicked.
async fn join_helper(name: &'static str, task: JoinHandle<()>) -> bool {
    match task.await {
        Err(e) if !e.is_cancelled() => {
            warn!(task = name, error = %e, "Background task failed");
            false
        }
        _ => true,
    }
}

/// Revalidate metadata of long captures until the capture stops.
async fn monitor(refresher: Arc<MetadataRefresher>, tick: Duration) {
    let state = Arc::clone(refresher.state());
    let tick = tick.max(Duration::from_secs(1));
    loop {
        if !state.sleep(tick).await {
            break;
        }
        if state.is_unavailable() {
            continue;
        }
        match refresher.revalidate_if_due().await {
            Ok(true) => debug!("Stream metadata revalidated"),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Revalidation failed"),
        }
    }
}
