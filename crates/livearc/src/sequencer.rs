//! Track Sequencer: issues sequence numbers to the worker pool, collects
//! completions in any order and appends them to the output strictly in order.
//! It is the only owner of the output file and of the resume record.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncSeek, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::{RefreshConfig, SequencerConfig};
use crate::error::{ArchiveError, Result};
use crate::events::ArchiveEvent;
use crate::fragment::{Fragment, Payload, WorkItem, WorkerEvent};
use crate::persistence::{DownloadState, save_state};
use crate::provider::MetadataRefresher;
use crate::reorder::{Admission, LiveEdge, ReorderBuffer};
use crate::slow::SlowFragmentTracker;
use crate::state::{StreamState, TrackHandle};
use crate::track::TrackKind;
use crate::writer::{FragmentWriter, OpenMode, open_output};

/// Idle ticks with work outstanding but no busy worker before work is reissued.
const STALL_TICKS: u32 = 10;

/// Where a track ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackOutcome {
    pub track: TrackKind,
    pub itag: u32,
    pub path: PathBuf,
    /// Next sequence number that would have been committed.
    pub fragments: u64,
    pub bytes: u64,
    pub start_frag: u64,
}

/// First sequence number to request and first one written to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPoint {
    pub cur_frag: u64,
    pub start_frag: u64,
}

/// Pick where a track starts.
///
/// Origins only keep a bounded window of a running broadcast, so when the
/// last sequence number is known the capture starts no earlier than
/// `last_sq - window / target_duration`. A resumed track continues from its
/// record unless that lies before the window.
pub fn plan_start(
    last_sq: Option<u64>,
    window: std::time::Duration,
    target_duration: std::time::Duration,
    resumed: Option<&DownloadState>,
) -> StartPoint {
    let floor = match last_sq {
        Some(last) if !target_duration.is_zero() => {
            let retained = (window.as_secs_f64() / target_duration.as_secs_f64()).floor() as u64;
            last.saturating_sub(retained)
        }
        _ => 0,
    };

    match resumed {
        Some(state) if state.fragments >= floor => StartPoint {
            cur_frag: state.fragments,
            start_frag: state.start_frag,
        },
        _ => StartPoint {
            cur_frag: floor,
            start_frag: floor,
        },
    }
}

/// Whether the next sequence number may be handed out.
///
/// With a known edge, work is kept within one past it; otherwise the pool is
/// kept saturated. At least one item is always outstanding.
pub fn may_issue(cur_seq: u64, max_seq: Option<u64>, in_flight: usize, jobs: usize) -> bool {
    match max_seq {
        Some(max) => (cur_seq <= max + 1 && in_flight < jobs) || in_flight == 0,
        None => in_flight < jobs,
    }
}

pub struct TrackSequencer {
    state: Arc<StreamState>,
    track: Arc<TrackHandle>,
    kind: TrackKind,
    refresher: Arc<MetadataRefresher>,
    config: SequencerConfig,
    jobs: usize,
    slow: SlowFragmentTracker,
    state_file: Option<PathBuf>,
    resume: Option<DownloadState>,
    temp_dir: PathBuf,
    events: Option<mpsc::Sender<ArchiveEvent>>,
}

/// Mutable loop state, separated from configuration for borrowing.
struct Cursor {
    cur_seq: u64,
    start_frag: u64,
    edge: LiveEdge,
    in_flight: BTreeSet<u64>,
    buffer: ReorderBuffer<Fragment>,
    failed_deletes: Vec<PathBuf>,
    stall_ticks: u32,
}

impl TrackSequencer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StreamState>,
        track: Arc<TrackHandle>,
        refresher: Arc<MetadataRefresher>,
        config: SequencerConfig,
        refresh_config: &RefreshConfig,
        jobs: usize,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            kind: track.kind(),
            track,
            refresher,
            config,
            jobs: jobs.max(1),
            slow: SlowFragmentTracker::new(refresh_config.slow_threshold, refresh_config.slow_window),
            state_file: None,
            resume: None,
            temp_dir,
            events: None,
        }
    }

    /// Persist progress to `path` after every commit, continuing from `resume`.
    pub fn with_state_file(mut self, path: PathBuf, resume: Option<DownloadState>) -> Self {
        self.state_file = Some(path);
        self.resume = resume;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<ArchiveEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run(
        self,
        work_tx: flume::Sender<WorkItem>,
        events_rx: mpsc::Receiver<WorkerEvent>,
    ) -> Result<TrackOutcome> {
        let span = info_span!("sequencer", track = %self.kind);
        self.run_inner(work_tx, events_rx).instrument(span).await
    }

    async fn run_inner(
        mut self,
        work_tx: flume::Sender<WorkItem>,
        mut events_rx: mpsc::Receiver<WorkerEvent>,
    ) -> Result<TrackOutcome> {
        let state = Arc::clone(&self.state);
        let track = Arc::clone(&self.track);
        let path = track.output_path();

        let window = self.config.live_seekable_window;
        let target = state.target_duration();
        let resume = self.resume.as_ref().filter(|r| r.fragments > 0);
        let mut start = plan_start(state.last_sq(), window, target, resume);
        let resume_offset = resume
            .filter(|r| r.fragments == start.cur_frag)
            .map(|r| r.size);

        let (file, mode) = match open_output(&path, resume_offset).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Error opening output for writing");
                state.stop();
                return Err(e.into());
            }
        };

        let committed = match mode {
            OpenMode::Resumed { offset } => {
                info!(fragments = start.cur_frag, bytes = offset, "Resuming track");
                offset
            }
            OpenMode::Fresh => {
                if resume_offset.is_some() {
                    start = plan_start(state.last_sq(), window, target, None);
                }
                if start.cur_frag > 0 {
                    warn!(
                        start = start.cur_frag,
                        latest = ?state.last_sq(),
                        "Origin only retains the last days of a broadcast, starting from a later fragment"
                    );
                }
                0
            }
        };

        let mut writer = FragmentWriter::new(file, self.config.write_chunk_size, committed);
        let mut cursor = Cursor {
            cur_seq: start.cur_frag,
            start_frag: start.start_frag,
            edge: LiveEdge::new(state.last_sq()),
            in_flight: BTreeSet::new(),
            buffer: ReorderBuffer::new(start.cur_frag),
            failed_deletes: Vec::new(),
            stall_ticks: 0,
        };

        track.set_in_progress(true);
        let result = self
            .drive(&work_tx, &mut events_rx, &mut writer, &mut cursor)
            .await;
        track.set_in_progress(false);

        self.cleanup(&mut cursor).await;

        let outcome = TrackOutcome {
            track: self.kind,
            itag: track.itag(),
            path,
            fragments: cursor.buffer.next_expected(),
            bytes: writer.committed(),
            start_frag: cursor.start_frag,
        };

        match result {
            Ok(()) => {
                info!(
                    fragments = outcome.fragments,
                    bytes = outcome.bytes,
                    "Track finished"
                );
                self.emit(ArchiveEvent::TrackFinished {
                    track: self.kind,
                    fragments: outcome.fragments,
                    total_bytes: outcome.bytes,
                });
                Ok(outcome)
            }
            Err(e) => {
                self.emit(ArchiveEvent::TrackAborted {
                    track: self.kind,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn done_issuing(&self, cursor: &Cursor) -> bool {
        if self.state.is_stopping() || self.track.is_finished() {
            return true;
        }
        cursor
            .edge
            .get()
            .is_some_and(|max| !self.state.is_live() && cursor.cur_seq > max)
    }

    async fn drive<W: AsyncWrite + AsyncSeek + Unpin>(
        &mut self,
        work_tx: &flume::Sender<WorkItem>,
        events_rx: &mut mpsc::Receiver<WorkerEvent>,
        writer: &mut FragmentWriter<W>,
        cursor: &mut Cursor,
    ) -> Result<()> {
        loop {
            cursor.edge.observe(self.state.last_sq());

            if self.done_issuing(cursor) {
                if cursor.in_flight.is_empty() {
                    if !self.track.is_finished() {
                        debug!(cur_seq = cursor.cur_seq, max_seq = ?cursor.edge.get(), "Stream finished and highest sequence reached");
                        self.track.mark_finished();
                    }
                    return Ok(());
                }
            } else {
                self.issue(work_tx, cursor)?;
            }

            tokio::select! {
                biased;

                event = events_rx.recv() => {
                    let Some(event) = event else {
                        return Err(ArchiveError::internal("all fragment workers exited"));
                    };
                    cursor.stall_ticks = 0;
                    self.on_worker_event(event, cursor).await;
                    while let Ok(event) = events_rx.try_recv() {
                        self.on_worker_event(event, cursor).await;
                    }
                }

                _ = tokio::time::sleep(self.config.idle_poll_interval) => {
                    self.check_stall(work_tx, cursor);
                }
            }

            self.commit_ready(writer, cursor).await?;
        }
    }

    fn issue(&self, work_tx: &flume::Sender<WorkItem>, cursor: &mut Cursor) -> Result<()> {
        loop {
            let max_seq = cursor.edge.get();
            if max_seq.is_some_and(|max| !self.state.is_live() && cursor.cur_seq > max) {
                return Ok(());
            }
            if !may_issue(cursor.cur_seq, max_seq, cursor.in_flight.len(), self.jobs) {
                return Ok(());
            }
            let item = WorkItem {
                seq: cursor.cur_seq,
                max_seq,
            };
            match work_tx.try_send(item) {
                Ok(()) => {
                    trace!(seq = item.seq, max_seq = ?max_seq, "Issued fragment");
                    cursor.in_flight.insert(item.seq);
                    cursor.cur_seq += 1;
                }
                Err(flume::TrySendError::Full(_)) => return Ok(()),
                Err(flume::TrySendError::Disconnected(_)) => {
                    return Err(ArchiveError::internal("fragment work queue closed"));
                }
            }
        }
    }

    /// Work is outstanding, nothing is queued and no worker holds anything:
    /// the items were lost. Hand them out again.
    fn check_stall(&self, work_tx: &flume::Sender<WorkItem>, cursor: &mut Cursor) {
        let stalled = !cursor.in_flight.is_empty()
            && self.track.active_jobs() == 0
            && work_tx.is_empty()
            && !self.state.is_stopping();
        if !stalled {
            cursor.stall_ticks = 0;
            return;
        }

        cursor.stall_ticks += 1;
        if cursor.stall_ticks < STALL_TICKS {
            return;
        }
        cursor.stall_ticks = 0;

        warn!(
            fragment = cursor.buffer.next_expected(),
            outstanding = cursor.in_flight.len(),
            "No active downloads and no data to write, reissuing outstanding fragments"
        );
        let max_seq = cursor.edge.get();
        for &seq in &cursor.in_flight {
            if work_tx.try_send(WorkItem { seq, max_seq }).is_err() {
                break;
            }
        }
    }

    async fn on_worker_event(&mut self, event: WorkerEvent, cursor: &mut Cursor) {
        cursor.in_flight.remove(&event.seq());

        let fragment = match event {
            WorkerEvent::Abandoned { seq } => {
                debug!(seq, "Fragment abandoned");
                return;
            }
            WorkerEvent::Completed(fragment) => fragment,
        };

        if cursor.edge.observe(fragment.head_seqnum) {
            trace!(max_seq = ?cursor.edge.get(), "Live edge advanced");
        }

        if fragment.slow && !self.state.is_stopping() && self.slow.record(fragment.seq) {
            debug!(seq = fragment.seq, "Too many slow fragments, refreshing download URL");
            let refresher = Arc::clone(&self.refresher);
            let kind = self.kind;
            let current = self.track.url();
            tokio::spawn(async move {
                if let Err(e) = refresher.refresh_if_current(kind, &current).await {
                    debug!(track = %kind, error = %e, "Slow fragment refresh failed");
                }
            });
        }

        let seq = fragment.seq;
        match cursor.buffer.insert(seq, fragment) {
            Admission::Accepted => {}
            Admission::Stale(fragment) => {
                debug!(seq, "Discarding fragment that was already written");
                self.discard(&fragment, cursor).await;
            }
            Admission::Duplicate(fragment) => {
                debug!(seq, "Discarding duplicate fragment");
                let shared_file = cursor
                    .buffer
                    .get(seq)
                    .is_some_and(|kept| kept.payload == fragment.payload);
                if !shared_file {
                    self.discard(&fragment, cursor).await;
                }
            }
        }
    }

    async fn discard(&self, fragment: &Fragment, cursor: &mut Cursor) {
        if let Some(path) = fragment.payload.staged_path() {
            remove_staged(path, &mut cursor.failed_deletes).await;
        }
    }

    async fn load_payload(fragment: &Fragment) -> std::io::Result<Bytes> {
        match &fragment.payload {
            Payload::Memory(bytes) => Ok(bytes.clone()),
            Payload::File(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }

    async fn commit_ready<W: AsyncWrite + AsyncSeek + Unpin>(
        &mut self,
        writer: &mut FragmentWriter<W>,
        cursor: &mut Cursor,
    ) -> Result<()> {
        while let Some(fragment) = cursor.buffer.peek_next() {
            let seq = fragment.seq;
            let bytes_written = self.commit_one(fragment, writer, cursor.start_frag).await?;

            let Some(fragment) = cursor.buffer.take_next() else {
                break;
            };
            if let Some(path) = fragment.payload.staged_path() {
                remove_staged(path, &mut cursor.failed_deletes).await;
            }

            self.persist(cursor, writer.committed()).await;
            self.emit(ArchiveEvent::Progress {
                track: self.kind,
                itag: self.track.itag(),
                bytes_written,
                fragments: cursor.buffer.next_expected(),
                total_bytes: writer.committed(),
                max_seq: cursor.edge.get(),
                start_frag: cursor.start_frag,
            });
            trace!(seq, bytes = bytes_written, "Fragment committed");
        }
        Ok(())
    }

    /// Read, strip and append one fragment, retrying within the write budget.
    async fn commit_one<W: AsyncWrite + AsyncSeek + Unpin>(
        &self,
        fragment: &Fragment,
        writer: &mut FragmentWriter<W>,
        start_frag: u64,
    ) -> Result<u64> {
        let max_tries = self.config.max_write_tries;
        let mut tries_left = max_tries;

        loop {
            let attempt = async {
                let data = Self::load_payload(fragment).await?;
                let data = if fragment.container.is_isobmff() {
                    mp4::strip_boxes(&data, mp4::boxes_to_strip(fragment.seq == start_frag))
                        .into_owned()
                        .into()
                } else {
                    data
                };
                writer.write_fragment(&data).await
            };

            match attempt.await {
                Ok(written) => return Ok(written),
                Err(e) => {
                    tries_left -= 1;
                    warn!(seq = fragment.seq, error = %e, tries_left, "Error writing fragment");
                    if tries_left == 0 {
                        warn!("Stopping download, something must be wrong");
                        self.state.stop();
                        return Err(ArchiveError::WriteExhausted {
                            track: self.kind,
                            path: self.track.output_path(),
                            attempts: max_tries,
                        });
                    }
                }
            }
        }
    }

    async fn persist(&self, cursor: &Cursor, size: u64) {
        let Some(path) = &self.state_file else {
            return;
        };
        let record = DownloadState {
            fragments: cursor.buffer.next_expected(),
            size,
            temp_dir: self.temp_dir.clone(),
            start_frag: cursor.start_frag,
        };
        if let Err(e) = save_state(path, &record).await {
            warn!(path = %path.display(), error = %e, "Failed to save download state");
        }
    }

    fn emit(&self, event: ArchiveEvent) {
        if let Some(tx) = &self.events
            && tx.try_send(event).is_err()
        {
            trace!("Progress event dropped");
        }
    }

    /// Remove staged files of fragments that were never written and retry
    /// deletions that failed earlier.
    async fn cleanup(&self, cursor: &mut Cursor) {
        let leftovers: Vec<Fragment> = cursor.buffer.drain().map(|(_, f)| f).collect();
        if !leftovers.is_empty() {
            debug!(count = leftovers.len(), "Discarding fragments past the last written one");
        }
        for fragment in leftovers {
            if let Some(path) = fragment.payload.staged_path() {
                remove_staged(path, &mut cursor.failed_deletes).await;
            }
        }

        let retry = std::mem::take(&mut cursor.failed_deletes);
        if !retry.is_empty() {
            info!(count = retry.len(), "Attempting to delete fragments that failed to be deleted before");
        }
        for path in retry {
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Could not delete staged fragment");
            }
        }
    }
}

async fn remove_staged(path: &std::path::Path, failed: &mut Vec<PathBuf>) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error deleting staged fragment, will retry at the end");
            failed.push(path.to_path_buf());
        }
    }
}
