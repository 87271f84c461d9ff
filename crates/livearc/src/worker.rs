//! Fragment workers: pull sequence numbers from the shared queue, retry each
//! one per the continuation policy and report the outcome to the sequencer.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, trace};

use crate::config::FetcherConfig;
use crate::fetcher::{FetchedBody, FragmentSource};
use crate::fragment::{ContainerKind, Fragment, Payload, WorkItem, WorkerEvent};
use crate::policy::{AttemptState, Continuation, FetchFailure, LiveView, Verdict};
use crate::provider::MetadataRefresher;
use crate::slow::is_slow_fetch;
use crate::state::{StreamState, TrackHandle};

/// Everything a worker needs, shared by all workers of a track.
pub struct FragmentWorker {
    state: Arc<StreamState>,
    track: Arc<TrackHandle>,
    source: Arc<dyn FragmentSource>,
    refresher: Arc<MetadataRefresher>,
    config: FetcherConfig,
}

impl FragmentWorker {
    pub fn new(
        state: Arc<StreamState>,
        track: Arc<TrackHandle>,
        source: Arc<dyn FragmentSource>,
        refresher: Arc<MetadataRefresher>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            state,
            track,
            source,
            refresher,
            config,
        }
    }

    /// Spawn `config.jobs` workers sharing one work queue.
    pub fn spawn_pool(
        self: &Arc<Self>,
        work_rx: flume::Receiver<WorkItem>,
        events_tx: mpsc::Sender<WorkerEvent>,
    ) -> Vec<JoinHandle<()>> {
        (1..=self.config.jobs)
            .map(|n| {
                let worker = Arc::clone(self);
                let work_rx = work_rx.clone();
                let events_tx = events_tx.clone();
                let span = info_span!("worker", name = %format!("{}{}", self.track.kind(), n));
                tokio::spawn(async move { worker.run(work_rx, events_tx).await }.instrument(span))
            })
            .collect()
    }

    async fn run(&self, work_rx: flume::Receiver<WorkItem>, events_tx: mpsc::Sender<WorkerEvent>) {
        while let Ok(item) = work_rx.recv_async().await {
            let event = {
                let _job = self.track.begin_job();
                self.download(item).await
            };
            if events_tx.send(event).await.is_err() {
                break;
            }
        }
        debug!("Worker exiting");
    }

    /// Retry one fragment until it is fetched or the policy gives up on it.
    pub async fn download(&self, item: WorkItem) -> WorkerEvent {
        let track = &self.track;
        let mut attempt = AttemptState::new(item, &self.config);

        loop {
            if self.state.is_stopping() || track.is_finished() {
                return WorkerEvent::Abandoned { seq: item.seq };
            }

            let url = track.url();
            let host = track.host();
            let started = Instant::now();
            let result = self.source.fetch(&url.instantiate(item.seq), host.as_deref()).await;
            let elapsed = started.elapsed();

            let failure = match result {
                Ok(fetched) => match self.finish(item.seq, fetched, elapsed).await {
                    Ok(fragment) => return WorkerEvent::Completed(fragment),
                    Err(failure) => failure,
                },
                Err(failure) => failure,
            };

            debug!(seq = item.seq, tries = attempt.tries + 1, error = %failure, "Fragment attempt failed");

            let action = attempt.on_failure(&failure, self.state.is_live());
            if action.refresh_url
                && let Err(e) = self.refresher.refresh_if_current(track.kind(), &url).await
            {
                debug!(seq = item.seq, error = %e, "URL refresh failed");
            }

            match action.verdict {
                Verdict::Retry => {}
                Verdict::FinishTrack => {
                    track.mark_finished();
                    return WorkerEvent::Abandoned { seq: item.seq };
                }
                Verdict::TriesExhausted => {
                    if self.state.is_live()
                        && let Err(e) = self.refresher.refresh().await
                    {
                        debug!(error = %e, "Live status refresh failed");
                    }
                    let view = LiveView {
                        live: self.state.is_live(),
                        unavailable: self.state.is_unavailable(),
                    };
                    if attempt.on_tries_exhausted(view) == Continuation::Abandon {
                        track.mark_finished();
                        return WorkerEvent::Abandoned { seq: item.seq };
                    }
                }
            }

            if track.is_finished() {
                return WorkerEvent::Abandoned { seq: item.seq };
            }
            if !self.state.sleep(self.state.target_duration()).await {
                return WorkerEvent::Abandoned { seq: item.seq };
            }
        }
    }

    async fn finish(
        &self,
        seq: u64,
        fetched: FetchedBody,
        elapsed: std::time::Duration,
    ) -> Result<Fragment, FetchFailure> {
        let container = ContainerKind::from_content_type(fetched.content_type.as_deref());
        if container == ContainerKind::Unknown {
            trace!(seq, content_type = ?fetched.content_type, "Fragment has unknown MIME type");
        }

        let payload = if self.config.stage_to_files {
            let path = self.track.staged_fragment_path(seq);
            tokio::fs::write(&path, &fetched.body)
                .await
                .map_err(|e| FetchFailure::Staging(e.to_string()))?;
            Payload::File(path)
        } else {
            Payload::Memory(fetched.body)
        };

        let slow = is_slow_fetch(
            elapsed,
            self.state.target_duration(),
            self.config.slow_factor,
            seq,
            fetched.head_seqnum,
            self.config.slow_edge_margin,
        );

        Ok(Fragment {
            seq,
            payload,
            container,
            head_seqnum: fetched.head_seqnum,
            slow,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::RefreshConfig;
    use crate::provider::LiveStatus;
    use crate::provider::refresher::tests::MockProvider;
    use crate::state::tests::test_state;
    use crate::track::TrackKind;

    /// Serves canned responses keyed by sequence number.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        pub responses: Mutex<HashMap<u64, Vec<Result<FetchedBody, FetchFailure>>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn push(&self, seq: u64, response: Result<FetchedBody, FetchFailure>) {
            self.responses.lock().entry(seq).or_default().push(response);
        }
    }

    pub(crate) fn body(data: &'static [u8], head: Option<u64>) -> FetchedBody {
        FetchedBody {
            body: Bytes::from_static(data),
            head_seqnum: head,
            content_type: Some("video/mp4".into()),
        }
    }

    #[async_trait]
    impl FragmentSource for ScriptedSource {
        async fn fetch(&self, url: &str, _host: Option<&str>) -> Result<FetchedBody, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seq: u64 = url
                .rsplit("sq=")
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(u64::MAX);
            let mut responses = self.responses.lock();
            match responses.get_mut(&seq) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) if queue.len() == 1 => queue[0].clone(),
                _ => Err(FetchFailure::Status(404)),
            }
        }
    }

    fn worker(
        live: bool,
        source: Arc<ScriptedSource>,
        max_tries: u32,
    ) -> (FragmentWorker, Arc<StreamState>, Arc<MockProvider>) {
        let state = test_state(live);
        state.set_target_duration(Duration::from_millis(1));
        let provider = Arc::new(MockProvider::default());
        *provider.status.lock() = LiveStatus {
            is_live: live,
            ..Default::default()
        };
        let refresher = Arc::new(MetadataRefresher::new(
            provider.clone(),
            state.clone(),
            RefreshConfig {
                min_interval: Duration::ZERO,
                ..Default::default()
            },
        ));
        let config = FetcherConfig {
            frag_max_tries: max_tries,
            stage_to_files: false,
            ..Default::default()
        };
        let track = Arc::clone(state.track(TrackKind::Audio).unwrap());
        (
            FragmentWorker::new(state.clone(), track, source, refresher, config),
            state,
            provider,
        )
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let source = Arc::new(ScriptedSource::default());
        source.push(3, Err(FetchFailure::EmptyBody));
        source.push(3, Err(FetchFailure::Status(503)));
        source.push(3, Ok(body(b"frag3", Some(9))));
        let (worker, _state, _) = worker(false, source.clone(), 10);

        let event = worker.download(WorkItem { seq: 3, max_seq: Some(9) }).await;
        let WorkerEvent::Completed(fragment) = event else {
            panic!("expected a fragment");
        };
        assert_eq!(fragment.payload, Payload::Memory(Bytes::from_static(b"frag3")));
        assert_eq!(fragment.head_seqnum, Some(9));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn forbidden_until_exhausted_finishes_track() {
        let source = Arc::new(ScriptedSource::default());
        source.push(7, Err(FetchFailure::Status(403)));
        let (worker, state, provider) = worker(false, source.clone(), 3);

        let event = worker.download(WorkItem { seq: 7, max_seq: Some(20) }).await;
        assert!(matches!(event, WorkerEvent::Abandoned { seq: 7 }));
        assert!(state.track(TrackKind::Audio).unwrap().is_finished());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        // each 403 asked for a fresh URL
        assert_eq!(provider.track_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_at_end_finishes_without_retry() {
        let source = Arc::new(ScriptedSource::default());
        let (worker, state, _) = worker(false, source.clone(), 10);

        let event = worker.download(WorkItem { seq: 10, max_seq: Some(10) }).await;
        assert!(matches!(event, WorkerEvent::Abandoned { seq: 10 }));
        assert!(state.track(TrackKind::Audio).unwrap().is_finished());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_error_at_end_of_ended_stream_finishes_track() {
        let source = Arc::new(ScriptedSource::default());
        source.push(9, Err(FetchFailure::Network("connection reset".into())));
        let (worker, state, provider) = worker(false, source.clone(), 10);

        let event = worker.download(WorkItem { seq: 9, max_seq: Some(11) }).await;
        assert!(matches!(event, WorkerEvent::Abandoned { seq: 9 }));
        assert!(state.track(TrackKind::Audio).unwrap().is_finished());
        assert!(!state.track(TrackKind::Video).unwrap().is_finished());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_abandons_promptly() {
        let source = Arc::new(ScriptedSource::default());
        source.push(1, Err(FetchFailure::Network("reset".into())));
        let (worker, state, _) = worker(true, source, 0);
        state.set_target_duration(Duration::from_secs(3600));

        let stopper = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });
        let event = tokio::time::timeout(
            Duration::from_secs(5),
            worker.download(WorkItem { seq: 1, max_seq: None }),
        )
        .await
        .unwrap();
        assert!(matches!(event, WorkerEvent::Abandoned { seq: 1 }));
    }

    #[tokio::test]
    async fn stages_fragment_to_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = crate::track::UrlTemplate::parse("https://h.example/vp?sq=%d").unwrap();
        let audio = TrackHandle::new(TrackKind::Audio, 140, url, dir.path().join("cap.f140"));
        let state = StreamState::new(Some(audio), None, false);
        let track = Arc::clone(state.track(TrackKind::Audio).unwrap());
        let source = Arc::new(ScriptedSource::default());
        source.push(0, Ok(body(b"payload", None)));
        let refresher = Arc::new(MetadataRefresher::new(
            Arc::new(MockProvider::default()),
            state.clone(),
            RefreshConfig::default(),
        ));
        let worker = FragmentWorker::new(
            state,
            track,
            source,
            refresher,
            FetcherConfig::default(),
        );

        let WorkerEvent::Completed(fragment) = worker.download(WorkItem { seq: 0, max_seq: None }).await else {
            panic!("expected a fragment");
        };
        let path = dir.path().join("cap.f140.frag0.ts");
        assert_eq!(fragment.payload, Payload::File(path.clone()));
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }
}
