use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{WaitConfig, WaitPolicy};
use crate::error::{ArchiveError, Result};
use crate::provider::{LiveStatus, MetadataProvider};

/// Holds a capture back until the broadcast has started.
pub struct LiveWaiter {
    provider: Arc<dyn MetadataProvider>,
    config: WaitConfig,
    token: CancellationToken,
}

impl LiveWaiter {
    pub fn new(provider: Arc<dyn MetadataProvider>, config: WaitConfig, token: CancellationToken) -> Self {
        Self {
            provider,
            config,
            token,
        }
    }

    /// Returns the first status that is live or already finished.
    ///
    /// Unavailable streams fail immediately. An upcoming stream fails with
    /// [`ArchiveError::NotStarted`] under [`WaitPolicy::NoWait`]; otherwise
    /// the status is checked again after the scheduled start or the poll
    /// interval.
    pub async fn wait(&self) -> Result<LiveStatus> {
        let mut announced = false;

        loop {
            if self.token.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let status = match self.provider.live_status().await {
                Ok(status) => status,
                Err(e) if matches!(self.config.policy, WaitPolicy::NoWait) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Error retrieving stream status, will try again");
                    self.sleep(self.config.poll_interval()).await?;
                    continue;
                }
            };

            if status.is_unavailable {
                return Err(ArchiveError::StreamUnavailable);
            }
            if !status.is_upcoming() {
                if announced {
                    info!("Stream is now live");
                }
                return Ok(status);
            }

            let delay = match self.config.policy {
                WaitPolicy::NoWait => {
                    return Err(ArchiveError::NotStarted {
                        scheduled_start: status.scheduled_start,
                    });
                }
                WaitPolicy::UntilScheduled => status
                    .scheduled_start
                    .and_then(|start| (start - Utc::now()).to_std().ok())
                    .filter(|until| !until.is_zero())
                    .unwrap_or_else(|| self.config.poll_interval()),
                WaitPolicy::Poll(interval) => interval,
            };

            if announced {
                debug!(retry_in = ?delay, "Stream still not live");
            } else {
                info!(scheduled_start = ?status.scheduled_start, retry_in = ?delay, "Waiting for stream to go live");
                announced = true;
            }
            self.sleep(delay).await?;
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(ArchiveError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::provider::DownloadUrls;
    use crate::track::{TrackKind, UrlTemplate};

    /// Plays back statuses in order, repeating the last one.
    struct Scripted {
        statuses: Mutex<VecDeque<Result<LiveStatus>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(statuses: Vec<Result<LiveStatus>>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MetadataProvider for Scripted {
        async fn download_urls(&self) -> Result<DownloadUrls> {
            Ok(DownloadUrls::default())
        }

        async fn live_status(&self) -> Result<LiveStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock();
            if statuses.len() > 1 {
                return statuses.pop_front().unwrap_or_else(|| Ok(LiveStatus::default()));
            }
            match statuses.front() {
                Some(Ok(status)) => Ok(status.clone()),
                _ => Err(ArchiveError::provider("no status")),
            }
        }

        async fn refresh_track_url(&self, _track: TrackKind, _itag: u32) -> Result<Option<UrlTemplate>> {
            Ok(None)
        }
    }

    fn upcoming() -> LiveStatus {
        LiveStatus {
            scheduled_start: Some(Utc::now() + chrono::Duration::minutes(10)),
            ..Default::default()
        }
    }

    fn live() -> LiveStatus {
        LiveStatus {
            is_live: true,
            ..Default::default()
        }
    }

    fn waiter(provider: Arc<Scripted>, policy: WaitPolicy) -> LiveWaiter {
        LiveWaiter::new(provider, WaitConfig { policy }, CancellationToken::new())
    }

    #[tokio::test]
    async fn live_stream_returns_immediately() {
        let provider = Scripted::new(vec![Ok(live())]);
        let status = waiter(provider.clone(), WaitPolicy::NoWait).wait().await.unwrap();
        assert!(status.is_live);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upcoming_without_wait_fails() {
        let provider = Scripted::new(vec![Ok(upcoming())]);
        let err = waiter(provider, WaitPolicy::NoWait).wait().await.unwrap_err();
        assert!(matches!(err, ArchiveError::NotStarted { scheduled_start: Some(_) }));
    }

    #[tokio::test]
    async fn unavailable_fails() {
        let provider = Scripted::new(vec![Ok(LiveStatus {
            is_unavailable: true,
            ..Default::default()
        })]);
        let err = waiter(provider, WaitPolicy::Poll(Duration::from_secs(15)))
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::StreamUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_live() {
        let provider = Scripted::new(vec![Ok(upcoming()), Ok(upcoming()), Ok(live())]);
        let status = waiter(provider.clone(), WaitPolicy::Poll(Duration::from_secs(30)))
            .wait()
            .await
            .unwrap();
        assert!(status.is_live);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_until_scheduled_start() {
        let provider = Scripted::new(vec![Ok(upcoming()), Ok(live())]);
        let started = tokio::time::Instant::now();
        waiter(provider, WaitPolicy::UntilScheduled).wait().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(9 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_errors_are_retried_while_waiting() {
        let provider = Scripted::new(vec![Err(ArchiveError::provider("flaky")), Ok(live())]);
        assert!(
            waiter(provider.clone(), WaitPolicy::Poll(Duration::from_secs(15)))
                .wait()
                .await
                .is_ok()
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let provider = Scripted::new(vec![Err(ArchiveError::provider("flaky")), Ok(live())]);
        assert!(waiter(provider, WaitPolicy::NoWait).wait().await.is_err());
    }

    #[tokio::test]
    async fn stop_interrupts_wait() {
        let provider = Scripted::new(vec![Ok(upcoming())]);
        let token = CancellationToken::new();
        let waiter = LiveWaiter::new(
            provider,
            WaitConfig {
                policy: WaitPolicy::UntilScheduled,
            },
            token.clone(),
        );
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
    }
}
