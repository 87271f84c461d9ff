//! The single path by which a running capture talks to its metadata provider.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LiveStatus, MetadataProvider};
use crate::config::RefreshConfig;
use crate::error::Result;
use crate::state::StreamState;
use crate::track::{TrackKind, UrlTemplate};

/// Rate limited, single flight access to the provider.
///
/// Concurrent callers queue on the same gate; whoever comes second finds the
/// provider was just consulted and returns without a call.
pub struct MetadataRefresher {
    provider: Arc<dyn MetadataProvider>,
    state: Arc<StreamState>,
    config: RefreshConfig,
    gate: Mutex<Option<Instant>>,
}

impl MetadataRefresher {
    pub fn new(
        provider: Arc<dyn MetadataProvider>,
        state: Arc<StreamState>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            provider,
            state,
            config,
            gate: Mutex::new(None),
        }
    }

    fn refresh_allowed(&self) -> bool {
        self.provider.can_refresh() && !self.state.is_stopping() && !self.state.is_unavailable()
    }

    /// Take the gate if the minimum interval has passed since the last call.
    async fn acquire(&self) -> Option<tokio::sync::MutexGuard<'_, Option<Instant>>> {
        let mut last = self.gate.lock().await;
        if last.is_some_and(|at| at.elapsed() < self.config.min_interval) {
            return None;
        }
        *last = Some(Instant::now());
        self.state.mark_updated();
        Some(last)
    }

    fn apply_status(&self, status: &LiveStatus) {
        if status.is_unavailable {
            warn!("Stream became unavailable");
            self.state.mark_unavailable();
            return;
        }
        if self.state.is_live() && !status.is_live {
            info!("Stream is no longer live");
        }
        self.state.set_live(status.is_live);
        if let Some(duration) = status.target_duration {
            self.state.set_target_duration(duration);
        }
    }

    /// Re-read live status and URLs for every captured track. Returns `true` when the
    /// provider was actually consulted.
    pub async fn refresh(&self) -> Result<bool> {
        if !self.refresh_allowed() {
            return Ok(false);
        }
        let Some(_gate) = self.acquire().await else {
            return Ok(false);
        };

        debug!("Refreshing stream metadata");
        let status = self.provider.live_status().await.inspect_err(|e| {
            warn!(error = %e, "Failed to refresh live status");
        })?;
        self.apply_status(&status);
        if status.is_unavailable {
            return Ok(true);
        }

        let urls = self.provider.download_urls().await.inspect_err(|e| {
            warn!(error = %e, "Failed to refresh download URLs");
        })?;
        if let Some(last_sq) = urls.last_sq {
            self.state.observe_last_sq(last_sq);
        }
        for track in self.state.tracks() {
            if let Some(template) = urls.templates.get(&track.itag()) {
                track.set_url(template.clone());
            }
        }
        Ok(true)
    }

    /// Ask for a new URL for `kind`, but only if `stale` is still the URL in
    /// use. A worker that saw an old URL fail must not undo a newer swap.
    pub async fn refresh_if_current(&self, kind: TrackKind, stale: &UrlTemplate) -> Result<bool> {
        let Some(track) = self.state.track(kind) else {
            return Ok(false);
        };
        if track.url() != *stale || !self.refresh_allowed() {
            return Ok(false);
        }
        let Some(_gate) = self.acquire().await else {
            return Ok(false);
        };
        // Another refresh may have swapped it while we waited for the gate.
        if track.url() != *stale {
            return Ok(false);
        }

        debug!(track = %kind, "Attempting to retrieve a new download URL");
        let status = self.provider.live_status().await.inspect_err(|e| {
            warn!(track = %kind, error = %e, "Failed to refresh live status");
        })?;
        self.apply_status(&status);
        if status.is_unavailable {
            return Ok(true);
        }

        match self.provider.refresh_track_url(kind, track.itag()).await {
            Ok(Some(fresh)) => {
                if track.set_url(fresh) {
                    info!(track = %kind, "Download URL refreshed");
                }
            }
            Ok(None) => debug!(track = %kind, "Provider had no fresher URL"),
            Err(e) => {
                warn!(track = %kind, error = %e, "Failed to refresh download URL");
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Periodic revalidation of a long running capture.
    pub async fn revalidate_if_due(&self) -> Result<bool> {
        let due = self
            .state
            .since_updated()
            .is_none_or(|elapsed| elapsed >= self.config.revalidate_interval);
        if !due {
            return Ok(false);
        }
        self.refresh().await
    }

    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }
}

impl std::fmt::Debug for MetadataRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRefresher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
