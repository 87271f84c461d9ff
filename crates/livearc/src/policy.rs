//! Continuation policy for a single fragment attempt.
//!
//! Pure state machine; the worker owns the side effects (sleeping, asking
//! for a fresh URL, consulting live status, marking the track finished).

use tracing::{debug, warn};

use crate::config::FetcherConfig;
use crate::fragment::WorkItem;

/// Why a fetch attempt did not produce a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The server answered with a status >= 400.
    Status(u16),
    /// Connection, timeout or body read failure.
    Network(String),
    /// The server answered 2xx/3xx without a body.
    EmptyBody,
    /// The fragment could not be staged on disk.
    Staging(String),
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Status(code) => write!(f, "HTTP {code}"),
            FetchFailure::Network(reason) => write!(f, "network error: {reason}"),
            FetchFailure::EmptyBody => f.write_str("empty response body"),
            FetchFailure::Staging(reason) => write!(f, "staging failed: {reason}"),
        }
    }
}

/// What the worker should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Sleep one target duration and try the same sequence number again.
    Retry,
    /// The try budget ran out; refresh live status and call
    /// [`AttemptState::on_tries_exhausted`].
    TriesExhausted,
    /// The fragment will never exist. Mark the track finished.
    FinishTrack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureAction {
    /// Ask for a fresh signed URL before retrying.
    pub refresh_url: bool,
    pub verdict: Verdict,
}

/// Outcome of the live status check after the try budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    Abandon,
}

/// Live status as seen when a decision is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveView {
    pub live: bool,
    pub unavailable: bool,
}

/// Retry bookkeeping for one fragment.
#[derive(Debug, Clone)]
pub struct AttemptState {
    pub seq: u64,
    pub max_seq: Option<u64>,
    pub tries: u32,
    pub full_retries: u32,
    pub saw_forbidden: bool,
    max_tries: u32,
}

impl AttemptState {
    pub fn new(item: WorkItem, config: &FetcherConfig) -> Self {
        Self {
            seq: item.seq,
            max_seq: item.max_seq,
            tries: 0,
            full_retries: config.full_retries,
            saw_forbidden: false,
            max_tries: config.frag_max_tries,
        }
    }

    /// Within two sequence numbers of the known end.
    fn near_end(&self) -> bool {
        self.max_seq.is_some_and(|max| self.seq + 2 > max)
    }

    /// At most two sequence numbers below the known end, or past it.
    fn at_end(&self) -> bool {
        self.max_seq.is_some_and(|max| self.seq + 2 >= max)
    }

    /// More than two sequence numbers below the known end.
    fn well_behind_end(&self) -> bool {
        self.max_seq.is_some_and(|max| self.seq + 2 < max)
    }

    pub fn on_failure(&mut self, failure: &FetchFailure, live: bool) -> FailureAction {
        let mut refresh_url = false;

        match failure {
            FetchFailure::Status(403) => {
                self.saw_forbidden = true;
                refresh_url = true;
            }
            FetchFailure::Status(404) if !live && self.near_end() => {
                debug!(
                    seq = self.seq,
                    max_seq = ?self.max_seq,
                    "Stream ended and fragment near the end was never created"
                );
                return FailureAction {
                    refresh_url: false,
                    verdict: Verdict::FinishTrack,
                };
            }
            FetchFailure::Network(reason) if !live && self.at_end() => {
                debug!(
                    seq = self.seq,
                    max_seq = ?self.max_seq,
                    error = %reason,
                    "Stream ended and fragment at the end is unreachable"
                );
                return FailureAction {
                    refresh_url: false,
                    verdict: Verdict::FinishTrack,
                };
            }
            _ => {}
        }

        if self.max_tries == 0 {
            // Unlimited budget: the counter is informational only.
            self.tries = 0;
            return FailureAction {
                refresh_url,
                verdict: Verdict::Retry,
            };
        }

        self.tries += 1;
        let verdict = if self.tries >= self.max_tries {
            Verdict::TriesExhausted
        } else {
            Verdict::Retry
        };
        FailureAction {
            refresh_url,
            verdict,
        }
    }

    pub fn on_tries_exhausted(&mut self, view: LiveView) -> Continuation {
        debug!(
            seq = self.seq,
            tries = self.tries,
            max_tries = self.max_tries,
            "Fragment retry budget exhausted"
        );

        if view.live && !view.unavailable {
            debug!(seq = self.seq, "Stream still live, continuing download attempt");
            self.tries = 0;
            return Continuation::Continue;
        }

        if self.saw_forbidden {
            if view.unavailable {
                warn!(
                    seq = self.seq,
                    "Download link expired and the stream is private or members only"
                );
            } else {
                warn!(
                    seq = self.seq,
                    "Download link expired and the stream has finished"
                );
            }
            return Continuation::Abandon;
        }

        if self.well_behind_end() && self.full_retries > 0 {
            self.full_retries -= 1;
            self.tries = 0;
            debug!(
                seq = self.seq,
                remaining = self.full_retries,
                "Fragment well behind the known end, granting another round"
            );
            return Continuation::Continue;
        }

        Continuation::Abandon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(seq: u64, max_seq: Option<u64>, max_tries: u32) -> AttemptState {
        let config = FetcherConfig {
            frag_max_tries: max_tries,
            full_retries: 3,
            ..Default::default()
        };
        AttemptState::new(WorkItem { seq, max_seq }, &config)
    }

    const ENDED: LiveView = LiveView {
        live: false,
        unavailable: false,
    };

    #[test]
    fn not_found_next_to_end_finishes_track() {
        let mut a = attempt(99, Some(100), 10);
        let action = a.on_failure(&FetchFailure::Status(404), false);
        assert_eq!(action.verdict, Verdict::FinishTrack);
        assert_eq!(a.tries, 0);
    }

    #[test]
    fn not_found_far_from_end_keeps_retrying() {
        let mut a = attempt(90, Some(100), 10);
        let action = a.on_failure(&FetchFailure::Status(404), false);
        assert_eq!(action.verdict, Verdict::Retry);
        assert_eq!(a.tries, 1);

        // while live a 404 near the edge just means "not yet"
        let mut a = attempt(101, Some(100), 10);
        assert_eq!(
            a.on_failure(&FetchFailure::Status(404), true).verdict,
            Verdict::Retry
        );
    }

    #[test]
    fn network_error_at_end_of_ended_stream_finishes_track() {
        let network = FetchFailure::Network("connection reset".into());

        // two below the end still counts
        let mut a = attempt(98, Some(100), 10);
        assert_eq!(a.on_failure(&network, false).verdict, Verdict::FinishTrack);
        assert_eq!(a.tries, 0);

        let mut a = attempt(97, Some(100), 10);
        assert_eq!(a.on_failure(&network, false).verdict, Verdict::Retry);

        // live or unknown end: keep trying
        let mut a = attempt(99, Some(100), 10);
        assert_eq!(a.on_failure(&network, true).verdict, Verdict::Retry);
        let mut a = attempt(99, None, 10);
        assert_eq!(a.on_failure(&network, false).verdict, Verdict::Retry);
    }

    #[test]
    fn forbidden_requests_refresh() {
        let mut a = attempt(5, None, 10);
        let action = a.on_failure(&FetchFailure::Status(403), true);
        assert!(action.refresh_url);
        assert!(a.saw_forbidden);

        let action = a.on_failure(&FetchFailure::Status(500), true);
        assert!(!action.refresh_url);
    }

    #[test]
    fn repeated_forbidden_on_ended_stream_abandons() {
        let mut a = attempt(7, Some(20), 3);
        let mut verdicts = Vec::new();
        for _ in 0..3 {
            verdicts.push(a.on_failure(&FetchFailure::Status(403), false).verdict);
        }
        assert_eq!(
            verdicts,
            vec![Verdict::Retry, Verdict::Retry, Verdict::TriesExhausted]
        );
        assert_eq!(a.on_tries_exhausted(ENDED), Continuation::Abandon);
    }

    #[test]
    fn live_stream_resets_budget() {
        let mut a = attempt(7, Some(20), 2);
        a.on_failure(&FetchFailure::EmptyBody, true);
        assert_eq!(
            a.on_failure(&FetchFailure::EmptyBody, true).verdict,
            Verdict::TriesExhausted
        );
        let view = LiveView {
            live: true,
            unavailable: false,
        };
        assert_eq!(a.on_tries_exhausted(view), Continuation::Continue);
        assert_eq!(a.tries, 0);
    }

    #[test]
    fn full_retries_are_bounded() {
        let mut a = attempt(10, Some(100), 1);
        let mut rounds = 0;
        loop {
            let action = a.on_failure(&FetchFailure::Network("reset".into()), false);
            assert_eq!(action.verdict, Verdict::TriesExhausted);
            match a.on_tries_exhausted(ENDED) {
                Continuation::Continue => rounds += 1,
                Continuation::Abandon => break,
            }
        }
        assert_eq!(rounds, 3);
        assert_eq!(a.full_retries, 0);
    }

    #[test]
    fn near_end_without_forbidden_abandons() {
        let mut a = attempt(99, Some(100), 1);
        a.on_failure(&FetchFailure::Status(500), false);
        assert_eq!(a.on_tries_exhausted(ENDED), Continuation::Abandon);

        let mut unknown_end = attempt(3, None, 1);
        unknown_end.on_failure(&FetchFailure::EmptyBody, false);
        assert_eq!(unknown_end.on_tries_exhausted(ENDED), Continuation::Abandon);
    }

    #[test]
    fn unlimited_budget_never_exhausts() {
        let mut a = attempt(1, None, 0);
        for _ in 0..100 {
            assert_eq!(
                a.on_failure(&FetchFailure::EmptyBody, false).verdict,
                Verdict::Retry
            );
        }
    }
}
