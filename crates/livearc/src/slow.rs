use std::time::Duration;

/// Decides whether a finished fetch counts as slow.
pub fn is_slow_fetch(
    elapsed: Duration,
    target_duration: Duration,
    slow_factor: f64,
    seq: u64,
    head_seqnum: Option<u64>,
    edge_margin: u64,
) -> bool {
    // Fragments close to the live edge are served as they are produced.
    let near_edge = head_seqnum.is_some_and(|head| seq + edge_margin >= head);
    if near_edge {
        return false;
    }
    elapsed > target_duration.mul_f64(slow_factor)
}

/// Counts slow fragments that arrive close together.
///
/// A slow fragment within `window` sequence numbers of the previous one adds
/// to the count, otherwise the count restarts at one. Reaching `threshold`
/// asks for a URL refresh and resets the count.
#[derive(Debug, Clone)]
pub struct SlowFragmentTracker {
    threshold: u32,
    window: u64,
    count: u32,
    last_slow_seq: u64,
}

impl SlowFragmentTracker {
    pub fn new(threshold: u32, window: u64) -> Self {
        Self {
            threshold,
            window,
            count: 0,
            last_slow_seq: 0,
        }
    }

    /// Record a slow fragment. Returns `true` when a refresh is due.
    pub fn record(&mut self, seq: u64) -> bool {
        if seq.saturating_sub(self.last_slow_seq) < self.window {
            self.count += 1;
        } else {
            self.count = 1;
        }
        self.last_slow_seq = seq;

        if self.count >= self.threshold {
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
