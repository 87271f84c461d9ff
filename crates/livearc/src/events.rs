use crate::track::TrackKind;

/// Progress notifications sent from the sequencers to whoever runs the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    /// A fragment was committed to the output.
    Progress {
        track: TrackKind,
        itag: u32,
        /// Bytes written for this fragment.
        bytes_written: u64,
        /// Next sequence number to commit.
        fragments: u64,
        total_bytes: u64,
        max_seq: Option<u64>,
        start_frag: u64,
    },
    /// The track has nothing more to download.
    TrackFinished {
        track: TrackKind,
        fragments: u64,
        total_bytes: u64,
    },
    /// The track stopped because its output can no longer be trusted.
    TrackAborted { track: TrackKind, reason: String },
}

impl ArchiveEvent {
    pub fn track(&self) -> TrackKind {
        match self {
            ArchiveEvent::Progress { track, .. }
            | ArchiveEvent::TrackFinished { track, .. }
            | ArchiveEvent::TrackAborted { track, .. } => *track,
        }
    }
}
