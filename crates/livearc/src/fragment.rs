use std::path::PathBuf;

use bytes::Bytes;

/// Container reported by the fragment server's `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Mp4,
    WebM,
    Unknown,
}

impl ContainerKind {
    /// A missing or empty type is assumed to be MP4.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let mime = content_type
            .and_then(|value| value.split(';').next())
            .unwrap_or_default()
            .trim();
        if mime.is_empty() || mime.ends_with("/mp4") {
            ContainerKind::Mp4
        } else if mime.ends_with("/webm") {
            ContainerKind::WebM
        } else {
            ContainerKind::Unknown
        }
    }

    pub fn is_isobmff(self) -> bool {
        self == ContainerKind::Mp4
    }
}

/// Where a downloaded fragment's bytes live until commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Memory(Bytes),
    File(PathBuf),
}

impl Payload {
    pub fn staged_path(&self) -> Option<&PathBuf> {
        match self {
            Payload::File(path) => Some(path),
            Payload::Memory(_) => None,
        }
    }
}

/// A successfully fetched fragment.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub seq: u64,
    pub payload: Payload,
    pub container: ContainerKind,
    /// Live edge advertised by the server when this fragment was served.
    pub head_seqnum: Option<u64>,
    /// Fetch took longer than the slowness threshold.
    pub slow: bool,
}

/// A sequence number handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub seq: u64,
    /// Known upper bound when the item was issued.
    pub max_seq: Option<u64>,
}

/// What a worker reports back for one work item.
#[derive(Debug)]
pub enum WorkerEvent {
    Completed(Fragment),
    /// The fragment will never be delivered; the retry policy gave up on it.
    Abandoned { seq: u64 },
}

impl WorkerEvent {
    pub fn seq(&self) -> u64 {
        match self {
            WorkerEvent::Completed(fragment) => fragment.seq,
            WorkerEvent::Abandoned { seq } => *seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_container_from_content_type() {
        assert_eq!(
            ContainerKind::from_content_type(Some("video/mp4")),
            ContainerKind::Mp4
        );
        assert_eq!(
            ContainerKind::from_content_type(Some("audio/mp4; codecs=\"mp4a.40.2\"")),
            ContainerKind::Mp4
        );
        assert_eq!(
            ContainerKind::from_content_type(Some("video/webm")),
            ContainerKind::WebM
        );
        assert_eq!(
            ContainerKind::from_content_type(Some("application/octet-stream")),
            ContainerKind::Unknown
        );
        assert_eq!(ContainerKind::from_content_type(None), ContainerKind::Mp4);
        assert_eq!(ContainerKind::from_content_type(Some("")), ContainerKind::Mp4);
        assert!(!ContainerKind::WebM.is_isobmff());
        assert!(!ContainerKind::Unknown.is_isobmff());
    }
}
