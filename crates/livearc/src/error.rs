use std::path::PathBuf;

use crate::track::TrackKind;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("state file error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("invalid URL template `{input}`: {reason}")]
    InvalidUrlTemplate { input: String, reason: String },

    #[error("invalid direct fragment URL `{input}`: {reason}")]
    InvalidDirectUrl { input: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("metadata provider error: {reason}")]
    Provider { reason: String },

    #[error("stream is unavailable (private, deleted or members only)")]
    StreamUnavailable,

    #[error("stream has not started yet{}", scheduled_start.map(|t| format!(", scheduled for {t}")).unwrap_or_default())]
    NotStarted {
        scheduled_start: Option<chrono::DateTime<chrono::Utc>>,
    },

    #[error("no download URLs available")]
    NoDownloadUrls,

    #[error("none of the requested qualities are available: {requested}")]
    QualityUnavailable { requested: String },

    #[error("{track}: giving up after {attempts} failed writes to {}", path.display())]
    WriteExhausted {
        track: TrackKind,
        path: PathBuf,
        attempts: u32,
    },

    #[error("output name template error: {reason}")]
    Template { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl ArchiveError {
    pub fn invalid_url_template(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrlTemplate {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_direct_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDirectUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn provider(reason: impl Into<String>) -> Self {
        Self::Provider {
            reason: reason.into(),
        }
    }

    pub fn template(reason: impl Into<String>) -> Self {
        Self::Template {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether this error ends the whole capture.
    ///
    /// Fetch level problems never surface as errors; they are absorbed by the
    /// retry policy. What is left either stops the job or is a caller mistake
    /// caught before the capture starts.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::WriteExhausted { .. }
            | Self::StreamUnavailable
            | Self::NotStarted { .. }
            | Self::NoDownloadUrls
            | Self::QualityUnavailable { .. }
            | Self::InvalidUrlTemplate { .. }
            | Self::InvalidDirectUrl { .. }
            | Self::Configuration { .. }
            | Self::Template { .. }
            | Self::Internal { .. } => true,
            Self::Network { .. } | Self::Io { .. } | Self::Json { .. } | Self::Provider { .. } => {
                false
            }
        }
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
