//! Capture engine for live broadcasts served as numbered fragments.
//!
//! A capture records an audio and a video track, or just one of them. For
//! each track a pool of workers downloads fragments by sequence number while
//! a sequencer writes them to the track's output strictly in order,
//! persisting enough state to resume after an interruption.
//! [`StreamArchiver`] wires everything together.
//!
//! ```no_run
//! use std::sync::Arc;
//! use livearc_engine::{ArchiveConfig, DirectUrlProvider, StreamArchiver, TrackKind, parse_direct_url};
//!
//! # async fn example(audio: &str, video: &str) -> livearc_engine::Result<()> {
//! let audio = parse_direct_url(audio, TrackKind::Audio)?;
//! let video = parse_direct_url(video, TrackKind::Video)?;
//! let provider = Arc::new(DirectUrlProvider::new([audio, video]));
//! let summary = StreamArchiver::new(ArchiveConfig::default(), provider).run().await?;
//! for track in summary.tracks() {
//!     println!("{}", track.path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod archiver;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod fragment;
pub mod persistence;
pub mod policy;
pub mod provider;
pub mod quality;
pub mod reorder;
pub mod sequencer;
pub mod slow;
pub mod state;
pub mod template;
pub mod track;
pub mod waiter;
pub mod worker;
pub mod writer;

pub use archiver::{ArchiveHandle, ArchiveSummary, StreamArchiver, TrackSummary};
pub use config::{
    ArchiveConfig, FetcherConfig, HttpConfig, RefreshConfig, SequencerConfig, TrackSelection,
    WaitConfig, WaitPolicy, create_client,
};
pub use error::{ArchiveError, Result};
pub use events::ArchiveEvent;
pub use fetcher::{FetchedBody, FragmentSource, HttpFragmentSource};
pub use persistence::DownloadState;
pub use policy::FetchFailure;
pub use provider::{
    DirectUrl, DirectUrlProvider, DownloadUrls, LiveStatus, MetadataProvider, MetadataRefresher,
    parse_direct_url,
};
pub use quality::{
    AUDIO_ITAG, CodecPreference, Quality, QualityRequest, QualitySelector, SelectedFormat,
    SelectedFormats,
};
pub use state::{StreamState, TrackHandle};
pub use template::{OutputFields, format_output_name};
pub use track::{TrackKind, UrlTemplate};
pub use waiter::LiveWaiter;
