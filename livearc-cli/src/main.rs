mod error;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use indicatif::{HumanBytes, ProgressStyle};
use livearc_engine::{
    ArchiveConfig, ArchiveEvent, ArchiveSummary, DirectUrl, DirectUrlProvider, OutputFields, QualitySelector,
    StreamArchiver, TrackKind, TrackSelection, parse_direct_url,
};
use tracing::{Instrument, Span, error, info, info_span, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_indicatif::IndicatifLayer;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::AppError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_STOPPED: u8 = 2;

/// Capture a live broadcast from its fragment URLs.
#[derive(Debug, Parser)]
#[command(name = "livearc", version, about)]
struct Args {
    /// Fragment URL of the audio track (itag 140, must carry `noclen`)
    #[arg(long)]
    audio_url: Option<String>,

    /// Fragment URL of the video track
    #[arg(long)]
    video_url: Option<String>,

    /// Only record the audio track
    #[arg(long, conflicts_with = "video_only")]
    audio_only: bool,

    /// Only record the video track
    #[arg(long)]
    video_only: bool,

    /// Start over instead of resuming an interrupted capture
    #[arg(long)]
    no_resume: bool,

    /// Output name template; keys: id, title, channel_id, channel, upload_date,
    /// start_date, publish_date, url
    #[arg(short, long, default_value = "%(id)s")]
    output: String,

    /// Directory for track files and resume state
    #[arg(short = 'd', long, default_value = ".")]
    output_dir: PathBuf,

    /// Concurrent fragment downloads per track
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Attempts per fragment before giving up on it, 0 for unlimited
    #[arg(long, default_value_t = 10)]
    retry_frags: u32,

    /// Keep downloaded fragments in memory instead of staging them to files
    #[arg(long)]
    no_frag_files: bool,

    /// Treat the stream as live: failing fragments are retried indefinitely
    #[arg(long)]
    live: bool,

    /// Fragment duration in seconds
    #[arg(long, default_value_t = 5.0)]
    target_duration: f64,

    /// Proxy URL for all requests (http, https or socks5)
    #[arg(long)]
    proxy: Option<String>,

    /// Only connect over IPv4
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    ipv4: bool,

    /// Only connect over IPv6
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// More output; repeat for trace level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match init_logging(args.verbose, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(summary) => {
            print_summary(&summary);
            if summary.stopped {
                ExitCode::from(EXIT_STOPPED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) if e.is_cancelled() => {
            warn!("Stopped before the capture began");
            ExitCode::from(EXIT_STOPPED)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>, AppError> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("livearc={level},livearc_engine={level},mp4={level}")));

    let indicatif_layer = IndicatifLayer::new();
    let console = fmt::layer()
        .with_target(verbose > 0)
        .with_writer(indicatif_layer.get_stderr_writer());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| AppError::InvalidInput(format!("invalid log file {}", path.display())))?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .with(indicatif_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;

    Ok(guard)
}

fn build_config(args: &Args) -> Result<ArchiveConfig, AppError> {
    if !args.target_duration.is_finite() || args.target_duration <= 0.0 {
        return Err(AppError::InvalidInput("target duration must be positive".into()));
    }

    let mut config = ArchiveConfig::default();
    config.http.proxy = args.proxy.clone();
    config.http.force_ipv4 = args.ipv4;
    config.http.force_ipv6 = args.ipv6;
    config.fetcher.jobs = args.jobs;
    config.fetcher.frag_max_tries = args.retry_frags;
    config.fetcher.stage_to_files = !args.no_frag_files;
    config.tracks = track_selection(args);
    config.validate()?;
    Ok(config)
}

fn track_selection(args: &Args) -> TrackSelection {
    if args.audio_only {
        TrackSelection::AudioOnly
    } else if args.video_only {
        TrackSelection::VideoOnly
    } else {
        TrackSelection::Both
    }
}

/// Parse the fragment URL of every selected track.
fn track_urls(args: &Args, selection: TrackSelection) -> Result<Vec<DirectUrl>, AppError> {
    selection
        .kinds()
        .map(|kind| {
            let input = match kind {
                TrackKind::Audio => args.audio_url.as_deref(),
                TrackKind::Video => args.video_url.as_deref(),
            }
            .ok_or_else(|| AppError::InvalidInput(format!("--{kind}-url is required to record the {kind} track")))?;
            Ok(parse_direct_url(input, kind)?)
        })
        .collect()
}

async fn run(args: Args) -> Result<ArchiveSummary, AppError> {
    let config = build_config(&args)?;
    let urls = track_urls(&args, config.tracks)?;

    let video_id = urls
        .iter()
        .rev()
        .find_map(|url| url.video_id.clone())
        .unwrap_or_else(|| "livearc".to_owned());
    let itags: Vec<u32> = urls.iter().map(|url| url.itag).collect();
    info!(id = %video_id, ?itags, "Starting capture");

    let quality = match config.tracks {
        TrackSelection::AudioOnly => QualitySelector::default(),
        _ => urls.last().map_or_else(QualitySelector::default, |video| QualitySelector::itag(video.itag)),
    };
    let page_url = args
        .video_url
        .clone()
        .or_else(|| args.audio_url.clone())
        .unwrap_or_default();
    let provider = DirectUrlProvider::new(urls)
        .with_live(args.live)
        .with_target_duration(Duration::from_secs_f64(args.target_duration));

    let fields = OutputFields {
        title: video_id.clone(),
        url: page_url,
        id: video_id,
        ..Default::default()
    };

    let mut handle = StreamArchiver::new(config, Arc::new(provider))
        .with_quality(quality)
        .with_output_dir(&args.output_dir)
        .with_output_template(&args.output)
        .with_fields(fields)
        .with_resume(!args.no_resume)
        .start()?;

    let stop = handle.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing up. Run again with the same arguments to resume.");
            stop.cancel();
        }
    });

    let progress = info_span!("capture");
    progress.pb_set_style(
        &ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    progress.pb_set_message("Waiting for fragments");

    async {
        let mut status = Status::default();
        while let Some(event) = handle.next_event().await {
            status.apply(&event);
            Span::current().pb_set_message(&status.render());
        }
    }
    .instrument(progress)
    .await;

    Ok(handle.wait().await?)
}

#[derive(Debug, Default)]
struct Status {
    audio: (u64, u64),
    video: (u64, u64),
    max_seq: Option<u64>,
}

impl Status {
    fn apply(&mut self, event: &ArchiveEvent) {
        match event {
            ArchiveEvent::Progress {
                track,
                fragments,
                total_bytes,
                max_seq,
                ..
            } => {
                let slot = match track {
                    TrackKind::Audio => &mut self.audio,
                    TrackKind::Video => &mut self.video,
                };
                *slot = (*fragments, *total_bytes);
                self.max_seq = self.max_seq.max(*max_seq);
            }
            ArchiveEvent::TrackFinished { track, fragments, .. } => {
                info!(%track, fragments, "Track complete");
            }
            ArchiveEvent::TrackAborted { track, reason } => {
                error!(%track, %reason, "Track aborted");
            }
        }
    }

    fn render(&self) -> String {
        let max = self
            .max_seq
            .map_or_else(|| "?".to_owned(), |m| (m + 1).to_string());
        format!(
            "Audio {}/{} ({}) | Video {}/{} ({}) | Total {}",
            self.audio.0,
            max,
            HumanBytes(self.audio.1),
            self.video.0,
            max,
            HumanBytes(self.video.1),
            HumanBytes(self.audio.1 + self.video.1),
        )
    }
}

fn print_summary(summary: &ArchiveSummary) {
    if summary.stopped {
        warn!("Capture stopped early, state was kept so it can be resumed");
    } else {
        info!("Capture finished");
    }
    for track in summary.tracks() {
        println!(
            "{}: {} ({} fragments, {})",
            track.track,
            track.path.display(),
            track.fragments,
            HumanBytes(track.bytes)
        );
    }
}
