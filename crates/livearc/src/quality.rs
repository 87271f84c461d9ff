//! Format selection: the audio track plus the preferred video quality.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::config::TrackSelection;
use crate::error::{ArchiveError, Result};
use crate::track::{TrackKind, UrlTemplate};

/// Itag of the only audio format offered for fragmented broadcasts.
pub const AUDIO_ITAG: u32 = 140;

/// Video quality labels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quality {
    P144,
    P240,
    P360,
    P480,
    P720,
    P720_60,
    P1080,
    P1080_60,
    P1440,
    P1440_60,
    P2160,
    P2160_60,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoItags {
    pub h264: u32,
    pub vp9: u32,
}

impl Quality {
    pub const ALL: [Quality; 12] = [
        Quality::P144,
        Quality::P240,
        Quality::P360,
        Quality::P480,
        Quality::P720,
        Quality::P720_60,
        Quality::P1080,
        Quality::P1080_60,
        Quality::P1440,
        Quality::P1440_60,
        Quality::P2160,
        Quality::P2160_60,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Quality::P144 => "144p",
            Quality::P240 => "240p",
            Quality::P360 => "360p",
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P720_60 => "720p60",
            Quality::P1080 => "1080p",
            Quality::P1080_60 => "1080p60",
            Quality::P1440 => "1440p",
            Quality::P1440_60 => "1440p60",
            Quality::P2160 => "2160p",
            Quality::P2160_60 => "2160p60",
        }
    }

    pub fn itags(self) -> VideoItags {
        let (h264, vp9) = match self {
            Quality::P144 => (160, 278),
            Quality::P240 => (133, 242),
            Quality::P360 => (134, 243),
            Quality::P480 => (135, 244),
            Quality::P720 => (136, 247),
            Quality::P720_60 => (298, 302),
            Quality::P1080 => (137, 248),
            Quality::P1080_60 => (299, 303),
            Quality::P1440 => (264, 271),
            Quality::P1440_60 => (304, 308),
            Quality::P2160 => (266, 313),
            Quality::P2160_60 => (305, 315),
        };
        VideoItags { h264, vp9 }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Quality {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Quality::ALL
            .into_iter()
            .find(|q| q.label() == wanted)
            .ok_or_else(|| ArchiveError::configuration(format!("unknown quality `{s}`")))
    }
}

/// One alternative in a slash separated preference list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityRequest {
    Best,
    Label(Quality),
    /// A raw format id, used when the URLs were given directly.
    Itag(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CodecPreference {
    /// H.264 unless only VP9 exists for the label.
    #[default]
    Any,
    PreferVp9,
    H264Only,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFormat {
    pub itag: u32,
    pub url: UrlTemplate,
}

/// Result of a selection. Tracks left out of the capture are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFormats {
    pub audio: Option<SelectedFormat>,
    pub video: Option<SelectedFormat>,
    pub label: Option<Quality>,
}

impl SelectedFormats {
    pub fn get(&self, kind: TrackKind) -> Option<&SelectedFormat> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualitySelector {
    requests: Vec<QualityRequest>,
    codec: CodecPreference,
}

impl Default for QualitySelector {
    fn default() -> Self {
        Self {
            requests: vec![QualityRequest::Best],
            codec: CodecPreference::Any,
        }
    }
}

impl QualitySelector {
    pub fn new(requests: Vec<QualityRequest>, codec: CodecPreference) -> Self {
        Self { requests, codec }
    }

    /// Parse `1080p60/1080p/best` style lists.
    pub fn parse(selection: &str, codec: CodecPreference) -> Result<Self> {
        let mut requests = Vec::new();
        for part in selection.split('/') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part.eq_ignore_ascii_case("best") {
                requests.push(QualityRequest::Best);
            } else {
                requests.push(QualityRequest::Label(part.parse()?));
            }
        }
        if requests.is_empty() {
            return Err(ArchiveError::configuration("no valid qualities selected"));
        }
        Ok(Self { requests, codec })
    }

    pub fn itag(itag: u32) -> Self {
        Self {
            requests: vec![QualityRequest::Itag(itag)],
            codec: CodecPreference::Any,
        }
    }

    /// Labels for which at least one codec is offered.
    pub fn available(templates: &BTreeMap<u32, UrlTemplate>) -> Vec<Quality> {
        Quality::ALL
            .into_iter()
            .filter(|q| {
                let itags = q.itags();
                templates.contains_key(&itags.h264) || templates.contains_key(&itags.vp9)
            })
            .collect()
    }

    fn pick_codec(&self, quality: Quality, templates: &BTreeMap<u32, UrlTemplate>) -> Option<u32> {
        let itags = quality.itags();
        let has_vp9 = templates.contains_key(&itags.vp9);
        let has_h264 = templates.contains_key(&itags.h264);
        let use_vp9 = match self.codec {
            CodecPreference::H264Only => false,
            CodecPreference::PreferVp9 => has_vp9,
            CodecPreference::Any => has_vp9 && !has_h264,
        };
        if use_vp9 {
            Some(itags.vp9)
        } else if has_h264 {
            Some(itags.h264)
        } else {
            None
        }
    }

    /// Select audio and video.
    pub fn select(&self, templates: &BTreeMap<u32, UrlTemplate>) -> Result<SelectedFormats> {
        self.select_tracks(templates, TrackSelection::Both)
    }

    pub fn select_tracks(
        &self,
        templates: &BTreeMap<u32, UrlTemplate>,
        tracks: TrackSelection,
    ) -> Result<SelectedFormats> {
        if templates.is_empty() {
            return Err(ArchiveError::NoDownloadUrls);
        }

        let audio = if tracks.includes(TrackKind::Audio) {
            let url = templates
                .get(&AUDIO_ITAG)
                .cloned()
                .ok_or(ArchiveError::NoDownloadUrls)?;
            Some(SelectedFormat { itag: AUDIO_ITAG, url })
        } else {
            None
        };

        let (video, label) = if tracks.includes(TrackKind::Video) {
            let (video, label) = self.select_video(templates)?;
            (Some(video), label)
        } else {
            info!("Recording audio only");
            (None, None)
        };

        Ok(SelectedFormats { audio, video, label })
    }

    fn select_video(&self, templates: &BTreeMap<u32, UrlTemplate>) -> Result<(SelectedFormat, Option<Quality>)> {
        let available = Self::available(templates);

        for request in &self.requests {
            let (video_itag, label) = match *request {
                QualityRequest::Itag(itag) => {
                    if !templates.contains_key(&itag) {
                        continue;
                    }
                    (itag, None)
                }
                QualityRequest::Best => {
                    let Some(best) = available
                        .iter()
                        .rev()
                        .find_map(|&q| self.pick_codec(q, templates).map(|itag| (itag, q)))
                    else {
                        continue;
                    };
                    (best.0, Some(best.1))
                }
                QualityRequest::Label(quality) => match self.pick_codec(quality, templates) {
                    Some(itag) => (itag, Some(quality)),
                    None => continue,
                },
            };

            let Some(url) = templates.get(&video_itag).cloned() else {
                continue;
            };
            info!(
                quality = label.map(Quality::label).unwrap_or("direct"),
                itag = video_itag,
                "Selected video format"
            );
            return Ok((SelectedFormat { itag: video_itag, url }, label));
        }

        Err(ArchiveError::QualityUnavailable {
            requested: self
                .requests
                .iter()
                .map(|r| match r {
                    QualityRequest::Best => "best".to_owned(),
                    QualityRequest::Label(q) => q.label().to_owned(),
                    QualityRequest::Itag(itag) => format!("itag {itag}"),
                })
                .collect::<Vec<_>>()
                .join("/"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates(itags: &[u32]) -> BTreeMap<u32, UrlTemplate> {
        itags
            .iter()
            .map(|&itag| {
                let url = format!("https://h.example/vp?itag={itag}&sq=%d");
                (itag, UrlTemplate::parse(url).unwrap())
            })
            .collect()
    }

    #[test]
    fn best_picks_highest_available_label() {
        let map = templates(&[140, 136, 137, 248]);
        let selected = QualitySelector::default().select(&map).unwrap();
        assert_eq!(selected.label, Some(Quality::P1080));
        assert_eq!(selected.video.unwrap().itag, 137);
        assert_eq!(selected.audio.unwrap().itag, AUDIO_ITAG);
    }

    #[test]
    fn codec_preferences() {
        let map = templates(&[140, 137, 248, 303]);
        let vp9 = QualitySelector::parse("1080p", CodecPreference::PreferVp9).unwrap();
        assert_eq!(vp9.select(&map).unwrap().video.unwrap().itag, 248);

        // 1080p60 only exists as VP9 here
        let any = QualitySelector::parse("1080p60", CodecPreference::Any).unwrap();
        assert_eq!(any.select(&map).unwrap().video.unwrap().itag, 303);

        let h264 = QualitySelector::parse("1080p60/720p", CodecPreference::H264Only).unwrap();
        assert!(matches!(
            h264.select(&map),
            Err(ArchiveError::QualityUnavailable { .. })
        ));
    }

    #[test]
    fn falls_through_preference_list() {
        let map = templates(&[140, 136]);
        let selector = QualitySelector::parse(" 1080p60 / 720p /best", CodecPreference::Any).unwrap();
        let selected = selector.select(&map).unwrap();
        assert_eq!(selected.label, Some(Quality::P720));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(QualitySelector::parse("999p", CodecPreference::Any).is_err());
        assert!(QualitySelector::parse(" / ", CodecPreference::Any).is_err());
        assert_eq!("1440P60".parse::<Quality>().unwrap(), Quality::P1440_60);
    }

    #[test]
    fn missing_audio_means_no_urls() {
        let map = templates(&[137]);
        assert!(matches!(
            QualitySelector::default().select(&map),
            Err(ArchiveError::NoDownloadUrls)
        ));
    }

    #[test]
    fn raw_itag_selection() {
        let map = templates(&[140, 9999]);
        let selected = QualitySelector::itag(9999).select(&map).unwrap();
        assert_eq!(selected.video.unwrap().itag, 9999);
        assert_eq!(selected.label, None);
    }

    #[test]
    fn audio_only_ignores_video_preferences() {
        let map = templates(&[140, 137]);
        let selector = QualitySelector::parse("2160p60", CodecPreference::Any).unwrap();
        let selected = selector.select_tracks(&map, TrackSelection::AudioOnly).unwrap();
        assert_eq!(selected.get(TrackKind::Audio).map(|f| f.itag), Some(AUDIO_ITAG));
        assert!(selected.video.is_none());
        assert_eq!(selected.label, None);

        assert!(matches!(
            selector.select_tracks(&templates(&[137]), TrackSelection::AudioOnly),
            Err(ArchiveError::NoDownloadUrls)
        ));
    }

    #[test]
    fn video_only_needs_no_audio() {
        let map = templates(&[137, 248]);
        let selected = QualitySelector::default()
            .select_tracks(&map, TrackSelection::VideoOnly)
            .unwrap();
        assert!(selected.audio.is_none());
        assert_eq!(selected.get(TrackKind::Video).map(|f| f.itag), Some(137));
        assert_eq!(selected.label, Some(Quality::P1080));

        assert!(matches!(
            QualitySelector::default().select_tracks(&BTreeMap::new(), TrackSelection::VideoOnly),
            Err(ArchiveError::NoDownloadUrls)
        ));
    }
}
