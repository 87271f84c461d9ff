use std::fmt;

use url::Url;

use crate::error::{ArchiveError, Result};

/// One of the two elementary streams of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub const ALL: [TrackKind; 2] = [TrackKind::Audio, TrackKind::Video];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fragment URL with a single `%d` placeholder for the sequence number.
///
/// `%%` stands for a literal percent sign, so percent-encoded query values
/// survive as long as they were escaped when the template was built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlTemplate {
    raw: String,
    prefix: String,
    suffix: String,
}

impl UrlTemplate {
    pub fn parse(template: impl Into<String>) -> Result<Self> {
        let raw = template.into();
        let mut prefix = String::with_capacity(raw.len());
        let mut suffix = String::new();
        let mut placeholder_seen = false;

        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            let out = if placeholder_seen {
                &mut suffix
            } else {
                &mut prefix
            };
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                Some('d') if !placeholder_seen => placeholder_seen = true,
                Some('d') => {
                    return Err(ArchiveError::invalid_url_template(
                        raw.clone(),
                        "more than one %d placeholder",
                    ));
                }
                Some(other) => {
                    return Err(ArchiveError::invalid_url_template(
                        raw.clone(),
                        format!("unsupported directive %{other}"),
                    ));
                }
                None => {
                    return Err(ArchiveError::invalid_url_template(
                        raw.clone(),
                        "dangling %",
                    ));
                }
            }
        }

        if !placeholder_seen {
            return Err(ArchiveError::invalid_url_template(
                raw,
                "missing %d placeholder",
            ));
        }

        let template = Self {
            raw,
            prefix,
            suffix,
        };
        // The instantiated form must be a usable absolute URL.
        Url::parse(&template.instantiate(0))
            .map_err(|e| ArchiveError::invalid_url_template(template.raw.clone(), e.to_string()))?;
        Ok(template)
    }

    /// Template for a DASH base URL: fragments live under `sq/<n>`.
    pub fn from_dash_base(base: &str) -> Result<Self> {
        let mut raw = base.replace('%', "%%");
        if !raw.ends_with('/') {
            raw.push('/');
        }
        raw.push_str("sq/%d");
        Self::parse(raw)
    }

    /// Template for an adaptive format URL: fragments are selected with `&sq=<n>`.
    pub fn from_adaptive_url(url: &str) -> Result<Self> {
        let mut raw = url.replace('%', "%%");
        raw.push_str("&sq=%d");
        Self::parse(raw)
    }

    pub fn instantiate(&self, seq: u64) -> String {
        format!("{}{}{}", self.prefix, seq, self.suffix)
    }

    /// Authority of the fragment server, used for `Host`-derived headers.
    pub fn host(&self) -> Option<String> {
        let url = Url::parse(&self.instantiate(0)).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
