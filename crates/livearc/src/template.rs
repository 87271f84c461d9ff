//! Output file naming from `%(key)s` templates.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::warn;

use crate::error::{ArchiveError, Result};

/// Longest file name produced, leaving room for a `.description` sidecar
/// within the usual 255 byte limit.
pub const MAX_FILE_NAME_LEN: usize = 243;

pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s-%(id)s";

static KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%\((\w+)\)s").unwrap());

/// Values available to output templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFields {
    pub id: String,
    pub title: String,
    pub channel_id: String,
    pub channel: String,
    pub upload_date: String,
    pub start_date: String,
    pub publish_date: String,
    /// Never placed in file names.
    pub description: String,
    pub url: String,
}

impl OutputFields {
    /// Value for a template key, already safe for a file name.
    fn value(&self, key: &str) -> Option<String> {
        let raw = match key {
            "id" => &self.id,
            "title" => &self.title,
            "channel_id" => &self.channel_id,
            "channel" => &self.channel,
            "upload_date" => &self.upload_date,
            "start_date" => &self.start_date,
            "publish_date" => &self.publish_date,
            "description" => return Some(String::new()),
            "url" => &self.url,
            _ => return None,
        };
        Some(sanitize_file_name(raw))
    }
}

/// Swap characters that are not allowed in file names for full-width lookalikes.
pub fn sanitize_file_name(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '<' => '＜',
            '>' => '＞',
            ':' => '：',
            '"' => '″',
            '/' => '⧸',
            '\\' => '⧹',
            '|' => '｜',
            '?' => '？',
            '*' => '＊',
            other => other,
        })
        .collect()
}

/// Longest prefix of `s` no more than `max_bytes` long, cut on a char boundary.
fn truncate_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn expand(template: &str, fields: &OutputFields, title: &str) -> Result<String> {
    let mut unknown = None;
    let expanded = KEY_REGEX.replace_all(template, |caps: &Captures<'_>| {
        let key = caps[1].to_lowercase();
        if key == "title" {
            return title.to_owned();
        }
        match fields.value(&key) {
            Some(value) => value,
            None => {
                unknown.get_or_insert(key);
                String::new()
            }
        }
    });
    if let Some(key) = unknown {
        return Err(ArchiveError::template(format!("unknown output format key '{key}'")));
    }
    Ok(expanded.into_owned())
}

fn file_name_len(path: &str) -> usize {
    Path::new(path)
        .file_name()
        .map_or(path.len(), |name| name.len())
}

/// Expand `template` with `fields`.
///
/// Keys are case-insensitive; an unknown key is an error. Literal template
/// text, including directory separators, is kept as written. When the final
/// file name would exceed [`MAX_FILE_NAME_LEN`] bytes, the title is shortened
/// to fit.
pub fn format_output_name(template: &str, fields: &OutputFields) -> Result<String> {
    let title = sanitize_file_name(&fields.title);
    let name = expand(template, fields, &title)?;

    let len = file_name_len(&name);
    if len <= MAX_FILE_NAME_LEN {
        return Ok(name);
    }

    warn!(len, "Formatted file name is too long, truncating the title");
    let over = len - MAX_FILE_NAME_LEN;
    let title = truncate_bytes(&title, title.len().saturating_sub(over));
    let name = expand(template, fields, title)?;
    if file_name_len(&name) > MAX_FILE_NAME_LEN {
        return Err(ArchiveError::template(format!(
            "file name is longer than {MAX_FILE_NAME_LEN} bytes even without a title"
        )));
    }
    Ok(name)
}

/// `<name>.f<itag>`: a track's output path without its `.ts` extension.
pub fn track_base_path(dir: &Path, name: &str, itag: u32) -> PathBuf {
    dir.join(format!("{name}.f{itag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> OutputFields {
        OutputFields {
            id: "abc123".into(),
            title: "Late night: Q&A <live>".into(),
            channel: "Some/Channel".into(),
            description: "long text".into(),
            ..Default::default()
        }
    }

    #[test]
    fn expands_and_sanitizes() {
        let name = format_output_name("%(channel)s/%(title)s-%(ID)s", &fields()).unwrap();
        assert_eq!(name, "Some⧸Channel/Late night： Q&A ＜live＞-abc123");
    }

    #[test]
    fn description_is_blanked() {
        let name = format_output_name("%(id)s%(description)s", &fields()).unwrap();
        assert_eq!(name, "abc123");
    }

    #[test]
    fn unknown_key_fails() {
        let err = format_output_name("%(title)s-%(views)s", &fields()).unwrap_err();
        assert!(matches!(err, ArchiveError::Template { .. }));
        assert!(err.to_string().contains("views"));
    }

    #[test]
    fn inserted_values_are_not_expanded_again() {
        let mut fields = fields();
        fields.title = "%(views)s".into();
        assert_eq!(format_output_name(DEFAULT_OUTPUT_TEMPLATE, &fields).unwrap(), "%(views)s-abc123");
    }

    #[test]
    fn long_titles_are_truncated_on_char_boundaries() {
        let mut fields = fields();
        fields.title = "配信".repeat(100);
        let name = format_output_name("dir/%(title)s-%(id)s", &fields).unwrap();
        let file = name.strip_prefix("dir/").unwrap();
        assert!(file.len() <= MAX_FILE_NAME_LEN);
        assert!(file.len() > MAX_FILE_NAME_LEN - 3);
        assert!(file.ends_with("-abc123"));
    }

    #[test]
    fn name_too_long_without_title_fails() {
        let mut fields = fields();
        fields.id = "x".repeat(300);
        assert!(format_output_name("%(title)s%(id)s", &fields).is_err());
    }

    #[test]
    fn track_paths() {
        let base = track_base_path(Path::new("/out"), "name", 299);
        assert_eq!(base, PathBuf::from("/out/name.f299"));
    }
}
