//! Resume records, one small JSON file per track.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Progress committed for one track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadState {
    /// Next sequence number to commit.
    pub fragments: u64,
    /// Bytes committed to the output file.
    pub size: u64,
    /// Working directory holding the output and staged fragments.
    pub temp_dir: PathBuf,
    /// First sequence number written to the output.
    #[serde(default)]
    pub start_frag: u64,
}

/// `<id>.f<itag>.state` inside `dir`.
pub fn state_path(dir: &Path, video_id: &str, itag: u32) -> PathBuf {
    dir.join(format!("{video_id}.f{itag}.state"))
}

pub async fn load_state(path: &Path) -> Result<Option<DownloadState>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state = serde_json::from_slice::<DownloadState>(&content)?;
    debug!(path = %path.display(), fragments = state.fragments, size = state.size, "Loaded download state");
    Ok(Some(state))
}

/// Replace the record atomically so a crash never leaves half a file.
pub async fn save_state(path: &Path, state: &DownloadState) -> Result<()> {
    let content = serde_json::to_vec(state)?;
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    tokio::fs::write(&temp, content).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}

pub async fn remove_state(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed download state"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove download state"),
    }
}
