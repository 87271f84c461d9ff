use std::io::{self, SeekFrom};
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// How the output file was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Positioned at the end of previously committed data.
    Resumed { offset: u64 },
    /// Created or truncated; capture starts over.
    Fresh,
}

/// Open a track's output file, continuing at `resume_offset` when possible.
///
/// A missing file, one shorter than the committed size, or a failed seek all
/// fall back to truncating and starting over.
pub async fn open_output(path: &Path, resume_offset: Option<u64>) -> io::Result<(File, OpenMode)> {
    if let Some(offset) = resume_offset.filter(|&o| o > 0) {
        match reopen_at(path, offset).await {
            Ok(file) => return Ok((file, OpenMode::Resumed { offset })),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    offset,
                    error = %e,
                    "Failed to reopen output to resume, will truncate and start from the beginning"
                );
            }
        }
    }

    let file = File::create(path).await?;
    Ok((file, OpenMode::Fresh))
}

async fn reopen_at(path: &Path, offset: u64) -> io::Result<File> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).await?;
    let len = file.metadata().await?.len();
    if len < offset {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("file holds {len} bytes, {offset} were committed"),
        ));
    }
    if len > offset {
        // Bytes past the committed size belong to an interrupted write.
        file.set_len(offset).await?;
    }
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Appends fragment payloads to an output, never leaving partial writes behind.
#[derive(Debug)]
pub struct FragmentWriter<W> {
    inner: W,
    chunk_size: usize,
    committed: u64,
    needs_rewind: bool,
}

impl<W: AsyncWrite + AsyncSeek + Unpin> FragmentWriter<W> {
    /// `committed` is the current position of `inner`.
    pub fn new(inner: W, chunk_size: usize, committed: u64) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
            committed,
            needs_rewind: false,
        }
    }

    /// Bytes committed to the output so far.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Write one payload completely or not at all. On failure the position
    /// is moved back by whatever part of this payload already went out.
    pub async fn write_fragment(&mut self, data: &[u8]) -> io::Result<u64> {
        if self.needs_rewind {
            self.inner.seek(SeekFrom::Start(self.committed)).await?;
            self.needs_rewind = false;
        }

        let mut written = 0usize;
        while written < data.len() {
            let end = (written + self.chunk_size).min(data.len());
            match self.inner.write(&data[written..end]).await {
                Ok(0) => {
                    self.rewind(written).await;
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "output accepted no bytes"));
                }
                Ok(n) => written += n,
                Err(e) => {
                    self.rewind(written).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.inner.flush().await {
            self.rewind(written).await;
            return Err(e);
        }

        self.committed += written as u64;
        Ok(written as u64)
    }

    async fn rewind(&mut self, written: usize) {
        if written == 0 {
            return;
        }
        if self.inner.seek(SeekFrom::Start(self.committed)).await.is_err() {
            self.needs_rewind = true;
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
