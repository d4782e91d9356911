//! Read back the service's own log output for `GET /logs`

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

/// Locates the newest rolled log file and reads its tail
#[derive(Debug, Clone)]
pub struct LogSource {
    dir: PathBuf,
    prefix: String,
    tail_bytes: u64,
}

impl LogSource {
    pub fn new(dir: impl AsRef<Path>, prefix: impl Into<String>, tail_bytes: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
            tail_bytes,
        }
    }

    /// Last `tail_bytes` of the newest log file, starting at a line boundary.
    /// No log file yet reads as empty text.
    pub async fn tail(&self) -> Result<String> {
        let Some(path) = self.newest_file().await? else {
            return Ok(String::new());
        };

        let mut file = tokio::fs::File::open(&path).await.map_err(log_error)?;
        let len = file.metadata().await.map_err(log_error)?.len();
        let start = len.saturating_sub(self.tail_bytes);
        file.seek(SeekFrom::Start(start)).await.map_err(log_error)?;

        let mut buf = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut buf).await.map_err(log_error)?;

        let text = String::from_utf8_lossy(&buf);
        if start > 0 {
            // drop the partial first line
            if let Some(pos) = text.find('\n') {
                return Ok(text[pos + 1..].to_string());
            }
        }
        Ok(text.into_owned())
    }

    async fn newest_file(&self) -> Result<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(log_error(e)),
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await.map_err(log_error)? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&self.prefix) {
                continue;
            }
            let metadata = entry.metadata().await.map_err(log_error)?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let path = entry.path();
            let is_newer = match &newest {
                Some((time, current)) => (modified, &path) > (*time, current),
                None => true,
            };
            if is_newer {
                newest = Some((modified, path));
            }
        }

        Ok(newest.map(|(_, path)| path))
    }
}

fn log_error(e: std::io::Error) -> Error {
    Error::Internal(format!("reading logs: {}", e))
}
