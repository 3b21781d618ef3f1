use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

/// A byte window of a log file plus the file's total size, so a tailing
/// client can ask for the next window starting at `size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogWindow {
    pub content: String,
    pub size: u64,
}

/// Read a window of `path`.
///
/// With an `offset` the window starts there; otherwise it covers the last
/// `max_size` bytes (or the whole file when `max_size` is unset).
pub async fn tail_file(
    path: impl AsRef<Path>,
    max_size: Option<u64>,
    offset: Option<u64>,
) -> Result<LogWindow> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    let size = file.metadata().await?.len();

    let start = match (offset.filter(|&o| o > 0), max_size) {
        (Some(offset), _) => offset,
        (None, Some(max)) => size - size.min(max),
        (None, None) => 0,
    };
    let end = match max_size {
        Some(max) => size.min(start.saturating_add(max)),
        None => size,
    };

    if end <= start {
        return Ok(LogWindow {
            content: String::new(),
            size,
        });
    }

    file.seek(SeekFrom::Start(start)).await?;
    let mut buffer = Vec::with_capacity((end - start) as usize);
    file.take(end - start).read_to_end(&mut buffer).await?;

    Ok(LogWindow {
        content: String::from_utf8_lossy(&buffer).into_owned(),
        size,
    })
}
