//! Incremental reader for append-only channel logs.
//!
//! `read_new` resumes at a byte offset and only consumes complete lines: a
//! trailing line without its newline is left for the next call, so a record
//! that is mid-write when we read is picked up once the worker flushes it.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use sim_core::record::{parse_line, LogLine};
use sim_core::ActionRecord;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Result of one incremental read.
#[derive(Debug, Default)]
pub struct TailBatch {
    /// Action records in file order.
    pub records: Vec<ActionRecord>,
    /// Lifecycle marker lines seen and skipped.
    pub markers: usize,
    /// Malformed lines skipped.
    pub skipped: usize,
    /// Offset to resume from: the end of the last complete line consumed.
    pub offset: u64,
}

/// Read complete lines of `path` starting at `from_offset`.
///
/// A missing file is not an error: no records, offset unchanged. If the file
/// shrank below `from_offset` it was replaced, and reading restarts at 0.
pub async fn read_new(path: &Path, from_offset: u64, channel: &str) -> std::io::Result<TailBatch> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TailBatch {
                offset: from_offset,
                ..TailBatch::default()
            });
        }
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let start = if len < from_offset {
        warn!(
            path = %path.display(),
            offset = from_offset,
            len,
            "log shrank below cursor; rereading from start"
        );
        0
    } else {
        from_offset
    };

    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let consumed = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);

    let mut batch = TailBatch {
        offset: start + consumed as u64,
        ..TailBatch::default()
    };

    for raw in buf[..consumed].split(|b| *b == b'\n') {
        let Ok(line) = std::str::from_utf8(raw) else {
            debug!(path = %path.display(), "skipping non-utf8 log line");
            batch.skipped += 1;
            continue;
        };
        match parse_line(line, channel) {
            Ok(Some(LogLine::Action(record))) => batch.records.push(record),
            Ok(Some(LogLine::Marker(_))) => batch.markers += 1,
            Ok(None) => {}
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping malformed log line");
                batch.skipped += 1;
            }
        }
    }

    Ok(batch)
}

/// Every complete action record currently in the file.
pub async fn read_all(path: &Path, channel: &str) -> std::io::Result<Vec<ActionRecord>> {
    Ok(read_new(path, 0, channel).await?.records)
}

/// Cursor over one channel log.
#[derive(Debug, Clone)]
pub struct ChannelTail {
    pub channel: String,
    pub path: PathBuf,
    pub offset: u64,
}

impl ChannelTail {
    pub fn new(channel: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            channel: channel.into(),
            path: path.into(),
            offset: 0,
        }
    }

    /// Read whatever was appended since the last poll.
    ///
    /// Read errors are logged and leave the cursor where it was.
    pub async fn poll(&mut self) -> Vec<ActionRecord> {
        match read_new(&self.path, self.offset, &self.channel).await {
            Ok(batch) => {
                if batch.offset != self.offset {
                    debug!(
                        channel = %self.channel,
                        records = batch.records.len(),
                        markers = batch.markers,
                        skipped = batch.skipped,
                        offset = batch.offset,
                        "tailed channel log"
                    );
                }
                self.offset = batch.offset;
                batch.records
            }
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    path = %self.path.display(),
                    error = %e,
                    "failed to read channel log"
                );
                Vec::new()
            }
        }
    }
}
