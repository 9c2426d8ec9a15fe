use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::process::ArchiveProcess;

/// Default size of a single archive chunk (100 KiB).
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 102_400;

/// Sending half of an archive response body.
pub(crate) type ChunkSender = mpsc::Sender<io::Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelayOptions {
    pub(crate) chunk_size: usize,
    /// Pause after every chunk, used to emulate slow downloads.
    pub(crate) pacing: Option<Duration>,
    pub(crate) log_chunks: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pacing: None,
            log_chunks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) chunks: usize,
    pub(crate) bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
    /// The process output was exhausted and every chunk was handed over.
    Completed(Progress),
    /// The receiving side went away before the archive was complete.
    Cancelled(Progress),
}

/// Moves the output of `process` into `sink`, one chunk at a time.
///
/// Closing the receiver is the cancellation signal; it is observed while
/// reading, while sending and while pacing. The process is left untouched on
/// every outcome: the caller decides whether to finish or terminate it.
pub(crate) async fn relay(
    process: &mut ArchiveProcess,
    sink: &ChunkSender,
    options: &RelayOptions,
) -> Result<RelayOutcome, RelayError> {
    let mut progress = Progress::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = sink.closed() => return Ok(RelayOutcome::Cancelled(progress)),
            chunk = process.read_chunk(options.chunk_size) => {
                chunk.map_err(|source| RelayError::Read {
                    chunks: progress.chunks,
                    source,
                })?
            }
        };

        let Some(chunk) = chunk else {
            return Ok(RelayOutcome::Completed(progress));
        };

        let len = chunk.len();
        if options.log_chunks {
            log::debug!(
                "Sending archive chunk {} ({len} bytes)",
                progress.chunks + 1
            );
        }
        if sink.send(Ok(chunk)).await.is_err() {
            return Ok(RelayOutcome::Cancelled(progress));
        }
        progress.chunks += 1;
        progress.bytes += len as u64;

        if let Some(pacing) = options.pacing {
            tokio::select! {
                biased;
                _ = sink.closed() => return Ok(RelayOutcome::Cancelled(progress)),
                _ = tokio::time::sleep(pacing) => {}
            }
        }
    }
}
