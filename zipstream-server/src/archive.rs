use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::{HttpResponse, http, web};
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::ServiceError;
use crate::process::{ArchiveCommand, ArchiveProcess, Termination};
use crate::prometheus::{ArchiveOutcome, PrometheusMetrics};
use crate::relay::{ChunkSender, Progress, RelayOptions, RelayOutcome, relay};
use crate::{ServerResult, resolver};

/// Body of the 404 answer for unknown archives.
pub(crate) const NOT_FOUND_MESSAGE: &str = "Архив не существует или был удален";

/// Every archive is offered under the same download name.
const ARCHIVE_FILENAME: &str = "wedding.zip";

/// A single slot keeps at most one chunk queued ahead of the HTTP writer.
const CHANNEL_CAPACITY: usize = 1;

/// Response body of an archive download.
///
/// The archive is produced by a background task that owns the compression
/// process. Dropping the stream, which actix does when the client goes away,
/// closes the channel and makes that task kill and reap the process. An `Err`
/// item aborts the connection, which is the only failure signal left once the
/// status line has been sent.
pub(crate) struct ArchiveStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl ArchiveStream {
    fn spawn(job: ArchiveJob) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::task::spawn(job.run(tx));
        Self { rx }
    }
}

impl Stream for ArchiveStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct ArchiveJob {
    identifier: String,
    directory: PathBuf,
    command: ArchiveCommand,
    options: RelayOptions,
    metrics: Arc<PrometheusMetrics>,
}

impl ArchiveJob {
    async fn run(self, sink: ChunkSender) {
        let mut process = match ArchiveProcess::start(&self.command, &self.directory) {
            Ok(process) => process,
            Err(e) => {
                log::error!("Cannot archive {}: {e}", self.identifier);
                self.metrics.record_archive(ArchiveOutcome::Failed, 0);
                abort(&sink, e.into()).await;
                return;
            }
        };
        let running = self.metrics.running_process();

        let relayed = relay(&mut process, &sink, &self.options).await;

        // Single exit point: the process is reaped on every path below.
        let (outcome, progress) = match relayed {
            Ok(RelayOutcome::Completed(progress)) => match process.finish().await {
                Ok(_) => {
                    log::info!(
                        "Archive {} sent: {} chunks, {} bytes",
                        self.identifier,
                        progress.chunks,
                        progress.bytes
                    );
                    (ArchiveOutcome::Completed, progress)
                }
                Err(e) => {
                    log::warn!("Archive {} is incomplete: {e}", self.identifier);
                    abort(&sink, e.into()).await;
                    (ArchiveOutcome::Failed, progress)
                }
            },
            Ok(RelayOutcome::Cancelled(progress)) => {
                self.stop(&mut process, progress).await;
                (ArchiveOutcome::Interrupted, progress)
            }
            Err(e) => {
                log::error!("Archive {} failed: {e}", self.identifier);
                self.stop(&mut process, Progress::default()).await;
                abort(&sink, e.into()).await;
                (ArchiveOutcome::Failed, Progress::default())
            }
        };

        drop(running);
        self.metrics.record_archive(outcome, progress.bytes);
    }

    async fn stop(&self, process: &mut ArchiveProcess, progress: Progress) {
        match process.terminate().await {
            Ok(termination @ Termination::Killed { .. }) => log::debug!(
                "Download of {} was interrupted after {} chunks, archive process stopped by {}",
                self.identifier,
                progress.chunks,
                termination.signal_name().unwrap_or("signal")
            ),
            Ok(Termination::Exited(status)) => log::debug!(
                "Download of {} was interrupted after {} chunks, archive process had already exited with {status}",
                self.identifier,
                progress.chunks
            ),
            Err(e) => log::error!(
                "Failed to stop archive process {:?} for {}: {e}",
                process.pid(),
                self.identifier
            ),
        }
    }
}

/// Ends the response abnormally. Fails silently when the client is gone.
async fn abort(sink: &ChunkSender, err: ServiceError) {
    let _ = sink.send(Err(io::Error::other(err.to_string()))).await;
}

pub(crate) async fn get(
    identifier: web::Path<String>,
    settings: web::Data<Config>,
    metrics: web::Data<Arc<PrometheusMetrics>>,
) -> ServerResult {
    let identifier = identifier.into_inner();

    let directory =
        resolver::resolve(&identifier, &settings.archive_root).map_err(ServiceError::from)?;

    let body = ArchiveStream::spawn(ArchiveJob {
        identifier,
        directory,
        command: settings.archive_command(),
        options: settings.relay_options(),
        metrics: metrics.get_ref().clone(),
    });

    // Served as text/html on purpose: existing clients rely on this header.
    Ok(HttpResponse::Ok()
        .insert_header((http::header::CONTENT_TYPE, "text/html"))
        .insert_header((
            http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{ARCHIVE_FILENAME}\""),
        ))
        .streaming(body))
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn job(
        command: ArchiveCommand,
        directory: PathBuf,
        metrics: Arc<PrometheusMetrics>,
    ) -> ArchiveJob {
        ArchiveJob {
            identifier: "test".to_string(),
            directory,
            command,
            options: RelayOptions {
                chunk_size: 1024,
                ..RelayOptions::default()
            },
            metrics,
        }
    }

    fn rendered(metrics: &PrometheusMetrics) -> String {
        metrics.render().unwrap()
    }

    #[tokio::test]
    async fn test_stream_ends_normally() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let mut stream = ArchiveStream::spawn(job(
            ArchiveCommand::new("head", &["-c", "2500", "/dev/zero"]),
            std::env::temp_dir(),
            metrics.clone(),
        ));

        let mut sizes = Vec::new();
        while let Some(chunk) = stream.next().await {
            sizes.push(chunk.expect("no error expected").len());
        }
        assert_eq!(sizes, vec![1024, 1024, 452]);

        // The sender is dropped only after the outcome has been recorded.
        let text = rendered(&metrics);
        assert!(text.contains("zipstream_archives_total{outcome=\"completed\"} 1"));
        assert!(text.contains("zipstream_archive_processes_running 0"));
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_stream() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let mut stream = ArchiveStream::spawn(job(
            ArchiveCommand::new("/nonexistent/zip", &[]),
            std::env::temp_dir(),
            metrics.clone(),
        ));

        let first = stream.next().await.expect("an error item is expected");
        assert!(first.is_err());
        assert!(stream.next().await.is_none());
        assert!(rendered(&metrics).contains("zipstream_archives_total{outcome=\"failed\"} 1"));
    }

    #[tokio::test]
    async fn test_failed_exit_aborts_stream() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let mut stream = ArchiveStream::spawn(job(
            ArchiveCommand::new("sh", &["-c", "printf partial; exit 12"]),
            std::env::temp_dir(),
            metrics,
        ));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"partial"));
        let second = stream.next().await.unwrap();
        assert!(second.is_err(), "non-zero exit must not end the body cleanly");
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_process() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let mut stream = ArchiveStream::spawn(job(
            ArchiveCommand::new("yes", &[]),
            std::env::temp_dir(),
            metrics.clone(),
        ));

        stream.next().await.unwrap().unwrap();
        drop(stream);

        timeout(Duration::from_secs(5), async {
            let interrupted = "zipstream_archives_total{outcome=\"interrupted\"} 1";
            while !rendered(&metrics).contains(interrupted) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("the archive task should record the interruption");
        assert!(rendered(&metrics).contains("zipstream_archive_processes_running 0"));
    }

    #[tokio::test]
    async fn test_archive_contains_directory_entries() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"abc").unwrap();
        fs::create_dir(temp_dir.path().join("nested")).unwrap();
        fs::write(temp_dir.path().join("nested").join("b.txt"), b"hello").unwrap();

        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let mut stream = ArchiveStream::spawn(job(
            ArchiveCommand::zip("zip"),
            temp_dir.path().to_path_buf(),
            metrics,
        ));

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }

        let mut archive = zip::ZipArchive::new(io::Cursor::new(body)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "nested/", "nested/b.txt"]);

        let mut contents = String::new();
        io::Read::read_to_string(&mut archive.by_name("nested/b.txt").unwrap(), &mut contents)
            .unwrap();
        assert_eq!(contents, "hello");
    }
}
