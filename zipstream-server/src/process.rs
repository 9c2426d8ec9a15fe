//! Supervision of the external compressor that produces the archive bytes.
//!
//! An [`ArchiveProcess`] owns exactly one child process together with its
//! pipes. Whoever holds it is responsible for ending its life through either
//! [`ArchiveProcess::finish`] (after stdout reached end-of-stream) or
//! [`ArchiveProcess::terminate`]. Both reap the child. The child is also
//! spawned with `kill_on_drop`, so dropping an unreaped handle still stops it.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::ProcessError;

/// Upper bound on the diagnostic stderr kept per archive.
const STDERR_LIMIT: u64 = 64 * 1024;

/// Program and arguments used to compress the current directory to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArchiveCommand {
    program: String,
    args: Vec<String>,
}

impl ArchiveCommand {
    pub(crate) fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// `zip -qr - .`: quiet, recursive, archive written to stdout.
    pub(crate) fn zip(program: &str) -> Self {
        Self::new(program, &["-qr", "-", "."])
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }
}

/// How a terminated archive process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The process was still running and has been killed by `signal`.
    Killed { signal: i32 },
    /// The process had already exited on its own before it could be signalled.
    Exited(ExitStatus),
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => Termination::Killed { signal },
            None => Termination::Exited(status),
        }
    }

    pub(crate) fn signal_name(&self) -> Option<&'static str> {
        match self {
            Termination::Killed { signal } => Signal::try_from(*signal).ok().map(|s| s.as_str()),
            Termination::Exited(_) => None,
        }
    }
}

pub(crate) struct ArchiveProcess {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    status: Option<ExitStatus>,
}

impl ArchiveProcess {
    /// Spawns `command` with `directory` as its working directory so that
    /// archive entries are relative to the folder being archived.
    pub(crate) fn start(command: &ArchiveCommand, directory: &Path) -> Result<Self, ProcessError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::MissingPipe { stream: "stdout" })?;
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(collect_stderr(stderr)));

        log::debug!(
            "started {} (pid {:?}) in {}",
            command.program(),
            child.id(),
            directory.display()
        );

        Ok(Self {
            child,
            stdout,
            stderr,
            status: None,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Reads the next chunk of archive bytes.
    ///
    /// Keeps reading until `size` bytes are buffered or stdout is exhausted,
    /// so only the final chunk may be shorter than `size`. Returns `None` at
    /// end-of-stream. Bytes already read are lost if the future is dropped.
    pub(crate) async fn read_chunk(&mut self, size: usize) -> Result<Option<Bytes>, ProcessError> {
        let mut buf = BytesMut::zeroed(size);
        let mut filled = 0;
        while filled < size {
            let n = self
                .stdout
                .read(&mut buf[filled..])
                .await
                .map_err(|source| ProcessError::Read { source })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf.freeze()))
    }

    /// Reaps a process whose output has been fully consumed.
    ///
    /// A non-zero exit is reported together with whatever the process wrote
    /// to stderr.
    pub(crate) async fn finish(&mut self) -> Result<ExitStatus, ProcessError> {
        let status = self.reap().await?;
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(status)
        } else {
            Err(ProcessError::Exit { status, stderr })
        }
    }

    /// Kills the process if it is still running and reaps it.
    ///
    /// A process that already exited is not an error. Calling this again after
    /// the process was reaped returns the recorded outcome immediately.
    pub(crate) async fn terminate(&mut self) -> Result<Termination, ProcessError> {
        if let Some(status) = self.status {
            return Ok(Termination::from_status(status));
        }

        match self.child.start_kill() {
            Ok(()) => {}
            Err(e) if is_already_exited(&e) => {
                log::debug!("archive process {:?} already exited", self.pid());
            }
            Err(source) => return Err(ProcessError::Kill { source }),
        }

        let status = self.reap().await?;
        if let Some(task) = self.stderr.take() {
            task.abort();
        }
        Ok(Termination::from_status(status))
    }

    async fn reap(&mut self) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| ProcessError::Wait { source })?;
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for ArchiveProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            log::warn!(
                "archive process {:?} dropped without being reaped, killing it",
                self.pid()
            );
        }
        if let Some(task) = self.stderr.take() {
            task.abort();
        }
    }
}

fn is_already_exited(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::InvalidInput || e.raw_os_error() == Some(Errno::ESRCH as i32)
}

/// Keeps the first [`STDERR_LIMIT`] bytes and discards the rest, so the
/// process never blocks on a full stderr pipe.
async fn collect_stderr(stderr: impl AsyncRead + Unpin) -> String {
    let mut kept = Vec::new();
    let mut limited = stderr.take(STDERR_LIMIT);
    if let Err(e) = limited.read_to_end(&mut kept).await {
        log::debug!("failed to read archive process stderr: {e}");
    }
    let mut rest = limited.into_inner();
    if let Err(e) = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await {
        log::debug!("failed to drain archive process stderr: {e}");
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}
