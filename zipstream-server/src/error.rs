use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Archive lookup error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Archive process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Archive relay error: {0}")]
    Relay(#[from] RelayError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server startup failed: {reason}")]
    Startup { reason: String },
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no archive directory for identifier {identifier:?}")]
    NotFound { identifier: String },
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive process did not expose its {stream}")]
    MissingPipe { stream: &'static str },

    #[error("Failed to read archive output: {source}")]
    Read {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal archive process: {source}")]
    Kill {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for archive process: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },

    #[error("Archive process exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("reading chunk failed after {chunks} chunks: {source}")]
    Read {
        chunks: usize,
        #[source]
        source: ProcessError,
    },
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Extension trait for adding context to IO errors
pub trait IoErrorContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoErrorContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ServiceError::Io {
            context: context.into(),
            source: e,
        })
    }
}
