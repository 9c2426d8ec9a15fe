use std::path::PathBuf;

use clap::Parser;

/// Command-line flags. Each one overrides the matching config file setting.
#[derive(Parser, Debug, Default)]
#[command(name = "zipstream-server")]
#[command(version)]
#[command(about = "Streams folders as zip archives over HTTP", long_about = None)]
pub(crate) struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short = 'l', long = "logging")]
    pub(crate) logging: bool,

    /// Pause between archive chunks to simulate a slow connection
    #[arg(short = 'd', long = "delay")]
    pub(crate) delay: bool,

    /// Directory holding one sub-directory per archive
    #[arg(short = 'p', long = "path", value_name = "DIR")]
    pub(crate) path: Option<PathBuf>,
}
