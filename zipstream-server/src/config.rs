use crate::cli::Cli;
use crate::error::{ConfigError, Result, ServiceError};
use crate::process::ArchiveCommand;
use crate::relay::{DEFAULT_CHUNK_SIZE, RelayOptions};
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PHOTOS_FOLDER: &str = "test_photos";

fn default_bind() -> String {
    "[::]:8080".into()
}

fn default_workers() -> usize {
    4
}

fn default_archive_root() -> PathBuf {
    std::env::current_dir()
        .map(|cwd| cwd.join(PHOTOS_FOLDER))
        .unwrap_or_else(|_| PathBuf::from(PHOTOS_FOLDER))
}

fn default_index_path() -> PathBuf {
    PathBuf::from("index.html")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_delay_secs() -> u64 {
    1
}

fn default_zip_program() -> String {
    "zip".into()
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default = "default_bind")]
    pub(crate) bind: String,
    #[serde(default = "default_workers")]
    pub(crate) workers: usize,

    #[serde(default = "default_archive_root")]
    pub(crate) archive_root: PathBuf,
    #[serde(default = "default_index_path")]
    pub(crate) index_path: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub(crate) chunk_size: usize,

    #[serde(default)]
    pub(crate) enable_logging: bool,
    #[serde(default)]
    pub(crate) enable_delay: bool,
    #[serde(default = "default_delay_secs")]
    pub(crate) delay_secs: u64,

    #[serde(default = "default_zip_program")]
    pub(crate) zip_program: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            workers: default_workers(),
            archive_root: default_archive_root(),
            index_path: default_index_path(),
            chunk_size: default_chunk_size(),
            enable_logging: false,
            enable_delay: false,
            delay_secs: default_delay_secs(),
            zip_program: default_zip_program(),
        }
    }
}

impl Config {
    pub(crate) fn load(settings_file: &Path) -> Result<Config> {
        let contents = read_to_string(settings_file).map_err(|e| ConfigError::ReadFile {
            path: settings_file.display().to_string(),
            source: e,
        })?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Config> {
        toml::from_str(contents).map_err(|e| ServiceError::from(ConfigError::from(e)))
    }

    /// Command-line flags win over the environment, which wins over the file.
    fn apply_overrides(&mut self, archive_root_env: Option<PathBuf>, cli: &Cli) {
        if let Some(root) = archive_root_env {
            self.archive_root = root;
        }
        if let Some(path) = &cli.path {
            self.archive_root = path.clone();
        }
        self.enable_logging |= cli.logging;
        self.enable_delay |= cli.delay;
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                reason: "workers must be greater than 0".to_string(),
            }
            .into());
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "chunk_size must be greater than 0".to_string(),
            }
            .into());
        }
        if self.zip_program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "zip_program must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            chunk_size: self.chunk_size,
            pacing: self
                .enable_delay
                .then(|| Duration::from_secs(self.delay_secs)),
            log_chunks: self.enable_logging,
        }
    }

    pub(crate) fn archive_command(&self) -> ArchiveCommand {
        ArchiveCommand::zip(&self.zip_program)
    }
}

pub(crate) fn load(cli: &Cli) -> Result<Config> {
    let mut settings = match std::env::var("CONFIG_FILE") {
        Err(_) => {
            if Path::new("settings.toml").exists() {
                Config::load(Path::new("settings.toml"))?
            } else {
                Config::default()
            }
        }
        Ok(settings_file) => Config::load(Path::new(&settings_file))?,
    };

    settings.apply_overrides(std::env::var_os("ARCHIVE_ROOT").map(PathBuf::from), cli);
    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").expect("empty config should parse");
        assert_eq!(config.bind, "[::]:8080");
        assert_eq!(config.workers, 4);
        assert_eq!(config.chunk_size, 102_400);
        assert!(config.archive_root.ends_with("test_photos"));
        assert_eq!(config.index_path, PathBuf::from("index.html"));
        assert!(!config.enable_logging);
        assert!(!config.enable_delay);
        assert_eq!(config.zip_program, "zip");
    }

    #[test]
    fn test_parse_all_fields() {
        let config = Config::parse(
            r#"
bind = "127.0.0.1:9000"
workers = 2
archive_root = "/srv/photos"
index_path = "/srv/www/index.html"
chunk_size = 4096
enable_logging = true
enable_delay = true
delay_secs = 3
zip_program = "/usr/bin/zip"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.workers, 2);
        assert_eq!(config.archive_root, PathBuf::from("/srv/photos"));
        assert_eq!(config.chunk_size, 4096);

        let options = config.relay_options();
        assert_eq!(options.chunk_size, 4096);
        assert_eq!(options.pacing, Some(Duration::from_secs(3)));
        assert!(options.log_chunks);
        assert_eq!(config.archive_command().program(), "/usr/bin/zip");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = Config::parse("sign_key_path = \"/etc/key\"").unwrap_err();
        assert!(matches!(err, ServiceError::Config(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_pacing_disabled_by_default() {
        let config = Config::default();
        assert_eq!(config.relay_options().pacing, None);
    }

    #[test]
    fn test_cli_overrides_environment_and_file() {
        let mut config = Config::parse("archive_root = \"/from/file\"").unwrap();
        let cli = Cli {
            logging: true,
            delay: true,
            path: Some(PathBuf::from("/from/cli")),
        };
        config.apply_overrides(Some(PathBuf::from("/from/env")), &cli);
        assert_eq!(config.archive_root, PathBuf::from("/from/cli"));
        assert!(config.enable_logging);
        assert!(config.enable_delay);

        let mut config = Config::parse("archive_root = \"/from/file\"").unwrap();
        config.apply_overrides(Some(PathBuf::from("/from/env")), &Cli::default());
        assert_eq!(config.archive_root, PathBuf::from("/from/env"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = Config::parse("workers = 0").unwrap();
        assert!(config.validate().is_err());

        let config = Config::parse("chunk_size = 0").unwrap();
        assert!(config.validate().is_err());

        let config = Config::parse("zip_program = \"  \"").unwrap();
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/zipstream.toml")).unwrap_err();
        assert!(matches!(err, ServiceError::Config(ConfigError::ReadFile { .. })));
    }
}
