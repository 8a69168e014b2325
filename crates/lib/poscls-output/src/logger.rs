use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::Deserialize;

use crate::error::OutputError;

const LOG_PATTERN: &str = "{d(%Y.%m.%d %H:%M:%S)} | {({l}):5.5} | {({f}:{L}):>40.40} | {m}{n}";

#[derive(Deserialize, Debug, Clone)]
pub struct LogSettings {
    pub log_path: String,
    pub log_level: String,
    pub log_file_name: String,
    pub log_overwrite: bool,
}

impl LogSettings {
    pub fn level(&self) -> LevelFilter {
        match self.log_level.to_lowercase().as_str() {
            "trace" => LevelFilter::Trace,
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warn" => LevelFilter::Warn,
            "error" => LevelFilter::Error,
            "off" => LevelFilter::Off,
            _ => LevelFilter::Info,
        }
    }

    /// Resolves the file the log is written to, relative to the directory of the
    /// configuration file. An existing log is either cleared or kept, in which case the new
    /// log file name carries a timestamp.
    pub fn log_file(&self, config_dir: &Path) -> Result<PathBuf, OutputError> {
        let log_dir = config_dir.join(&self.log_path).join("logs");
        fs::create_dir_all(&log_dir).map_err(|source| OutputError::Io {
            path: log_dir.clone(),
            source,
        })?;

        let log_file = log_dir.join(&self.log_file_name);
        if !log_file.exists() {
            return Ok(log_file);
        }

        if self.log_overwrite {
            fs::remove_file(&log_file).map_err(|source| OutputError::Io {
                path: log_file.clone(),
                source,
            })?;
            return Ok(log_file);
        }

        let stem = Path::new(&self.log_file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("poscls");
        let timestamp = Utc::now().format("_%d%m%Y_%H%M%S");
        Ok(log_dir.join(format!("{}{}.log", stem, timestamp)))
    }
}

pub fn setup_logging(level: LevelFilter, log_file: &Path) -> Result<Config, OutputError> {
    let appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_file)
        .map_err(|source| OutputError::Io {
            path: log_file.to_path_buf(),
            source,
        })?;

    Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(level))
        .map_err(|e| OutputError::Logger(e.to_string()))
}

/// Installs the file logger for the whole process and returns the path it writes to.
pub fn initiate_logger(config_dir: &Path, log_settings: &LogSettings) -> Result<PathBuf, OutputError> {
    let log_file = log_settings.log_file(config_dir)?;
    let config = setup_logging(log_settings.level(), &log_file)?;
    log4rs::init_config(config).map_err(|e| OutputError::Logger(e.to_string()))?;
    Ok(log_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(overwrite: bool) -> LogSettings {
        LogSettings {
            log_path: "output".to_string(),
            log_level: "DEBUG".to_string(),
            log_file_name: "poscls.log".to_string(),
            log_overwrite: overwrite,
        }
    }

    #[test]
    fn settings_are_read_from_toml() {
        let log_settings: LogSettings = toml::from_str(
            r#"
            log_path = "output"
            log_level = "warn"
            log_file_name = "run.log"
            log_overwrite = true
            "#,
        )
        .expect("valid log settings");
        assert_eq!(log_settings.level(), LevelFilter::Warn);
        assert!(log_settings.log_overwrite);
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        let mut log_settings = settings(true);
        assert_eq!(log_settings.level(), LevelFilter::Debug);
        log_settings.log_level = "verbose".to_string();
        assert_eq!(log_settings.level(), LevelFilter::Info);
    }

    #[test]
    fn log_directory_is_created_next_to_the_config() {
        let dir = tempfile::tempdir().expect("temporary directory");
        let log_file = settings(true).log_file(dir.path()).expect("log file");
        assert_eq!(log_file, dir.path().join("output").join("logs").join("poscls.log"));
        assert!(dir.path().join("output").join("logs").is_dir());
    }

    #[test]
    fn existing_logs_are_cleared_or_kept() {
        let dir = tempfile::tempdir().expect("temporary directory");
        let first = settings(true).log_file(dir.path()).expect("log file");
        fs::write(&first, "previous run").expect("writable log");

        let kept = settings(false).log_file(dir.path()).expect("log file");
        assert_ne!(kept, first);
        assert!(first.exists());
        let kept_name = kept.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        assert!(kept_name.starts_with("poscls_"));
        assert!(kept_name.ends_with(".log"));

        let cleared = settings(true).log_file(dir.path()).expect("log file");
        assert_eq!(cleared, first);
        assert!(!first.exists());
    }

    #[test]
    fn logging_config_writes_to_the_file() {
        let dir = tempfile::tempdir().expect("temporary directory");
        let log_file = dir.path().join("poscls.log");
        let config = setup_logging(LevelFilter::Info, &log_file).expect("valid config");
        assert_eq!(config.root().level(), LevelFilter::Info);
        assert!(log_file.exists());
    }
}
