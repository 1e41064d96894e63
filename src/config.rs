//! Scan tuning.
//!
//! Every field has a default, so a config file only names what it changes:
//!
//! ```json
//! { "workers": 4, "page_size": 16384 }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::DEFAULT_WRITE_CHUNK_SIZE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Worker threads.  Defaults to the available parallelism.
    pub workers:              usize,
    /// How long a shutdown waits for workers before giving up.
    pub stop_timeout_ms:      u64,
    /// Read-ahead page of each task's reader.
    pub page_size:            usize,
    /// Bytes buffered before each decode-cache write.
    pub write_chunk_size:     usize,
    /// Minimum gap between periodic progress reports.
    pub progress_interval_ms: u64,
    /// Where cache files go; the system temp directory if unset.
    pub cache_dir:            Option<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers:              thread::available_parallelism().map_or(1, |n| n.get()),
            stop_timeout_ms:      5_000,
            page_size:            64 * 1024,
            write_chunk_size:     DEFAULT_WRITE_CHUNK_SIZE,
            progress_interval_ms: 700,
            cache_dir:            None,
        }
    }
}

impl ScanConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.page_size == 0 || self.write_chunk_size == 0 {
            return Err(ConfigError::Invalid("page_size and write_chunk_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_files_keep_defaults() {
        let c = ScanConfig::from_json(r#"{ "workers": 3 }"#).unwrap();
        assert_eq!(c.workers, 3);
        assert_eq!(c.page_size, 64 * 1024);
        assert_eq!(c.progress_interval(), Duration::from_millis(700));
        assert_eq!(c.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_unknown_and_invalid_fields() {
        assert!(matches!(ScanConfig::from_json(r#"{ "wrokers": 3 }"#), Err(ConfigError::Parse(_))));
        assert!(matches!(ScanConfig::from_json(r#"{ "workers": 0 }"#), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "page_size": 512, "cache_dir": "/tmp" }}"#).unwrap();
        let c = ScanConfig::load(f.path()).unwrap();
        assert_eq!(c.page_size, 512);
        assert_eq!(c.cache_dir, Some(PathBuf::from("/tmp")));

        let missing = ScanConfig::load(f.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
