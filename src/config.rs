//! Index options and their TOML loader.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::cache::CacheOptions;
use crate::primitives::pager::{PagerOptions, Synchronous};
use crate::types::page;

/// Tunables of an index. Every field has a default, so a TOML file only
/// needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexOptions {
    /// Page size for new index files.
    pub page_size: u32,
    /// Pages kept in memory.
    pub cache_pages: usize,
    /// Share of the cache reserved for pages seen once.
    pub probation_percent: u8,
    /// When the write-ahead log is synced.
    pub synchronous: Synchronous,
    /// Check page checksums on load.
    pub verify_checksums: bool,
    /// How long the worker waits for an operation before idle housekeeping.
    pub dequeue_timeout_ms: u64,
    /// Checkpoint after this many commits; 0 leaves it to idle time.
    pub checkpoint_after_commits: u32,
    /// Log rebuilds caused by corruption as errors.
    pub report_rebuild_as_error: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            probation_percent: 25,
            synchronous: Synchronous::Full,
            verify_checksums: true,
            dequeue_timeout_ms: 250,
            checkpoint_after_commits: 64,
            report_rebuild_as_error: true,
        }
    }
}

impl IndexOptions {
    /// Parses and validates options from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Rejects values the store cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < page::MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: format!(
                    "{} is not a power of two of at least {}",
                    self.page_size,
                    page::MIN_PAGE_SIZE
                ),
            });
        }
        if self.cache_pages < 4 {
            return Err(ConfigError::Invalid {
                field: "cache_pages",
                reason: format!("{} is below the minimum of 4", self.cache_pages),
            });
        }
        if self.probation_percent == 0 || self.probation_percent >= 100 {
            return Err(ConfigError::Invalid {
                field: "probation_percent",
                reason: format!("{} must lie in 1..=99", self.probation_percent),
            });
        }
        Ok(())
    }

    /// `dequeue_timeout_ms` as a duration, at least one millisecond.
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms.max(1))
    }

    /// Pager settings derived from these options.
    pub fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            cache: CacheOptions {
                capacity: self.cache_pages,
                probation_percent: self.probation_percent,
            },
            synchronous: self.synchronous,
            verify_checksums: self.verify_checksums,
        }
    }
}

/// Errors raised while loading or validating [`IndexOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The options file could not be read.
    #[error("failed to read index config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The options are not valid TOML for [`IndexOptions`].
    #[error("failed to parse index config{}: {source}", display_path(.path))]
    Parse {
        /// File the text came from, if any.
        path: Option<PathBuf>,
        /// Parser error.
        source: toml::de::Error,
    },
    /// The options could not be rendered as TOML.
    #[error("failed to serialize index config: {source}")]
    Serialize {
        /// Serializer error.
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" {}", p.display()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let options = IndexOptions::from_toml_str(
            r#"
            cache_pages = 64
            synchronous = "normal"
            "#,
        )
        .unwrap();
        assert_eq!(options.cache_pages, 64);
        assert_eq!(options.synchronous, Synchronous::Normal);
        assert_eq!(options.page_size, 4096);
        assert_eq!(options.checkpoint_after_commits, 64);
        assert_eq!(options.pager_options().cache.capacity, 64);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            IndexOptions::from_toml_str("page_size = 1000"),
            Err(ConfigError::Invalid { field: "page_size", .. })
        ));
        assert!(matches!(
            IndexOptions::from_toml_str("synchronous = \"sometimes\""),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            IndexOptions::from_toml_str("colour = 1"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn toml_roundtrip_and_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refindex.toml");
        let options = IndexOptions {
            dequeue_timeout_ms: 10,
            ..IndexOptions::default()
        };
        fs::write(&path, options.to_toml_string().unwrap()).unwrap();
        assert_eq!(IndexOptions::load(&path).unwrap(), options);
        assert!(matches!(
            IndexOptions::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
