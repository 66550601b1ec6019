//! Configuration loading helpers.
//!
//! A TOML file provides optional `[table]` and `[heap]` sections; environment
//! variables of the form `LINSTORE__<section>__<field>` override single
//! fields. Anything left unset keeps the runtime defaults.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::heap::HeapConfig;
use crate::table::HashTableConfig;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "LINSTORE_CONFIG";

const OVERRIDE_PREFIX: &str = "LINSTORE__";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinstoreConfig {
    /// Hash table configuration.
    pub table: Option<TableConfigSpec>,
    /// Overflow heap store configuration.
    pub heap: Option<HeapConfigSpec>,
}

impl LinstoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `LINSTORE_CONFIG` env var (if set),
    /// then apply `LINSTORE__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_ENV).ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(OVERRIDE_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim();

            match parts.as_slice() {
                ["table", "initial_buckets"] => {
                    self.table_mut().initial_buckets = Some(parse_value(&key, value)?);
                }
                ["table", "split_load_factor"] => {
                    self.table_mut().split_load_factor = Some(parse_value(&key, value)?);
                }
                ["heap", "initial_pages"] => {
                    self.heap_mut().initial_pages = Some(parse_value(&key, value)?);
                }
                ["heap", "growth_pages"] => {
                    self.heap_mut().growth_pages = Some(parse_value(&key, value)?);
                }
                ["heap", "growable"] => {
                    self.heap_mut().growable = Some(parse_value(&key, value)?);
                }
                ["heap", "max_pages"] => {
                    self.heap_mut().max_pages = Some(parse_value(&key, value)?);
                }
                ["heap", "free_space_threshold"] => {
                    self.heap_mut().free_space_threshold = Some(parse_value(&key, value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a `HeapConfig` using defaults plus overrides.
    pub fn to_heap_config(&self) -> HeapConfig {
        let mut config = HeapConfig::default();
        if let Some(heap) = &self.heap {
            config = heap.apply_to(config);
        }
        config
    }

    /// Build a validated `HashTableConfig` using defaults plus overrides.
    pub fn to_hash_table_config(&self) -> Result<HashTableConfig, ConfigError> {
        let mut config = HashTableConfig::default().with_overflow(self.to_heap_config());
        if let Some(table) = &self.table {
            table.apply_to(&mut config);
        }

        if config.validate().is_err() {
            let (key, value) = if config.initial_buckets == 0
                || config.initial_buckets > HashTableConfig::MAX_INITIAL_BUCKETS
            {
                ("table.initial_buckets", config.initial_buckets.to_string())
            } else {
                ("table.split_load_factor", config.split_load_factor.to_string())
            };
            return Err(ConfigError::InvalidValue {
                key: key.into(),
                value,
            });
        }
        Ok(config)
    }

    fn table_mut(&mut self) -> &mut TableConfigSpec {
        self.table.get_or_insert_with(TableConfigSpec::default)
    }

    fn heap_mut(&mut self) -> &mut HeapConfigSpec {
        self.heap.get_or_insert_with(HeapConfigSpec::default)
    }
}

/// Hash table configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfigSpec {
    /// Number of primary buckets at creation.
    pub initial_buckets: Option<u64>,
    /// Load factor above which a bucket is split.
    pub split_load_factor: Option<f64>,
}

impl TableConfigSpec {
    fn apply_to(&self, config: &mut HashTableConfig) {
        if let Some(value) = self.initial_buckets {
            config.initial_buckets = value;
        }
        if let Some(value) = self.split_load_factor {
            config.split_load_factor = value;
        }
    }
}

/// Heap store configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeapConfigSpec {
    /// Pages allocated at creation.
    pub initial_pages: Option<usize>,
    /// Pages added per growth step.
    pub growth_pages: Option<usize>,
    /// Whether the store may grow.
    pub growable: Option<bool>,
    /// Page budget; reaching it stops growth.
    pub max_pages: Option<usize>,
    /// Fraction of a page that must be free for it to take new tuples.
    pub free_space_threshold: Option<f64>,
}

impl HeapConfigSpec {
    fn apply_to(&self, mut config: HeapConfig) -> HeapConfig {
        if let Some(value) = self.initial_pages {
            config = config.with_initial_pages(value);
        }
        if let Some(value) = self.growth_pages {
            config = config.with_growth_pages(value);
        }
        if let Some(value) = self.growable {
            config = config.with_growable(value);
        }
        if let Some(value) = self.max_pages {
            config = config.with_max_pages(Some(value));
        }
        if let Some(value) = self.free_space_threshold {
            config = config.with_free_space_threshold(value);
        }
        config
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_env_overrides_table_and_heap() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("LINSTORE__table__initial_buckets", "128");
        env::set_var("LINSTORE__heap__growable", "false");
        env::set_var("LINSTORE__HEAP__GROWTH_PAGES", " 4 ");

        let mut config = LinstoreConfig::default();
        let result = config.apply_env_overrides();

        env::remove_var("LINSTORE__table__initial_buckets");
        env::remove_var("LINSTORE__heap__growable");
        env::remove_var("LINSTORE__HEAP__GROWTH_PAGES");
        result.unwrap();

        assert_eq!(config.table.as_ref().unwrap().initial_buckets, Some(128));
        let heap = config.heap.as_ref().unwrap();
        assert_eq!(heap.growable, Some(false));
        assert_eq!(heap.growth_pages, Some(4));

        let table = config.to_hash_table_config().unwrap();
        assert_eq!(table.initial_buckets, 128);
        assert!(!table.overflow.growable);
        assert_eq!(table.overflow.growth_pages, 4);
    }

    #[test]
    fn test_unknown_and_invalid_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("LINSTORE__table__bogus", "1");
        let err = LinstoreConfig::default().apply_env_overrides().unwrap_err();
        env::remove_var("LINSTORE__table__bogus");
        assert!(matches!(err, ConfigError::UnknownKey(key) if key == "LINSTORE__table__bogus"));

        env::set_var("LINSTORE__heap__max_pages", "lots");
        let err = LinstoreConfig::default().apply_env_overrides().unwrap_err();
        env::remove_var("LINSTORE__heap__max_pages");
        assert!(matches!(err, ConfigError::InvalidValue { value, .. } if value == "lots"));
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[table]\ninitial_buckets = 16\nsplit_load_factor = 0.5\n\n[heap]\nmax_pages = 32\nfree_space_threshold = 0.3"
        )
        .unwrap();

        let config = LinstoreConfig::load_from_path(file.path()).unwrap();
        let table = config.to_hash_table_config().unwrap();
        assert_eq!(table.initial_buckets, 16);
        assert_eq!(table.split_load_factor, 0.5);
        assert_eq!(table.overflow.max_pages, Some(32));
        assert!((table.overflow.free_space_threshold - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[table]\nbuckets = 16").unwrap();
        assert!(matches!(
            LinstoreConfig::load_from_path(file.path()),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            LinstoreConfig::load_from_path(file.path().with_extension("missing")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_invalid_table_config() {
        let config = LinstoreConfig {
            table: Some(TableConfigSpec {
                initial_buckets: Some(0),
                split_load_factor: None,
            }),
            heap: None,
        };
        assert!(matches!(
            config.to_hash_table_config(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "table.initial_buckets"
        ));

        let config = LinstoreConfig {
            table: Some(TableConfigSpec {
                initial_buckets: None,
                split_load_factor: Some(-2.0),
            }),
            heap: None,
        };
        assert!(matches!(
            config.to_hash_table_config(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "table.split_load_factor"
        ));
    }

    #[test]
    fn test_defaults_without_sections() {
        let config = LinstoreConfig::default();
        assert_eq!(config.to_hash_table_config().unwrap(), HashTableConfig::default());
        assert_eq!(config.to_heap_config(), HeapConfig::default());
    }
}
