//! Configuration file loading

use std::io::Write;

use linstore::config::{ConfigError, LinstoreConfig};
use linstore::status::Status;
use linstore::table::HashTable;

#[test]
fn test_table_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[table]
initial_buckets = 8
split_load_factor = 0.5

[heap]
growth_pages = 2
max_pages = 4
"#
    )
    .unwrap();

    let config = LinstoreConfig::load_from_path(file.path()).unwrap();
    let table_config = config.to_hash_table_config().unwrap();
    assert_eq!(table_config.overflow.growth_pages, 2);

    let table = HashTable::new(table_config).unwrap();
    assert_eq!(table.num_buckets(), 8);
    assert_eq!(table.insert(b"key", b"value"), Status::Ok);
    assert_eq!(table.overflow_store().config().max_pages, Some(4));
}

#[test]
fn test_invalid_toml_is_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[table]\ninitial_buckets = \"many\"\n").unwrap();
    let err = LinstoreConfig::load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
    assert!(err.to_string().starts_with("toml parse error"));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = LinstoreConfig::load_from_path(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
