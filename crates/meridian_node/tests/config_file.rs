//! Configuration loading from disk.

mod common;

use std::io::Write;

use meridian_node::config::Config;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn config_round_trips_through_a_file() {
    let file = common::config_file();
    let json = serde_json::to_string_pretty(&file).expect("serialize");
    let on_disk = write_config(&json);

    let config = Config::from_file(on_disk.path(), "remote:2020").expect("load");
    assert_eq!(config.num_replicas(), 2);
    assert_eq!(config.num_partitions(), 1);
    assert_eq!(config.local_replica(), 1);
    assert_eq!(config.local_machine_id(), 1);
}

#[test]
fn malformed_documents_are_rejected() {
    let on_disk = write_config("{ not json");
    assert!(Config::from_file(on_disk.path(), "local:2020").is_err());
}

#[test]
fn unknown_local_address_is_rejected() {
    let file = common::config_file();
    let json = serde_json::to_string(&file).expect("serialize");
    let on_disk = write_config(&json);
    assert!(Config::from_file(on_disk.path(), "elsewhere:9").is_err());
}

#[test]
fn missing_files_are_reported() {
    assert!(Config::from_file("/nonexistent/meridian.json", "local:2020").is_err());
}
