//! Integration tests for `platval config` command.
//!
//! Tests config validation and display functionality with real TOML files.

use std::fs;
use std::path::PathBuf;

use platval_core::config::PlatvalConfig;
use platval_core::OsType;
use tempfile::TempDir;

fn write_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).expect("should write config");
    path
}

#[tokio::test]
async fn test_config_validate_valid_toml() {
    // Given: A valid config file
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(
        &temp_dir,
        "platval.toml",
        r#"
[general]
log_level = "info"
log_format = "json"

[sut]
host = "10.20.30.40"
os = "linux"
"#,
    );

    // When: Loading the config
    let result = PlatvalConfig::load(&config_path).await;

    // Then: Should succeed
    assert!(result.is_ok(), "valid config should load successfully");
}

#[tokio::test]
async fn test_config_validate_malformed_toml() {
    // Given: A malformed TOML file
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(&temp_dir, "bad.toml", "[general\nlog_level = \"info\"\n");

    // When: Loading the config
    let result = PlatvalConfig::load(&config_path).await;

    // Then: Should fail
    assert!(result.is_err(), "malformed TOML should fail to load");
}

#[tokio::test]
async fn test_config_validate_missing_file() {
    // Given: A nonexistent file path
    let config_path = PathBuf::from("/nonexistent/platval.toml");

    // When: Loading the config
    let err = PlatvalConfig::load(&config_path).await.unwrap_err();

    // Then: Should fail naming the file
    assert!(err.to_string().contains("/nonexistent/platval.toml"));
}

#[tokio::test]
async fn test_config_validate_empty_file() {
    // Given: An empty config file
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(&temp_dir, "empty.toml", "");

    // When: Loading the config
    let config = PlatvalConfig::from_file(&config_path)
        .await
        .expect("empty config should use defaults");

    // Then: Every section falls back to its default
    assert_eq!(config.sut.host, "localhost");
    assert_eq!(config.network.ping_count, 4);
    assert!(config.sut2.is_none());
    assert!(!config.bmc.is_configured());
}

#[tokio::test]
async fn test_config_with_second_sut_and_bmc() {
    // Given: A lab config with a peer SUT and a BMC
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(
        &temp_dir,
        "lab3.toml",
        r#"
[sut]
host = "10.20.30.40"
os = "windows"

[sut2]
host = "10.20.30.41"
user = "admin"

[bmc]
url = "https://10.20.30.50"
password = "0penBmc"

[timeouts]
staging_secs = 2400
"#,
    );

    // When: Loading the config
    let config = PlatvalConfig::from_file(&config_path)
        .await
        .expect("lab config should load");

    // Then: Both SUTs and the BMC are populated
    assert_eq!(config.sut.os, OsType::Windows);
    let sut2 = config.sut2.as_ref().expect("sut2 present");
    assert_eq!(sut2.host, "10.20.30.41");
    assert_eq!(sut2.user, "admin");
    assert_eq!(sut2.os, OsType::Linux);
    assert!(config.bmc.is_configured());
    assert_eq!(config.timeouts.staging_secs, 2400);
    assert!(!format!("{:?}", config.bmc.redacted()).contains("0penBmc"));
}

#[tokio::test]
async fn test_config_invalid_log_format() {
    // Given: An unknown log format
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(
        &temp_dir,
        "platval.toml",
        "[general]\nlog_format = \"syslog\"\n",
    );

    // When: Loading the config
    let err = PlatvalConfig::from_file(&config_path).await.unwrap_err();

    // Then: Validation names the field
    assert!(err.to_string().contains("general.log_format"));
}

#[tokio::test]
async fn test_config_bmc_url_needs_scheme() {
    // Given: A BMC address without http(s)://
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(&temp_dir, "platval.toml", "[bmc]\nurl = \"10.20.30.50\"\n");

    // When: Loading the config
    let err = PlatvalConfig::from_file(&config_path).await.unwrap_err();

    // Then: Should fail on bmc.url
    assert!(err.to_string().contains("bmc.url"));
}

#[tokio::test]
async fn test_config_bios_write_command_needs_placeholder() {
    // Given: A BIOS write command that never receives the knob list
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(
        &temp_dir,
        "platval.toml",
        "[bios]\nwrite_command = \"xmlcli setknobs\"\n",
    );

    // When: Loading the config
    let err = PlatvalConfig::from_file(&config_path).await.unwrap_err();

    // Then: Should fail on bios.write_command
    assert!(err.to_string().contains("bios.write_command"));
}

#[tokio::test]
async fn test_shipped_example_config_is_valid() {
    // Given: The example config at the repository root
    let config_path =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../platval.toml.example");

    // When: Loading it without env overrides
    let config = PlatvalConfig::from_file(&config_path)
        .await
        .expect("example config should load");

    // Then: It matches the built-in defaults
    let defaults = PlatvalConfig::default();
    assert_eq!(config.sut.host, defaults.sut.host);
    assert_eq!(config.timeouts.staging_secs, defaults.timeouts.staging_secs);
    assert_eq!(config.bios.write_command, defaults.bios.write_command);
}

#[tokio::test]
async fn test_config_bios_read_command_needs_placeholder() {
    // Given: A BIOS read command that never receives the knob names
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_path = write_config(
        &temp_dir,
        "platval.toml",
        "[bios]\nread_command = \"xmlcli readknobs\"\n",
    );

    // When: Loading the config
    let err = PlatvalConfig::from_file(&config_path).await.unwrap_err();

    // Then: Should fail on bios.read_command
    assert!(err.to_string().contains("bios.read_command"));
}
