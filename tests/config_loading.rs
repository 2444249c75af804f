use std::io::Write;
use std::time::Duration;

use weave_core::config::AppConfig;
use weave_core::error::WeaveError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[scheduler]
tick_interval_ms = 250
default_max_retries = 5

[events]
capacity = 64
publish_timeout_ms = 100

[executor]
default_step_timeout_secs = 30
parallel_execution = true

[lifecycle]
retention_secs = 600
cleanup_interval_secs = 60

[log]
filter = "weave=debug"

[[agents]]
name = "extractor"
kind = "etl"
capabilities = ["csv", "sql"]

[[agents]]
name = "notifier"
capabilities = ["email"]
endpoint = "http://localhost:9000"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.scheduler.tick_interval(), Duration::from_millis(250));
    assert_eq!(config.scheduler.default_max_retries, 5);
    assert_eq!(config.events.capacity, 64);
    assert_eq!(config.events.publish_timeout(), Duration::from_millis(100));
    assert_eq!(
        config.executor.default_step_timeout(),
        Some(Duration::from_secs(30))
    );
    assert_eq!(config.executor.parallel_execution, Some(true));
    assert_eq!(config.lifecycle.retention(), Duration::from_secs(600));
    assert_eq!(config.log.filter, "weave=debug");

    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[0].kind, "etl");
    assert_eq!(config.agents[0].capabilities, vec!["csv", "sql"]);
    assert_eq!(config.agents[1].kind, "worker");
    assert_eq!(
        config.agents[1].endpoint.as_deref(),
        Some("http://localhost:9000")
    );
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
    assert_eq!(config.scheduler.default_max_retries, 3);
    assert_eq!(config.events.capacity, 256);
    assert!(config.executor.default_step_timeout().is_none());
    assert!(config.agents.is_empty());
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, WeaveError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_config_rejected() {
    let zero_capacity = "[events]\ncapacity = 0\n";
    assert!(matches!(
        AppConfig::from_toml(zero_capacity),
        Err(WeaveError::Config(_))
    ));

    let duplicate_agents = r#"
[[agents]]
name = "a"

[[agents]]
name = "a"
"#;
    assert!(matches!(
        AppConfig::from_toml(duplicate_agents),
        Err(WeaveError::Config(_))
    ));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::from_toml("[[agents]]\nname = \"solo\"\n").expect("parse");
    let rendered = toml::to_string_pretty(&config).expect("render");
    let reparsed = AppConfig::from_toml(&rendered).expect("reparse");
    assert_eq!(reparsed.agents[0].name, "solo");
    assert_eq!(reparsed.events.capacity, config.events.capacity);
}
