//! Integration tests for layered configuration loading

use querykit::ambient::Environment;
use querykit::config::{ConfigLoader, TimeSetting};
use querykit::error::ClientError;
use querykit::gc::GcTime;
use querykit::query::StaleTime;
use querykit::retryer::RetryPolicy;
use querykit::QueryClient;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use crate::integration::with_config_env;

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn test_no_files_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let config = with_config_env(&temp_dir, || ConfigLoader::load(&workspace).unwrap());
    assert_eq!(config, ConfigLoader::defaults());
}

#[test]
fn test_global_file_is_loaded() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    write(
        &temp_dir.path().join("querykit").join("config.toml"),
        r#"
[queries]
stale_time = 5000
retry = 2
"#,
    );

    let config = with_config_env(&temp_dir, || ConfigLoader::load(&workspace).unwrap());
    assert_eq!(config.queries.stale_time, Some(TimeSetting::Millis(5_000)));
    assert_eq!(config.queries.retry, Some(2));
}

#[test]
fn test_workspace_overrides_global() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    write(
        &temp_dir.path().join("querykit").join("config.toml"),
        r#"
[queries]
stale_time = 5000
retry = 2
"#,
    );
    write(
        &workspace.join("config").join("querykit.toml"),
        r#"
[queries]
retry = 0
"#,
    );

    let config = with_config_env(&temp_dir, || ConfigLoader::load(&workspace).unwrap());
    assert_eq!(config.queries.retry, Some(0));
    // Keys the workspace leaves alone keep the global value.
    assert_eq!(config.queries.stale_time, Some(TimeSetting::Millis(5_000)));
}

#[test]
fn test_environment_specific_file() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    write(
        &workspace.join("config").join("querykit.toml"),
        r#"
[client]
environment = "interactive"
"#,
    );
    write(
        &workspace.join("config").join("production.toml"),
        r#"
[client]
environment = "server"
"#,
    );

    let development = with_config_env(&temp_dir, || ConfigLoader::load(&workspace).unwrap());
    assert_eq!(development.client.environment, Environment::Interactive);

    let production = with_config_env(&temp_dir, || {
        std::env::set_var("QUERYKIT_ENV", "production");
        ConfigLoader::load(&workspace).unwrap()
    });
    assert_eq!(production.client.environment, Environment::Server);
}

#[test]
fn test_environment_variables_override_files() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    write(
        &workspace.join("config").join("querykit.toml"),
        r#"
[queries]
retry = 1
"#,
    );

    let config = with_config_env(&temp_dir, || {
        std::env::set_var("QUERYKIT__QUERIES__RETRY", "7");
        std::env::set_var("QUERYKIT__CLIENT__ENVIRONMENT", "server");
        ConfigLoader::load(&workspace).unwrap()
    });
    assert_eq!(config.queries.retry, Some(7));
    assert_eq!(config.client.environment, Environment::Server);
}

#[test]
fn test_malformed_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("workspace");
    write(
        &workspace.join("config").join("querykit.toml"),
        "[queries\nretry = ",
    );

    let result = with_config_env(&temp_dir, || ConfigLoader::load(&workspace));
    assert!(matches!(result, Err(ClientError::ConfigError(_))));
}

#[test]
fn test_client_from_config_applies_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("querykit.toml");
    write(
        &file,
        r#"
[client]
environment = "server"

[queries]
stale_time = "infinite"
gc_time = 60000
retry = 1

[mutations]
retry = 3
"#,
    );

    let config = ConfigLoader::load_from_file(&file).unwrap();
    let client = QueryClient::from_config(&config).unwrap();

    assert_eq!(client.environment(), Environment::Server);
    let defaults = client.get_default_options();
    assert_eq!(defaults.queries.stale_time, Some(StaleTime::Infinite));
    assert_eq!(
        defaults.queries.gc_time,
        Some(GcTime::After(Duration::from_secs(60)))
    );
    assert!(matches!(defaults.queries.retry, Some(RetryPolicy::Count(1))));
    assert!(matches!(defaults.mutations.retry, Some(RetryPolicy::Count(3))));
}

#[test]
fn test_client_from_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("querykit.toml");
    write(
        &file,
        r#"
[queries]
stale_time = "forever"
"#,
    );

    let config = ConfigLoader::load_from_file(&file).unwrap();
    match QueryClient::from_config(&config) {
        Err(ClientError::Validation(message)) => {
            assert!(message.contains("Queries"));
            assert!(message.contains("forever"));
        }
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
}
