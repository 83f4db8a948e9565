use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::ingestion::http::validate_log_url;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<TelemetryConfig, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string)
}

/// Parse a YAML document: expand `$env{VAR}` references, deserialize,
/// expand `~` in paths and validate.
pub fn parse_config(yaml: &str) -> Result<TelemetryConfig, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: TelemetryConfig = serde_yaml::from_str(&yaml_string)?;

    if !config.storage.is_in_memory() {
        config.storage.path = expand_tilde(&config.storage.path);
    }

    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             Set them or replace the references in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn validate_config(config: &TelemetryConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.app_secret.trim().is_empty() {
        errors.push("app_secret cannot be empty".to_string());
    }

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path cannot be empty".to_string());
    }

    if let Err(e) = validate_log_url(&config.ingestion.log_url) {
        errors.push(format!("ingestion.log_url: {}", e));
    }
    if config.ingestion.max_concurrent_requests == 0 {
        errors.push("ingestion.max_concurrent_requests must be at least 1".to_string());
    }

    let mut names: Vec<&String> = config.channels.keys().collect();
    names.sort();
    for name in names {
        validate_channel(name, &config.channels[name], &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_channel(name: &str, channel: &ChannelConfig, errors: &mut Vec<String>) {
    if name.trim().is_empty() {
        errors.push("channel names cannot be empty".to_string());
        return;
    }

    let prefix = format!("channel '{}'", name);
    if channel.max_logs_per_batch == 0 {
        errors.push(format!("{}: max_logs_per_batch must be at least 1", prefix));
    }
    if channel.max_parallel_batches == 0 {
        errors.push(format!("{}: max_parallel_batches must be at least 1", prefix));
    }
    if channel.batch_interval.is_zero() {
        errors.push(format!("{}: batch_interval must be positive", prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MINIMAL: &str = r#"
app_secret: "secret"
storage:
  path: ":memory:"
ingestion:
  log_url: "https://in.example.com"
channels:
  analytics: {}
"#;

    #[test]
    fn test_defaults_apply() {
        let config = parse_config(MINIMAL).unwrap();
        assert!(config.storage.is_in_memory());
        assert_eq!(config.ingestion.timeout, Duration::from_secs(30));
        assert_eq!(config.ingestion.max_concurrent_requests, 3);
        assert_eq!(config.channels["analytics"], ChannelConfig::default());
    }

    #[test]
    fn test_humantime_durations() {
        let yaml = r#"
app_secret: "secret"
storage:
  path: ":memory:"
ingestion:
  log_url: "https://in.example.com"
  timeout: 5s
channels:
  crashes:
    max_logs_per_batch: 1
    batch_interval: 500ms
    retry_backoff: 2m
"#;
        let config = parse_config(yaml).unwrap();
        let crashes = &config.channels["crashes"];
        assert_eq!(config.ingestion.timeout, Duration::from_secs(5));
        assert_eq!(crashes.max_logs_per_batch, 1);
        assert_eq!(crashes.batch_interval, Duration::from_millis(500));
        assert_eq!(crashes.retry_backoff, Duration::from_secs(120));
        assert_eq!(crashes.max_parallel_batches, 3);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
app_secret: ""
storage:
  path: ":memory:"
ingestion:
  log_url: "ftp://in.example.com"
channels:
  analytics:
    max_logs_per_batch: 0
    max_parallel_batches: 0
"#;
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => {
                assert_eq!(errors.len(), 4, "{:?}", errors);
                assert!(errors.iter().any(|e| e.contains("app_secret")));
                assert!(errors.iter().any(|e| e.contains("log_url")));
                assert!(errors.iter().any(|e| e.contains("max_logs_per_batch")));
                assert!(errors.iter().any(|e| e.contains("max_parallel_batches")));
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpanded_variable_is_reported() {
        let yaml = MINIMAL.replace("\"secret\"", "\"$env{TELECHANNEL_UNSET_SECRET}\"");
        match parse_config(&yaml) {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("TELECHANNEL_UNSET_SECRET"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_env_variable_expansion() {
        std::env::set_var("TELECHANNEL_TEST_SECRET", "from-env");
        let yaml = MINIMAL.replace("\"secret\"", "\"$env{TELECHANNEL_TEST_SECRET}\"");
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.app_secret, "from-env");
        std::env::remove_var("TELECHANNEL_TEST_SECRET");
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            parse_config("app_secret: [unterminated"),
            Err(ConfigError::YamlParse(_))
        ));
    }
}
