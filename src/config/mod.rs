pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load_config, parse_config, ConfigError};
pub use types::{ChannelConfig, IngestionConfig, StorageConfig, TelemetryConfig};

/// Matches `$env{VAR_NAME}` where VAR_NAME starts with a letter or underscore.
pub(crate) fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    env_var_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            let whole = caps.get(0).map_or("", |m| m.as_str());
            match caps.get(1) {
                Some(name) => std::env::var(name.as_str()).unwrap_or_else(|_| whole.to_string()),
                None => whole.to_string(),
            }
        })
        .to_string()
}

/// Expands tilde (~) in paths to the user's home directory.
/// Returns the path unchanged if it doesn't start with tilde or the home
/// directory cannot be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_multiple() {
        std::env::set_var("TELECHANNEL_VAR1", "value1");
        std::env::set_var("TELECHANNEL_VAR2", "value2");
        let result = expand_env_vars("$env{TELECHANNEL_VAR1}/middle/$env{TELECHANNEL_VAR2}");
        assert_eq!(result, "value1/middle/value2");
        std::env::remove_var("TELECHANNEL_VAR1");
        std::env::remove_var("TELECHANNEL_VAR2");
    }

    #[test]
    fn test_expand_env_vars_unset() {
        let result = expand_env_vars("https://$env{TELECHANNEL_NONEXISTENT}/logs");
        // Unset variables are left unchanged
        assert_eq!(result, "https://$env{TELECHANNEL_NONEXISTENT}/logs");
    }

    #[test]
    fn test_expand_env_vars_ignores_plain_braces() {
        let result = expand_env_vars("${not_env}");
        assert_eq!(result, "${not_env}");
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/telemetry/logs.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("telemetry/logs.db"));
        }
    }

    #[test]
    fn test_expand_tilde_no_expansion() {
        assert_eq!(
            expand_tilde(Path::new("/var/lib/telemetry.db")),
            Path::new("/var/lib/telemetry.db")
        );
        assert_eq!(expand_tilde(Path::new("relative.db")), Path::new("relative.db"));
    }
}
