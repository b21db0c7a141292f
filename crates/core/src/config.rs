use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub webhook: WebhookConfig,
    pub rollout: RolloutConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Outbound notification endpoint. Disabled by default; events are dropped
/// until an endpoint is configured.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RolloutConfig {
    pub poll_interval_secs: u64,
    pub bake_time_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://rcp.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            webhook: WebhookConfig { enabled: false, url: None, timeout_secs: 10 },
            rollout: RolloutConfig { poll_interval_secs: 30, bake_time_secs: 3600 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    /// Layered load: defaults, then the TOML file patch (with `${ENV}`
    /// interpolation), then `RCP_*` environment overrides, then
    /// programmatic overrides; validated last.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("rcp.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(enabled) = webhook.enabled {
                self.webhook.enabled = enabled;
            }
            if let Some(url) = webhook.url {
                self.webhook.url = Some(url);
            }
            if let Some(timeout_secs) = webhook.timeout_secs {
                self.webhook.timeout_secs = timeout_secs;
            }
        }

        if let Some(rollout) = patch.rollout {
            if let Some(poll_interval_secs) = rollout.poll_interval_secs {
                self.rollout.poll_interval_secs = poll_interval_secs;
            }
            if let Some(bake_time_secs) = rollout.bake_time_secs {
                self.rollout.bake_time_secs = bake_time_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("RCP_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("RCP_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("RCP_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RCP_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("RCP_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RCP_WEBHOOK_ENABLED") {
            self.webhook.enabled = parse_bool("RCP_WEBHOOK_ENABLED", &value)?;
        }
        if let Some(value) = read_env("RCP_WEBHOOK_URL") {
            self.webhook.url = Some(value);
        }
        if let Some(value) = read_env("RCP_WEBHOOK_TIMEOUT_SECS") {
            self.webhook.timeout_secs = parse_u64("RCP_WEBHOOK_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RCP_ROLLOUT_POLL_INTERVAL_SECS") {
            self.rollout.poll_interval_secs =
                parse_u64("RCP_ROLLOUT_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("RCP_ROLLOUT_BAKE_TIME_SECS") {
            self.rollout.bake_time_secs = parse_u64("RCP_ROLLOUT_BAKE_TIME_SECS", &value)?;
        }

        let log_level = read_env("RCP_LOGGING_LEVEL").or_else(|| read_env("RCP_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("RCP_LOGGING_FORMAT").or_else(|| read_env("RCP_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(webhook_url) = overrides.webhook_url {
            self.webhook.url = Some(webhook_url);
        }
        if let Some(webhook_enabled) = overrides.webhook_enabled {
            self.webhook.enabled = webhook_enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_webhook(&self.webhook)?;
        validate_rollout(&self.rollout)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("rcp.toml"), PathBuf::from("config/rcp.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), ConfigError> {
    if webhook.enabled {
        let url = webhook.url.as_deref().map(str::trim).unwrap_or("");
        if url.is_empty() {
            return Err(ConfigError::Validation(
                "webhook.enabled is true but webhook.url is not configured".to_string(),
            ));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "webhook.url must start with http:// or https://".to_string(),
            ));
        }
    }

    if webhook.timeout_secs == 0 || webhook.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "webhook.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    Ok(())
}

fn validate_rollout(rollout: &RolloutConfig) -> Result<(), ConfigError> {
    if rollout.poll_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "rollout.poll_interval_secs must be greater than zero".to_string(),
        ));
    }

    if rollout.bake_time_secs < rollout.poll_interval_secs {
        return Err(ConfigError::Validation(
            "rollout.bake_time_secs must be at least rollout.poll_interval_secs".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    webhook: Option<WebhookPatch>,
    rollout: Option<RolloutPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    enabled: Option<bool>,
    url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RolloutPatch {
    poll_interval_secs: Option<u64>,
    bake_time_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_RCP_WEBHOOK_URL", "https://hooks.example.com/rcp");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("rcp.toml");
            fs::write(
                &path,
                r#"
[webhook]
enabled = true
url = "${TEST_RCP_WEBHOOK_URL}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.webhook.url.as_deref() == Some("https://hooks.example.com/rcp"),
                "webhook url should be loaded from environment",
            )?;
            ensure(config.webhook.enabled, "webhook should be enabled from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_RCP_WEBHOOK_URL"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RCP_LOG_LEVEL", "warn");
        env::set_var("RCP_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["RCP_LOG_LEVEL", "RCP_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RCP_DATABASE_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("rcp.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path.clone()),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-env.db",
                "env database url should win over file and defaults",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                config.database.url == "sqlite://from-override.db",
                "programmatic override should win over everything",
            )?;
            Ok(())
        })();

        clear_vars(&["RCP_DATABASE_URL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RCP_WEBHOOK_ENABLED", "true");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("webhook.url")
            );
            ensure(has_message, "validation failure should mention webhook.url")
        })();

        clear_vars(&["RCP_WEBHOOK_ENABLED"]);
        result
    }

    #[test]
    fn rollout_bake_must_cover_at_least_one_poll() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RCP_ROLLOUT_POLL_INTERVAL_SECS", "60");
        env::set_var("RCP_ROLLOUT_BAKE_TIME_SECS", "30");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::Validation(ref message) if message.contains("bake_time")),
                "validation failure should mention bake_time",
            )
        })();

        clear_vars(&["RCP_ROLLOUT_POLL_INTERVAL_SECS", "RCP_ROLLOUT_BAKE_TIME_SECS"]);
        result
    }

    #[test]
    fn missing_required_file_is_reported() {
        let outcome = AppConfig::load(LoadOptions {
            config_path: Some("does-not-exist.toml".into()),
            require_file: true,
            ..LoadOptions::default()
        });
        assert!(matches!(outcome, Err(ConfigError::MissingConfigFile(_))));
    }
}
