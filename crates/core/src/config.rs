use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub execution: ExecutionConfig,
    pub compliance: ComplianceConfig,
    pub services: ServicesConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    /// Upper bound on a single collaborator call made for a step.
    pub step_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ComplianceConfig {
    pub horizon_years: u32,
    /// Upper bound for a requested horizon or extension.
    pub max_horizon_years: u32,
    pub upcoming_window_days: u32,
    /// Zero disables the background sweep.
    pub sweep_interval_secs: u64,
    pub auto_extend: bool,
}

#[derive(Clone, Debug)]
pub struct ServicesConfig {
    pub registration_base_url: Option<String>,
    pub registration_api_key: Option<SecretString>,
    pub request_timeout_secs: u64,
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
    pub log_format: Option<LogFormat>,
    pub server_port: Option<u16>,
    pub step_timeout_secs: Option<u64>,
    pub registration_base_url: Option<String>,
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
                url: "sqlite://charter.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            execution: ExecutionConfig { step_timeout_secs: 30 },
            compliance: ComplianceConfig {
                horizon_years: 3,
                max_horizon_years: 50,
                upcoming_window_days: 30,
                sweep_interval_secs: 3600,
                auto_extend: true,
            },
            services: ServicesConfig {
                registration_base_url: None,
                registration_api_key: None,
                request_timeout_secs: 20,
            },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
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
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("charter.toml"));
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

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
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

        if let Some(execution) = patch.execution {
            if let Some(step_timeout_secs) = execution.step_timeout_secs {
                self.execution.step_timeout_secs = step_timeout_secs;
            }
        }

        if let Some(compliance) = patch.compliance {
            if let Some(horizon_years) = compliance.horizon_years {
                self.compliance.horizon_years = horizon_years;
            }
            if let Some(max_horizon_years) = compliance.max_horizon_years {
                self.compliance.max_horizon_years = max_horizon_years;
            }
            if let Some(upcoming_window_days) = compliance.upcoming_window_days {
                self.compliance.upcoming_window_days = upcoming_window_days;
            }
            if let Some(sweep_interval_secs) = compliance.sweep_interval_secs {
                self.compliance.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(auto_extend) = compliance.auto_extend {
                self.compliance.auto_extend = auto_extend;
            }
        }

        if let Some(services) = patch.services {
            if let Some(base_url) = services.registration_base_url {
                self.services.registration_base_url = Some(base_url);
            }
            if let Some(api_key) = services.registration_api_key {
                self.services.registration_api_key = Some(secret_value(api_key));
            }
            if let Some(request_timeout_secs) = services.request_timeout_secs {
                self.services.request_timeout_secs = request_timeout_secs;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CHARTER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CHARTER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CHARTER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CHARTER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CHARTER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CHARTER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CHARTER_SERVER_PORT") {
            self.server.port = parse_u16("CHARTER_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CHARTER_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CHARTER_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("CHARTER_LOGGING_LEVEL").or_else(|| read_env("CHARTER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CHARTER_LOGGING_FORMAT").or_else(|| read_env("CHARTER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("CHARTER_EXECUTION_STEP_TIMEOUT_SECS") {
            self.execution.step_timeout_secs =
                parse_u64("CHARTER_EXECUTION_STEP_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CHARTER_COMPLIANCE_HORIZON_YEARS") {
            self.compliance.horizon_years = parse_u32("CHARTER_COMPLIANCE_HORIZON_YEARS", &value)?;
        }
        if let Some(value) = read_env("CHARTER_COMPLIANCE_MAX_HORIZON_YEARS") {
            self.compliance.max_horizon_years =
                parse_u32("CHARTER_COMPLIANCE_MAX_HORIZON_YEARS", &value)?;
        }
        if let Some(value) = read_env("CHARTER_COMPLIANCE_UPCOMING_WINDOW_DAYS") {
            self.compliance.upcoming_window_days =
                parse_u32("CHARTER_COMPLIANCE_UPCOMING_WINDOW_DAYS", &value)?;
        }
        if let Some(value) = read_env("CHARTER_COMPLIANCE_SWEEP_INTERVAL_SECS") {
            self.compliance.sweep_interval_secs =
                parse_u64("CHARTER_COMPLIANCE_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CHARTER_COMPLIANCE_AUTO_EXTEND") {
            self.compliance.auto_extend = parse_bool("CHARTER_COMPLIANCE_AUTO_EXTEND", &value)?;
        }

        if let Some(value) = read_env("CHARTER_SERVICES_REGISTRATION_BASE_URL") {
            self.services.registration_base_url = Some(value);
        }
        if let Some(value) = read_env("CHARTER_SERVICES_REGISTRATION_API_KEY") {
            self.services.registration_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CHARTER_SERVICES_REQUEST_TIMEOUT_SECS") {
            self.services.request_timeout_secs =
                parse_u64("CHARTER_SERVICES_REQUEST_TIMEOUT_SECS", &value)?;
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
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(step_timeout_secs) = overrides.step_timeout_secs {
            self.execution.step_timeout_secs = step_timeout_secs;
        }
        if let Some(base_url) = overrides.registration_base_url {
            self.services.registration_base_url = Some(base_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_execution(&self.execution)?;
        validate_compliance(&self.compliance)?;
        validate_services(&self.services)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("charter.toml"), PathBuf::from("config/charter.toml")]
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

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
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

fn validate_execution(execution: &ExecutionConfig) -> Result<(), ConfigError> {
    if execution.step_timeout_secs == 0 || execution.step_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "execution.step_timeout_secs must be in range 1..=600".to_string(),
        ));
    }
    Ok(())
}

fn validate_compliance(compliance: &ComplianceConfig) -> Result<(), ConfigError> {
    if compliance.horizon_years == 0 || compliance.horizon_years > 10 {
        return Err(ConfigError::Validation(
            "compliance.horizon_years must be in range 1..=10".to_string(),
        ));
    }

    if compliance.max_horizon_years < compliance.horizon_years
        || compliance.max_horizon_years > 100
    {
        return Err(ConfigError::Validation(
            "compliance.max_horizon_years must be in range horizon_years..=100".to_string(),
        ));
    }

    if compliance.upcoming_window_days > 366 {
        return Err(ConfigError::Validation(
            "compliance.upcoming_window_days must not exceed 366".to_string(),
        ));
    }

    Ok(())
}

fn validate_services(services: &ServicesConfig) -> Result<(), ConfigError> {
    if let Some(base_url) = &services.registration_base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "services.registration_base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if let Some(api_key) = &services.registration_api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "services.registration_api_key must not be blank when set".to_string(),
            ));
        }
    }

    if services.request_timeout_secs == 0 || services.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "services.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
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
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    execution: Option<ExecutionPatch>,
    compliance: Option<CompliancePatch>,
    services: Option<ServicesPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionPatch {
    step_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CompliancePatch {
    horizon_years: Option<u32>,
    max_horizon_years: Option<u32>,
    upcoming_window_days: Option<u32>,
    sweep_interval_secs: Option<u64>,
    auto_extend: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ServicesPatch {
    registration_base_url: Option<String>,
    registration_api_key: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
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
    fn defaults_are_valid() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;

        ensure(config.compliance.horizon_years == 3, "default horizon is three years")?;
        ensure(config.compliance.upcoming_window_days == 30, "default window is 30 days")?;
        ensure(config.compliance.max_horizon_years == 50, "default horizon cap is 50 years")?;
        ensure(config.services.registration_base_url.is_none(), "no remote service by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CHARTER_REGISTRY_KEY", "key-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("charter.toml");
            fs::write(
                &path,
                r#"
[services]
registration_base_url = "https://registry.example.test"
registration_api_key = "${TEST_CHARTER_REGISTRY_KEY}"

[compliance]
upcoming_window_days = 45
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let key = config
                .services
                .registration_api_key
                .as_ref()
                .map(|secret| secret.expose_secret().to_string());
            ensure(key.as_deref() == Some("key-from-env"), "api key should be interpolated")?;
            ensure(config.compliance.upcoming_window_days == 45, "window should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_CHARTER_REGISTRY_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHARTER_LOG_LEVEL", "warn");
        env::set_var("CHARTER_LOG_FORMAT", "pretty");

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

        clear_vars(&["CHARTER_LOG_LEVEL", "CHARTER_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHARTER_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CHARTER_EXECUTION_STEP_TIMEOUT_SECS", "12");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("charter.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[execution]
step_timeout_secs = 5

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.execution.step_timeout_secs == 12,
                "env step timeout should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["CHARTER_DATABASE_URL", "CHARTER_EXECUTION_STEP_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHARTER_SERVICES_REGISTRATION_BASE_URL", "registry.example.test");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message)
                    if message.contains("services.registration_base_url")
            );
            ensure(has_message, "validation failure should name the offending key")
        })();

        clear_vars(&["CHARTER_SERVICES_REGISTRATION_BASE_URL"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHARTER_COMPLIANCE_HORIZON_YEARS", "three");

        let result = (|| -> Result<(), String> {
            let error = AppConfig::load(LoadOptions::default()).err();
            ensure(
                matches!(
                    error,
                    Some(ConfigError::InvalidEnvOverride { ref key, .. })
                        if key == "CHARTER_COMPLIANCE_HORIZON_YEARS"
                ),
                "non-numeric horizon should be rejected",
            )
        })();

        clear_vars(&["CHARTER_COMPLIANCE_HORIZON_YEARS"]);
        result
    }

    #[test]
    fn horizon_cap_must_cover_the_default_horizon() -> Result<(), String> {
        let mut config = AppConfig::default();
        config.compliance.max_horizon_years = 2;
        let error = config.validate().err();
        ensure(
            matches!(
                error,
                Some(ConfigError::Validation(ref message))
                    if message.contains("compliance.max_horizon_years")
            ),
            "a cap below the default horizon should be rejected",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CHARTER_SERVICES_REGISTRATION_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CHARTER_SERVICES_REGISTRATION_API_KEY"]);
        result
    }
}
