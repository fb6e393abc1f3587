use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use charter_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

fn field(key: &'static str, env_keys: &'static [&'static str], value: impl Into<String>) -> Field {
    Field { key, env_keys, value: value.into() }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let api_key = config
        .services
        .registration_api_key
        .as_ref()
        .map(|secret| redact_secret(secret.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    vec![
        field("database.url", &["CHARTER_DATABASE_URL"], config.database.url.clone()),
        field(
            "database.max_connections",
            &["CHARTER_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            &["CHARTER_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        field(
            "server.bind_address",
            &["CHARTER_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        field("server.port", &["CHARTER_SERVER_PORT"], config.server.port.to_string()),
        field(
            "logging.level",
            &["CHARTER_LOGGING_LEVEL", "CHARTER_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        field(
            "logging.format",
            &["CHARTER_LOGGING_FORMAT", "CHARTER_LOG_FORMAT"],
            format!("{:?}", config.logging.format),
        ),
        field(
            "execution.step_timeout_secs",
            &["CHARTER_EXECUTION_STEP_TIMEOUT_SECS"],
            config.execution.step_timeout_secs.to_string(),
        ),
        field(
            "compliance.horizon_years",
            &["CHARTER_COMPLIANCE_HORIZON_YEARS"],
            config.compliance.horizon_years.to_string(),
        ),
        field(
            "compliance.max_horizon_years",
            &["CHARTER_COMPLIANCE_MAX_HORIZON_YEARS"],
            config.compliance.max_horizon_years.to_string(),
        ),
        field(
            "compliance.upcoming_window_days",
            &["CHARTER_COMPLIANCE_UPCOMING_WINDOW_DAYS"],
            config.compliance.upcoming_window_days.to_string(),
        ),
        field(
            "compliance.sweep_interval_secs",
            &["CHARTER_COMPLIANCE_SWEEP_INTERVAL_SECS"],
            config.compliance.sweep_interval_secs.to_string(),
        ),
        field(
            "compliance.auto_extend",
            &["CHARTER_COMPLIANCE_AUTO_EXTEND"],
            config.compliance.auto_extend.to_string(),
        ),
        field(
            "services.registration_base_url",
            &["CHARTER_SERVICES_REGISTRATION_BASE_URL"],
            config.services.registration_base_url.as_deref().unwrap_or("<unset>"),
        ),
        field("services.registration_api_key", &["CHARTER_SERVICES_REGISTRATION_API_KEY"], api_key),
        field(
            "services.request_timeout_secs",
            &["CHARTER_SERVICES_REQUEST_TIMEOUT_SECS"],
            config.services.request_timeout_secs.to_string(),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["charter.toml", "config/charter.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a short prefix such as `sk-` so operators can tell keys apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_secret};

    #[test]
    fn redaction_never_echoes_the_secret() {
        assert_eq!(redact_secret("sk-live-123"), "sk-***");
        assert_eq!(redact_secret("opaque"), "<redacted>");
        assert_eq!(redact_secret("  "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_toml_documents() {
        let doc: toml::Value = "[compliance]\nhorizon_years = 5\n".parse().unwrap();
        assert!(contains_path(&doc, "compliance.horizon_years"));
        assert!(!contains_path(&doc, "compliance.auto_extend"));
    }
}
