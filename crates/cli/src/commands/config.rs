use std::env;
use std::fs;
use std::path::Path;

use negocia_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Field {
    fn new(key: &'static str, value: impl ToString, env_keys: &'static [&'static str]) -> Self {
        Self { key, value: value.to_string(), env_keys }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
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
    let gateway = &config.gateway;
    let llm = &config.llm;
    let negotiation = &config.negotiation;

    vec![
        Field::new("gateway.base_url", &gateway.base_url, &["NEGOCIA_GATEWAY_BASE_URL"]),
        Field::new("gateway.username", &gateway.username, &["NEGOCIA_GATEWAY_USERNAME"]),
        Field::new(
            "gateway.password",
            redact_secret(&gateway.password),
            &["NEGOCIA_GATEWAY_PASSWORD"],
        ),
        Field::new(
            "gateway.request_timeout_secs",
            gateway.request_timeout_secs,
            &["NEGOCIA_GATEWAY_REQUEST_TIMEOUT_SECS"],
        ),
        Field::new(
            "gateway.agreement_key",
            gateway.agreement_key.as_str(),
            &["NEGOCIA_GATEWAY_AGREEMENT_KEY"],
        ),
        Field::new(
            "llm.api_key",
            redact_secret(&llm.api_key),
            &["NEGOCIA_LLM_API_KEY", "GEMINI_API_KEY"],
        ),
        Field::new("llm.base_url", &llm.base_url, &["NEGOCIA_LLM_BASE_URL"]),
        Field::new("llm.model", &llm.model, &["NEGOCIA_LLM_MODEL"]),
        Field::new("llm.timeout_secs", llm.timeout_secs, &["NEGOCIA_LLM_TIMEOUT_SECS"]),
        Field::new(
            "negotiation.agreement_timeout_secs",
            negotiation.agreement_timeout_secs,
            &["NEGOCIA_NEGOTIATION_AGREEMENT_TIMEOUT_SECS"],
        ),
        Field::new(
            "negotiation.idle_max_age_hours",
            negotiation.idle_max_age_hours,
            &["NEGOCIA_NEGOTIATION_IDLE_MAX_AGE_HOURS"],
        ),
        Field::new(
            "negotiation.eviction_interval_secs",
            negotiation.eviction_interval_secs,
            &["NEGOCIA_NEGOTIATION_EVICTION_INTERVAL_SECS"],
        ),
        Field::new(
            "negotiation.directive_candidate_limit",
            negotiation.directive_candidate_limit,
            &["NEGOCIA_NEGOTIATION_DIRECTIVE_CANDIDATE_LIMIT"],
        ),
        Field::new(
            "server.bind_address",
            &config.server.bind_address,
            &["NEGOCIA_SERVER_BIND_ADDRESS"],
        ),
        Field::new(
            "server.health_check_port",
            config.server.health_check_port,
            &["NEGOCIA_SERVER_HEALTH_CHECK_PORT"],
        ),
        Field::new(
            "logging.level",
            &config.logging.level,
            &["NEGOCIA_LOGGING_LEVEL", "NEGOCIA_LOG_LEVEL"],
        ),
        Field::new(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["NEGOCIA_LOGGING_FORMAT", "NEGOCIA_LOG_FORMAT"],
        ),
    ]
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
    let from_env = env_keys
        .iter()
        .find(|key| env::var(key).is_ok_and(|value| !value.trim().is_empty()));
    if let Some(env_key) = from_env {
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

fn redact_secret(secret: &SecretString) -> &'static str {
    if secret.expose_secret().trim().is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, render_line};

    #[test]
    fn nested_keys_are_found_in_file_documents() {
        let doc = "[gateway]\nbase_url = \"https://gw.example\"\n[llm]\nmodel = \"x\"\n"
            .parse::<toml::Value>()
            .expect("valid toml");

        assert!(contains_path(&doc, "gateway.base_url"));
        assert!(contains_path(&doc, "llm.model"));
        assert!(!contains_path(&doc, "llm.api_key"));
        assert!(!contains_path(&doc, "server.bind_address"));
    }

    #[test]
    fn lines_carry_key_value_and_source() {
        assert_eq!(
            render_line("llm.model", "gemini-2.0-flash", "default".to_string()),
            "- llm.model = gemini-2.0-flash (source: default)"
        );
    }
}
