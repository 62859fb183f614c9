use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["negocia.toml", "config/negocia.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    pub negotiation: NegotiationConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base_url: String,
    pub username: String,
    pub password: SecretString,
    pub request_timeout_secs: u64,
    pub agreement_key: AgreementKey,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct NegotiationConfig {
    pub agreement_timeout_secs: u64,
    pub idle_max_age_hours: u64,
    pub eviction_interval_secs: u64,
    pub directive_candidate_limit: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Which identifier the agreement registration call is keyed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementKey {
    CreditorId,
    Document,
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
    pub gateway_base_url: Option<String>,
    pub gateway_username: Option<String>,
    pub gateway_password: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub agreement_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
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
            gateway: GatewayConfig {
                base_url: "https://api.cobrance.online:3030".to_string(),
                username: String::new(),
                password: String::new().into(),
                request_timeout_secs: 15,
                agreement_key: AgreementKey::CreditorId,
            },
            llm: LlmConfig {
                api_key: String::new().into(),
                base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
                model: "gemini-2.0-flash".to_string(),
                timeout_secs: 30,
            },
            negotiation: NegotiationConfig {
                agreement_timeout_secs: 30,
                idle_max_age_hours: 24,
                eviction_interval_secs: 900,
                directive_candidate_limit: 5,
            },
            server: ServerConfig { bind_address: "127.0.0.1".to_string(), health_check_port: 8080 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl AgreementKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreditorId => "creditor_id",
            Self::Document => "document",
        }
    }
}

impl std::str::FromStr for AgreementKey {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "creditor_id" => Ok(Self::CreditorId),
            "document" => Ok(Self::Document),
            other => Err(ConfigError::Validation(format!(
                "unsupported agreement key `{other}` (expected creditor_id|document)"
            ))),
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
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(gateway) = patch.gateway {
            if let Some(base_url) = gateway.base_url {
                self.gateway.base_url = base_url;
            }
            if let Some(username) = gateway.username {
                self.gateway.username = username;
            }
            if let Some(password) = gateway.password {
                self.gateway.password = secret_value(password);
            }
            if let Some(request_timeout_secs) = gateway.request_timeout_secs {
                self.gateway.request_timeout_secs = request_timeout_secs;
            }
            if let Some(agreement_key) = gateway.agreement_key {
                self.gateway.agreement_key = agreement_key;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = secret_value(api_key);
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(negotiation) = patch.negotiation {
            if let Some(value) = negotiation.agreement_timeout_secs {
                self.negotiation.agreement_timeout_secs = value;
            }
            if let Some(value) = negotiation.idle_max_age_hours {
                self.negotiation.idle_max_age_hours = value;
            }
            if let Some(value) = negotiation.eviction_interval_secs {
                self.negotiation.eviction_interval_secs = value;
            }
            if let Some(value) = negotiation.directive_candidate_limit {
                self.negotiation.directive_candidate_limit = value;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
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
        if let Some(value) = read_env("NEGOCIA_GATEWAY_BASE_URL") {
            self.gateway.base_url = value;
        }
        if let Some(value) = read_env("NEGOCIA_GATEWAY_USERNAME") {
            self.gateway.username = value;
        }
        if let Some(value) = read_env("NEGOCIA_GATEWAY_PASSWORD") {
            self.gateway.password = secret_value(value);
        }
        if let Some(value) = read_env("NEGOCIA_GATEWAY_REQUEST_TIMEOUT_SECS") {
            self.gateway.request_timeout_secs =
                parse_u64("NEGOCIA_GATEWAY_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("NEGOCIA_GATEWAY_AGREEMENT_KEY") {
            self.gateway.agreement_key = value.parse()?;
        }

        let api_key = read_env("NEGOCIA_LLM_API_KEY").or_else(|| read_env("GEMINI_API_KEY"));
        if let Some(value) = api_key {
            self.llm.api_key = secret_value(value);
        }
        if let Some(value) = read_env("NEGOCIA_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("NEGOCIA_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("NEGOCIA_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("NEGOCIA_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("NEGOCIA_NEGOTIATION_AGREEMENT_TIMEOUT_SECS") {
            self.negotiation.agreement_timeout_secs =
                parse_u64("NEGOCIA_NEGOTIATION_AGREEMENT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("NEGOCIA_NEGOTIATION_IDLE_MAX_AGE_HOURS") {
            self.negotiation.idle_max_age_hours =
                parse_u64("NEGOCIA_NEGOTIATION_IDLE_MAX_AGE_HOURS", &value)?;
        }
        if let Some(value) = read_env("NEGOCIA_NEGOTIATION_EVICTION_INTERVAL_SECS") {
            self.negotiation.eviction_interval_secs =
                parse_u64("NEGOCIA_NEGOTIATION_EVICTION_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("NEGOCIA_NEGOTIATION_DIRECTIVE_CANDIDATE_LIMIT") {
            self.negotiation.directive_candidate_limit =
                parse_usize("NEGOCIA_NEGOTIATION_DIRECTIVE_CANDIDATE_LIMIT", &value)?;
        }

        if let Some(value) = read_env("NEGOCIA_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("NEGOCIA_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("NEGOCIA_SERVER_HEALTH_CHECK_PORT", &value)?;
        }

        let log_level = read_env("NEGOCIA_LOGGING_LEVEL").or_else(|| read_env("NEGOCIA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("NEGOCIA_LOGGING_FORMAT").or_else(|| read_env("NEGOCIA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(base_url) = overrides.gateway_base_url {
            self.gateway.base_url = base_url;
        }
        if let Some(username) = overrides.gateway_username {
            self.gateway.username = username;
        }
        if let Some(password) = overrides.gateway_password {
            self.gateway.password = secret_value(password);
        }
        if let Some(api_key) = overrides.llm_api_key {
            self.llm.api_key = secret_value(api_key);
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        if let Some(seconds) = overrides.agreement_timeout_secs {
            self.negotiation.agreement_timeout_secs = seconds;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_gateway(&self.gateway)?;
        validate_llm(&self.llm)?;
        validate_negotiation(&self.negotiation)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    DEFAULT_CONFIG_FILES.into_iter().map(PathBuf::from).find(|path| path.exists())
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

fn validate_http_url(key: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{key} must start with http:// or https://")))
    }
}

fn validate_gateway(gateway: &GatewayConfig) -> Result<(), ConfigError> {
    validate_http_url("gateway.base_url", gateway.base_url.trim())?;

    if gateway.username.trim().is_empty() {
        return Err(ConfigError::Validation(
            "gateway.username is required to issue agreement registration tokens (set NEGOCIA_GATEWAY_USERNAME)"
                .to_string(),
        ));
    }
    if gateway.password.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "gateway.password is required to issue agreement registration tokens (set NEGOCIA_GATEWAY_PASSWORD)"
                .to_string(),
        ));
    }

    if gateway.request_timeout_secs == 0 || gateway.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "gateway.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "llm.api_key is required (set NEGOCIA_LLM_API_KEY or GEMINI_API_KEY)".to_string(),
        ));
    }

    validate_http_url("llm.base_url", llm.base_url.trim())?;

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_negotiation(negotiation: &NegotiationConfig) -> Result<(), ConfigError> {
    if negotiation.agreement_timeout_secs == 0 || negotiation.agreement_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "negotiation.agreement_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if negotiation.idle_max_age_hours == 0 {
        return Err(ConfigError::Validation(
            "negotiation.idle_max_age_hours must be greater than zero".to_string(),
        ));
    }

    if negotiation.eviction_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "negotiation.eviction_interval_secs must be greater than zero".to_string(),
        ));
    }

    if !(1..=20).contains(&negotiation.directive_candidate_limit) {
        return Err(ConfigError::Validation(
            "negotiation.directive_candidate_limit must be in range 1..=20".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
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

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    gateway: Option<GatewayPatch>,
    llm: Option<LlmPatch>,
    negotiation: Option<NegotiationPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayPatch {
    base_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    request_timeout_secs: Option<u64>,
    agreement_key: Option<AgreementKey>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct NegotiationPatch {
    agreement_timeout_secs: Option<u64>,
    idle_max_age_hours: Option<u64>,
    eviction_interval_secs: Option<u64>,
    directive_candidate_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
