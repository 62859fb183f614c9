use std::sync::Arc;
use std::time::Duration;

use negocia_agent::{AgentRuntime, GeminiClient, HttpDebtGateway, RuntimeSettings};
use negocia_core::config::AppConfig;
use negocia_core::ContextStore;
use thiserror::Error;
use tracing::info;

use crate::ingress::{IngressRunner, NoopChatTransport, ReconnectPolicy};

pub struct Application {
    pub config: AppConfig,
    pub runtime: Arc<AgentRuntime>,
    pub ingress: IngressRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("debt gateway client could not be built: {0:#}")]
    Gateway(anyhow::Error),
    #[error("llm client could not be built: {0:#}")]
    Llm(anyhow::Error),
}

/// Wires the runtime from an already loaded and validated config.
pub fn bootstrap(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let gateway = HttpDebtGateway::new(&config.gateway).map_err(BootstrapError::Gateway)?;
    let llm = GeminiClient::new(&config.llm).map_err(BootstrapError::Llm)?;
    info!(
        event_name = "system.bootstrap.clients_ready",
        correlation_id = "bootstrap",
        gateway_base_url = %config.gateway.base_url,
        llm_model = %config.llm.model,
        agreement_key = config.gateway.agreement_key.as_str(),
        "external clients configured"
    );

    let runtime = Arc::new(AgentRuntime::new(
        Arc::new(ContextStore::new()),
        Arc::new(gateway),
        Arc::new(llm),
        RuntimeSettings::from_config(&config.negotiation),
    ));
    let ingress = IngressRunner::new(
        Arc::new(NoopChatTransport),
        runtime.clone(),
        ReconnectPolicy::default(),
    )
    .with_worker_idle(Duration::from_secs(config.negotiation.eviction_interval_secs));

    Ok(Application { config, runtime, ingress })
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use negocia_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn config(agreement_timeout_secs: u64) -> AppConfig {
        AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                gateway_username: Some("negocia".to_string()),
                gateway_password: Some("s3cret".to_string()),
                llm_api_key: Some("gemini-test-key".to_string()),
                agreement_timeout_secs: Some(agreement_timeout_secs),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("overrides form a valid config")
    }

    #[test]
    fn client_failures_keep_their_cause_chain() {
        let error = BootstrapError::Gateway(anyhow!("invalid certificate").context("tls setup"));
        assert_eq!(
            error.to_string(),
            "debt gateway client could not be built: tls setup: invalid certificate"
        );
    }

    #[tokio::test]
    async fn bootstrap_wires_runtime_with_configured_settings() {
        let app = bootstrap(config(45)).expect("bootstrap should succeed with valid config");

        assert_eq!(app.config.negotiation.agreement_timeout_secs, 45);
        assert_eq!(app.runtime.active_contexts(), 0);

        app.ingress.start().await.expect("noop transport closes cleanly");
        assert_eq!(app.ingress.active_workers(), 0);
    }
}
