//! Builds the `pg-gateway-llm` client from `GatewayConfig::llm`. Ground:
//! `nocodo-api::helpers::llm::create_llm_client`'s single-factory shape,
//! generalized to the OpenAI/Azure-OpenAI switch instead of a provider match.

use std::sync::Arc;

use pg_gateway_llm::client::LlmClient;
use pg_gateway_llm::openai::OpenAIClient;

use crate::config::LlmConfig;

pub fn create_llm_client(config: &LlmConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let mut client = OpenAIClient::new(config.api_key.clone())
        .map_err(|e| anyhow::anyhow!("failed to construct LLM client: {e}"))?;

    if let Some(base) = &config.api_base {
        client = client.with_base_url(base.clone());
    }

    if config.use_azure {
        let endpoint = config
            .azure_endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.azure_endpoint is required when use_azure is set"))?;
        let deployment = config
            .azure_deployment
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.azure_deployment is required when use_azure is set"))?;
        let api_version = config
            .api_version
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.api_version is required when use_azure is set"))?;
        client = client.with_base_url(endpoint).with_azure(deployment, api_version);
    }

    Ok(Arc::new(client))
}
