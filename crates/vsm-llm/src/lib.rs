//! LLM vendor adapters.
//!
//! Each adapter implements [`vsm_core::ProviderAdapter`] and delivers a
//! stream of normalized events ending in exactly one terminal event, even
//! when the vendor call fails.

pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod sse;
pub mod tool_args;
mod transport;

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;
use vsm_core::{ProviderAdapter, ProviderError, ProviderFamily};
use vsm_settings::ProviderSettings;

pub use anthropic::{AnthropicAdapter, AnthropicConfig};
pub use gemini::{GeminiAdapter, GeminiConfig};
pub use mock::{MockAdapter, MockResponse};
pub use openai::{OpenAiAdapter, OpenAiConfig};

/// Environment variable consulted for the key when settings name none.
pub fn default_api_key_env(family: ProviderFamily) -> &'static str {
    match family {
        ProviderFamily::OpenAi => "OPENAI_API_KEY",
        ProviderFamily::Anthropic => "ANTHROPIC_API_KEY",
        ProviderFamily::Gemini => "GEMINI_API_KEY",
    }
}

/// Build the configured adapter, reading its key from the environment.
pub fn build_adapter(settings: &ProviderSettings) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    build_adapter_with(settings, |name| std::env::var(name).ok())
}

/// Same as [`build_adapter`] with an injectable environment lookup.
pub fn build_adapter_with(
    settings: &ProviderSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    let family = ProviderFamily::from_name(&settings.family);
    let env_name = settings
        .api_key_env
        .clone()
        .unwrap_or_else(|| default_api_key_env(family).to_string());
    let key = lookup(&env_name)
        .filter(|k| !k.trim().is_empty())
        .map(SecretString::from)
        .ok_or(ProviderError::MissingApiKey(env_name))?;

    info!(family = %family, model = %settings.model, "provider adapter configured");
    let adapter: Arc<dyn ProviderAdapter> = match family {
        ProviderFamily::OpenAi => {
            let mut config = OpenAiConfig::new(&settings.model, key);
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url);
            }
            config.max_tokens = settings.max_tokens;
            Arc::new(OpenAiAdapter::new(config))
        }
        ProviderFamily::Anthropic => {
            let mut config = AnthropicConfig::new(&settings.model, key);
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url);
            }
            config.max_tokens = settings.max_tokens;
            Arc::new(AnthropicAdapter::new(config))
        }
        ProviderFamily::Gemini => {
            let mut config = GeminiConfig::new(&settings.model, key);
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url);
            }
            config.max_tokens = settings.max_tokens;
            Arc::new(GeminiAdapter::new(config))
        }
    };
    Ok(adapter)
}
