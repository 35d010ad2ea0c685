//! Environment-based API key resolution.

use crate::types::model::providers;

/// Environment variable names checked for each provider, in order.
fn env_keys_for(provider: &str) -> &'static [&'static str] {
    match provider {
        providers::OPENAI => &["OPENAI_API_KEY"],
        providers::ANTHROPIC => &["ANTHROPIC_API_KEY"],
        providers::GOOGLE => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
        providers::GOOGLE_VERTEX => &["GOOGLE_API_KEY"],
        providers::XAI => &["XAI_API_KEY"],
        providers::GROQ => &["GROQ_API_KEY"],
        providers::CEREBRAS => &["CEREBRAS_API_KEY"],
        providers::OPENROUTER => &["OPENROUTER_API_KEY"],
        providers::MISTRAL => &["MISTRAL_API_KEY"],
        providers::MINIMAX => &["MINIMAX_API_KEY"],
        providers::HUGGINGFACE => &["HUGGINGFACE_API_KEY", "HF_TOKEN"],
        providers::AMAZON_BEDROCK => &["AWS_BEARER_TOKEN_BEDROCK"],
        providers::ZAI => &["ZAI_API_KEY"],
        _ => &[],
    }
}

/// Resolve an API key for a provider from the environment.
///
/// The first non-empty value among the provider's candidate variables wins.
pub fn env_api_key(provider: &str) -> Option<String> {
    env_keys_for(provider)
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.is_empty())
}
