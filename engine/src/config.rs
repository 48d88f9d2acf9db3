//! TOML configuration.
//!
//! Settings live in `ember.toml` (workspace) or `~/.config/ember/config.toml`.
//! Every field is optional; the API key is never stored in the file and is
//! read from the provider's environment variable instead.
//!
//! ```toml
//! provider = "claude"
//! model = "claude-sonnet-4-5-20250929"
//! max_iterations = 25
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//!
//! [context]
//! max_context_tokens = 200000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use ember_context::CompactorConfig;
use ember_providers::retry::RetryConfig;
use ember_types::{ApiKey, Provider, ProviderConfig};

use crate::agent::AgentOptions;

/// File name probed in the working directory before the user config dir.
const LOCAL_CONFIG_NAME: &str = "ember.toml";

/// Raw deserialized file contents.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub reasoning: Option<bool>,
    pub max_iterations: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    pub retry: RetrySection,
    pub context: ContextSection,
    pub approval: ApprovalSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalSection {
    /// Latch the session-wide bypass at startup.
    pub auto_approve: Option<bool>,
    /// Tool names always routed through the gate.
    pub require_approval: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub attempt_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextSection {
    pub max_context_tokens: Option<usize>,
    pub reserved_output_tokens: Option<usize>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderConfig,
    pub options: AgentOptions,
    pub compactor: CompactorConfig,
    pub system_prompt: Option<String>,
}

impl Config {
    /// Load from `path`, or probe the default locations when `None`.
    /// A missing file resolves to defaults rather than an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(explicit) => {
                let raw = std::fs::read_to_string(explicit)
                    .with_context(|| format!("reading config {}", explicit.display()))?;
                parse(&raw).with_context(|| format!("parsing {}", explicit.display()))?
            }
            None => match default_config_path() {
                Some(found) => {
                    let raw = std::fs::read_to_string(&found)
                        .with_context(|| format!("reading config {}", found.display()))?;
                    parse(&raw).with_context(|| format!("parsing {}", found.display()))?
                }
                None => ConfigFile::default(),
            },
        };
        Self::resolve(file)
    }

    /// Turn raw file contents into runtime configuration.
    pub fn resolve(file: ConfigFile) -> anyhow::Result<Self> {
        let provider = match &file.provider {
            Some(name) => Provider::parse(name)
                .with_context(|| format!("unknown provider '{name}'"))?,
            None => Provider::Claude,
        };

        let model_raw = file
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());
        let model = provider
            .parse_model(&model_raw)
            .with_context(|| format!("model '{model_raw}' is not valid for {provider}"))?;

        let api_key = std::env::var(provider.env_var())
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|k| ApiKey::for_provider(provider, k));

        let mut provider_config = ProviderConfig::new(model, api_key);
        if let Some(base_url) = file.base_url.clone() {
            provider_config = provider_config.with_base_url(base_url);
        }

        let defaults = AgentOptions::default();
        let retry_defaults = RetryConfig::default();
        let options = AgentOptions {
            retry: RetryConfig {
                max_retries: file.retry.max_retries.unwrap_or(retry_defaults.max_retries),
                initial_delay: file
                    .retry
                    .initial_delay_ms
                    .map_or(retry_defaults.initial_delay, Duration::from_millis),
                max_delay: file
                    .retry
                    .max_delay_ms
                    .map_or(retry_defaults.max_delay, Duration::from_millis),
                backoff_multiplier: file
                    .retry
                    .backoff_multiplier
                    .unwrap_or(retry_defaults.backoff_multiplier),
                attempt_timeout: match file.retry.attempt_timeout_secs {
                    Some(0) => None,
                    Some(secs) => Some(Duration::from_secs(secs)),
                    None => retry_defaults.attempt_timeout,
                },
            },
            max_iterations: file.max_iterations.unwrap_or(defaults.max_iterations),
            tool_timeout: match file.tool_timeout_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.tool_timeout,
            },
            max_output_tokens: file
                .max_output_tokens
                .unwrap_or(defaults.max_output_tokens),
            reasoning_enabled: file.reasoning.unwrap_or(defaults.reasoning_enabled),
            auto_approve: file.approval.auto_approve.unwrap_or(false),
            require_approval: file.approval.require_approval.unwrap_or_default(),
        };

        let compactor_defaults = CompactorConfig::default();
        let compactor = CompactorConfig {
            max_context_tokens: file
                .context
                .max_context_tokens
                .unwrap_or(compactor_defaults.max_context_tokens),
            reserved_output_tokens: file
                .context
                .reserved_output_tokens
                .unwrap_or(compactor_defaults.reserved_output_tokens),
        };

        Ok(Self {
            provider: provider_config,
            options,
            compactor,
            system_prompt: file.system_prompt,
        })
    }
}

fn parse(raw: &str) -> anyhow::Result<ConfigFile> {
    toml::from_str(raw).context("invalid TOML")
}

/// `./ember.toml` first, then the per-user config directory.
fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG_NAME);
    if local.exists() {
        return Some(local);
    }
    let user = dirs::config_dir()?.join("ember").join("config.toml");
    user.exists().then_some(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_resolves_to_defaults() {
        let config = Config::resolve(parse("").unwrap()).unwrap();
        assert_eq!(config.provider.provider, Provider::Claude);
        assert_eq!(config.options.max_iterations, 25);
        assert_eq!(config.compactor.max_context_tokens, 200_000);
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let raw = r#"
            provider = "openai"
            model = "gpt-5.2"
            max_iterations = 5
            tool_timeout_secs = 30

            [retry]
            max_retries = 1
            initial_delay_ms = 250

            [context]
            max_context_tokens = 128000
            reserved_output_tokens = 4096
        "#;
        let config = Config::resolve(parse(raw).unwrap()).unwrap();
        assert_eq!(config.provider.provider, Provider::OpenAI);
        assert_eq!(config.options.max_iterations, 5);
        assert_eq!(config.options.tool_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.options.retry.max_retries, 1);
        assert_eq!(
            config.options.retry.initial_delay,
            Duration::from_millis(250)
        );
        assert_eq!(config.compactor.max_context_tokens, 128_000);
        assert_eq!(config.compactor.reserved_output_tokens, 4_096);
    }

    #[test]
    fn zero_timeouts_disable_the_deadline() {
        let raw = "tool_timeout_secs = 0\n[retry]\nattempt_timeout_secs = 0\n";
        let config = Config::resolve(parse(raw).unwrap()).unwrap();
        assert!(config.options.tool_timeout.is_none());
        assert!(config.options.retry.attempt_timeout.is_none());
    }

    #[test]
    fn approval_section_feeds_the_gate_policy() {
        let raw = r#"
            [approval]
            auto_approve = true
            require_approval = ["run_command", "delete_file"]
        "#;
        let config = Config::resolve(parse(raw).unwrap()).unwrap();
        assert!(config.options.auto_approve);
        assert_eq!(
            config.options.require_approval,
            vec!["run_command".to_string(), "delete_file".to_string()]
        );
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let err = Config::resolve(parse("provider = \"mistral\"").unwrap()).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn mismatched_model_is_an_error() {
        let raw = "provider = \"claude\"\nmodel = \"gpt-5.2\"\n";
        assert!(Config::resolve(parse(raw).unwrap()).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse("not_a_setting = true").is_err());
    }
}
