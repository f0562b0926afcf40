use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration, loaded from a single `config.toml`.
///
/// One struct per concern, defaults supplied via `#[serde(default = "...")]`
/// functions so partial configs still parse.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub apps: AppRegistryConfig,
}

/// Per-task agent behavior (spec §3 `AgentConfig`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_language")]
    pub language: Language,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub recording_enabled: bool,
}

fn default_max_steps() -> u32 {
    100
}
fn default_language() -> Language {
    Language::En
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            device_id: None,
            language: default_language(),
            verbose: false,
            recording_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cn,
    En,
}

/// Model-client configuration (spec §3 `ModelConfig`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    /// Per-char contribution to the adaptive timeout (spec §4.4).
    #[serde(default = "default_content_factor_ms")]
    pub content_factor_ms_per_char: f64,
    /// Per-image contribution to the adaptive timeout (spec §4.4).
    #[serde(default = "default_image_factor_ms")]
    pub image_factor_ms: f64,
    /// Growth factor applied to the per-attempt timeout on retry.
    #[serde(default = "default_timeout_growth")]
    pub timeout_growth_factor: f64,
}

fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.2
}
fn default_top_p() -> f32 {
    0.9
}
fn default_base_timeout_ms() -> u64 {
    60_000
}
fn default_max_timeout_ms() -> u64 {
    180_000
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delays_ms() -> Vec<u64> {
    vec![500, 1_500, 4_000]
}
fn default_content_factor_ms() -> f64 {
    2.0
}
fn default_image_factor_ms() -> f64 {
    5_000.0
}
fn default_timeout_growth() -> f64 {
    1.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8420
}

/// Extra human-name → package-id entries merged on top of the built-in
/// `AppRegistry` table (spec §4.3).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppRegistryConfig {
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config at {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_src = r#"
            [model]
            endpoint = "http://localhost:8000/v1"
            model = "qwen-vl"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.agent.max_steps, 100);
        assert_eq!(config.agent.language, Language::En);
        assert_eq!(config.server.port, 8420);
        assert_eq!(config.model.retry_count, 3);
    }
}
