//! Engine configuration: sandbox limits, pipeline policy, provider defaults.
//!
//! Loaded from a TOML file with every field defaulted, so an empty file (or
//! no file at all) yields a working configuration.  A handful of environment
//! variables override the file for containerized deployments.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which resolved prompt Stage-5 AI calls use as their system prompt.
///
/// The default is the Stage-2 prompt — the most recently resolved "live"
/// prompt.  `Stage1` exists for hosts whose downstream tooling expects
/// reflection calls to see the pre-AI prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    #[default]
    Stage2,
    Stage1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Wall-clock budget for a single script execution.
    pub timeout_secs: u64,
    /// Rhai operation budget; the progress hook also enforces the deadline.
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_string_size: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// System prompt used by Stage-5 AI calls.
    pub stage5_prompt_source: PromptSource,
    /// How many recent messages the per-stage conversation snapshot holds.
    pub snapshot_messages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { stage5_prompt_source: PromptSource::Stage2, snapshot_messages: 20 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Record prompt evolution and per-stage timings for debug payloads.
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// `"ollama"` or `"openai"` — which family handles a request that does
    /// not name one.
    pub default_provider: String,
    /// Base URL for the local-style API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    /// Base URL for the OpenAI-compatible API.
    pub openai_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_provider: "ollama".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub script: ScriptConfig,
    pub pipeline: PipelineConfig,
    pub tracker: TrackerConfig,
    pub provider: ProviderConfig,
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = toml::to_string_pretty(self).context("serializing config")?;
        fs::write(path.as_ref(), raw)
            .with_context(|| format!("writing config file {}", path.as_ref().display()))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("OLLAMA_BASE_URL")
            && !url.trim().is_empty()
        {
            self.provider.ollama_base_url = url;
        }
        if let Ok(secs) = env::var("PROMPTSTAGE_SCRIPT_TIMEOUT_SECS")
            && let Ok(secs) = secs.parse()
        {
            self.script.timeout_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.script.timeout_secs, 30);
        assert_eq!(config.pipeline.stage5_prompt_source, PromptSource::Stage2);
        assert!(!config.tracker.enabled);
        assert_eq!(config.provider.default_provider, "ollama");
    }

    #[test]
    fn empty_file_parses_to_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.script.timeout_secs, 30);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            "[script]\ntimeout_secs = 5\n\n[pipeline]\nstage5_prompt_source = \"stage1\"\n",
        )
        .unwrap();
        assert_eq!(config.script.timeout_secs, 5);
        assert_eq!(config.pipeline.stage5_prompt_source, PromptSource::Stage1);
        assert_eq!(config.script.max_call_levels, 64);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");

        let mut config = EngineConfig::default();
        config.tracker.enabled = true;
        config.script.timeout_secs = 12;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert!(loaded.tracker.enabled);
        assert_eq!(loaded.script.timeout_secs, 12);
    }

    #[test]
    fn missing_file_is_defaults() {
        let loaded = EngineConfig::load("/nonexistent/engine.toml").unwrap();
        assert_eq!(loaded.script.timeout_secs, 30);
    }
}
