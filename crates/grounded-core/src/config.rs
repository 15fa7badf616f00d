//! Runtime configuration.
//!
//! Loading flow:
//! 1. Compiled defaults ([`Settings::default`])
//! 2. Optional JSON file; fields it omits keep their defaults
//! 3. `GROUNDED_*` environment overrides (highest priority)
//!
//! Secrets never live in [`Settings`]; they are read separately with
//! [`secret_from_env`].

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::SamplingParams;

const TOOL_TIMEOUT_RANGE: (u64, u64) = (100, 600_000);
const AGENT_POLL_TIMEOUT_RANGE: (u64, u64) = (1_000, 3_600_000);
const AGENT_POLL_INTERVAL_RANGE: (u64, u64) = (50, 60_000);

/// Knobs the orchestration layer reads at call time.
pub trait ConfigProvider: Send + Sync {
    fn streaming_enabled(&self) -> bool;
    /// Upper bound for a single tool call.
    fn tool_timeout(&self) -> Duration;
    /// Upper bound for waiting on an agent run to reach a terminal state.
    fn agent_poll_timeout(&self) -> Duration;
    fn agent_poll_interval(&self) -> Duration;
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub streaming_enabled: bool,
    pub tool_timeout_ms: u64,
    pub agent_poll_timeout_ms: u64,
    pub agent_poll_interval_ms: u64,
    pub system_prompt: Option<String>,
    pub provider: ProviderSettings,
    /// Sent with every chat request.
    pub sampling: SamplingParams,
    /// Document index name reported on internal-search citations.
    pub internal_index: Option<String>,
    /// Remote tool-execution endpoint. When set, tool calls are posted there
    /// instead of being dispatched locally.
    pub tool_endpoint: Option<String>,
    pub search_proxy: Option<SearchProxySettings>,
    pub agent: Option<AgentSettings>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchProxySettings {
    pub url: String,
    pub top: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub base_url: String,
    pub key: String,
    pub name: String,
    pub model: String,
    pub instructions: String,
    /// How long a created agent may be reused before it is recreated.
    pub cache_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            streaming_enabled: true,
            tool_timeout_ms: 30_000,
            agent_poll_timeout_ms: 300_000,
            agent_poll_interval_ms: 1_000,
            system_prompt: None,
            provider: ProviderSettings::default(),
            sampling: SamplingParams::default(),
            internal_index: None,
            tool_endpoint: None,
            search_proxy: None,
            agent: None,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
        }
    }
}

impl Default for SearchProxySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            top: 5,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            key: "grounded-web-rag-agent".into(),
            name: "grounded-web-rag".into(),
            model: "gpt-4o".into(),
            instructions: "Answer using the available search tools and cite your sources.".into(),
            cache_ttl_secs: 3_600,
        }
    }
}

impl Settings {
    /// Load settings from an optional JSON file, then apply env overrides.
    /// A missing file is not an error. Out-of-range durations from the file
    /// are clamped to the same bounds the env overrides accept.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                debug!(path = ?p, "loading settings from file");
                let content = std::fs::read_to_string(p)?;
                let mut parsed: Self = serde_json::from_str(&content)?;
                parsed.clamp_durations();
                parsed
            }
            Some(p) => {
                debug!(path = ?p, "settings file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        apply_env_overrides(&mut settings);
        Ok(settings)
    }

    /// Pull every duration knob into its accepted range.
    pub fn clamp_durations(&mut self) {
        clamp_field("tool_timeout_ms", &mut self.tool_timeout_ms, TOOL_TIMEOUT_RANGE);
        clamp_field(
            "agent_poll_timeout_ms",
            &mut self.agent_poll_timeout_ms,
            AGENT_POLL_TIMEOUT_RANGE,
        );
        clamp_field(
            "agent_poll_interval_ms",
            &mut self.agent_poll_interval_ms,
            AGENT_POLL_INTERVAL_RANGE,
        );
    }
}

fn clamp_field(key: &str, value: &mut u64, (min, max): (u64, u64)) {
    let clamped = (*value).clamp(min, max);
    if clamped != *value {
        warn!(key, value = *value, clamped, "setting out of range, clamped");
        *value = clamped;
    }
}

impl ConfigProvider for Settings {
    fn streaming_enabled(&self) -> bool {
        self.streaming_enabled
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    fn agent_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_poll_timeout_ms)
    }

    fn agent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.agent_poll_interval_ms)
    }
}

/// Apply `GROUNDED_*` process environment overrides.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_with(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup. Invalid values are logged
/// and ignored.
pub fn apply_overrides_with(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |key: &str| lookup(key).filter(|v| !v.is_empty());
    let ranged = |key: &str, (min, max): (u64, u64)| {
        let val = string(key)?;
        let parsed = val.parse::<u64>().ok().filter(|v| (min..=max).contains(v));
        if parsed.is_none() {
            warn!(key, value = %val, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(val) = string("GROUNDED_STREAMING") {
        match parse_bool(&val) {
            Some(v) => settings.streaming_enabled = v,
            None => warn!(key = "GROUNDED_STREAMING", value = %val, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = ranged("GROUNDED_TOOL_TIMEOUT_MS", TOOL_TIMEOUT_RANGE) {
        settings.tool_timeout_ms = v;
    }
    if let Some(v) = ranged("GROUNDED_AGENT_POLL_TIMEOUT_MS", AGENT_POLL_TIMEOUT_RANGE) {
        settings.agent_poll_timeout_ms = v;
    }
    if let Some(v) = ranged("GROUNDED_AGENT_POLL_INTERVAL_MS", AGENT_POLL_INTERVAL_RANGE) {
        settings.agent_poll_interval_ms = v;
    }
    if let Some(v) = string("GROUNDED_SYSTEM_PROMPT") {
        settings.system_prompt = Some(v);
    }
    if let Some(v) = string("GROUNDED_BASE_URL") {
        settings.provider.base_url = v;
    }
    if let Some(v) = string("GROUNDED_MODEL") {
        settings.provider.model = v;
    }
    if let Some(v) = string("GROUNDED_TOOL_ENDPOINT") {
        settings.tool_endpoint = Some(v);
    }
    if let Some(v) = string("GROUNDED_SEARCH_PROXY_URL") {
        settings.search_proxy.get_or_insert_with(SearchProxySettings::default).url = v;
    }
    if let Some(v) = string("GROUNDED_AGENT_BASE_URL") {
        settings.agent.get_or_insert_with(AgentSettings::default).base_url = v;
    }
}

/// Read a secret from the environment. Empty values count as unset.
pub fn secret_from_env(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert!(s.streaming_enabled());
        assert_eq!(s.tool_timeout(), Duration::from_secs(30));
        assert_eq!(s.agent_poll_timeout(), Duration::from_secs(300));
        assert_eq!(s.agent_poll_interval(), Duration::from_secs(1));
        assert!(s.agent.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: Settings = serde_json::from_str(
            r#"{"tool_timeout_ms": 5000, "provider": {"model": "gpt-4o-mini"}}"#,
        )
        .unwrap();
        assert_eq!(s.tool_timeout_ms, 5000);
        assert_eq!(s.provider.model, "gpt-4o-mini");
        assert_eq!(s.provider.base_url, ProviderSettings::default().base_url);
        assert!(s.streaming_enabled);
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = Settings::default();
        apply_overrides_with(
            &mut s,
            lookup(&[
                ("GROUNDED_STREAMING", "off"),
                ("GROUNDED_TOOL_TIMEOUT_MS", "2500"),
                ("GROUNDED_MODEL", "local-model"),
                ("GROUNDED_SEARCH_PROXY_URL", "http://proxy/search"),
            ]),
        );
        assert!(!s.streaming_enabled);
        assert_eq!(s.tool_timeout_ms, 2500);
        assert_eq!(s.provider.model, "local-model");
        assert_eq!(s.search_proxy.as_ref().map(|p| p.url.as_str()), Some("http://proxy/search"));
        assert_eq!(s.search_proxy.as_ref().map(|p| p.top), Some(5));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = Settings::default();
        apply_overrides_with(
            &mut s,
            lookup(&[
                ("GROUNDED_STREAMING", "maybe"),
                ("GROUNDED_TOOL_TIMEOUT_MS", "5"),
                ("GROUNDED_AGENT_POLL_INTERVAL_MS", "abc"),
                ("GROUNDED_MODEL", ""),
            ]),
        );
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("grounded-settings-does-not-exist.json");
        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.tool_timeout_ms, Settings::default().tool_timeout_ms);
    }

    #[test]
    fn file_durations_are_clamped() {
        let path = std::env::temp_dir().join(format!(
            "grounded-settings-clamp-{}.json",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"{"agent_poll_interval_ms": 0, "tool_timeout_ms": 99999999, "agent_poll_timeout_ms": 60000}"#,
        )
        .unwrap();
        let s = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(s.agent_poll_interval_ms, 50);
        assert_eq!(s.tool_timeout_ms, 600_000);
        assert_eq!(s.agent_poll_timeout_ms, 60_000);
    }

    #[test]
    fn sampling_and_index_from_json() {
        let s: Settings = serde_json::from_str(
            r#"{"sampling": {"temperature": 0.2, "max_tokens": 800}, "internal_index": "kb-docs"}"#,
        )
        .unwrap();
        assert_eq!(s.sampling.temperature, Some(0.2));
        assert_eq!(s.sampling.max_tokens, Some(800));
        assert!(s.sampling.top_p.is_none());
        assert_eq!(s.internal_index.as_deref(), Some("kb-docs"));
        assert_eq!(Settings::default().sampling, SamplingParams::default());
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
    }
}
