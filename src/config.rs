use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, ToolErrorPolicy, DEFAULT_MAX_TOOL_INVOCATIONS, DEFAULT_SYSTEM_PROMPT};
use crate::error::{AgentError, Result};
use crate::extract::OutputExtractor;
use crate::provider::ProviderConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            base_url: None,
            organization: None,
        }
    }
}

fn default_model() -> String {
    "gpt-4o".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_tool_invocations")]
    pub max_tool_invocations: u32,
    /// Either empty or an opening and a closing marker.
    #[serde(default)]
    pub response_delimiters: Vec<String>,
    #[serde(default)]
    pub tool_error_policy: ToolErrorPolicy,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_tool_invocations: default_max_tool_invocations(),
            response_delimiters: Vec::new(),
            tool_error_policy: ToolErrorPolicy::default(),
        }
    }
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}

fn default_max_tool_invocations() -> u32 {
    DEFAULT_MAX_TOOL_INVOCATIONS
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| AgentError::Config(format!("Failed to parse configuration: {err}")))
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_overrides(|key| env::var(key).ok());
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg
    }

    /// Applies `AGENTWIRE_*` overrides. `OPENAI_API_KEY` only fills in a
    /// key that is still missing afterwards.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("AGENTWIRE_API_KEY") {
            self.model.api_key = Some(key);
        }
        if self.model.api_key.is_none() {
            self.model.api_key = lookup("OPENAI_API_KEY");
        }
        if let Some(model) = lookup("AGENTWIRE_MODEL") {
            self.model.model = model;
        }
        if let Some(url) = lookup("AGENTWIRE_BASE_URL") {
            self.model.base_url = Some(url);
        }
        if let Some(prompt) = lookup("AGENTWIRE_SYSTEM_PROMPT") {
            self.agent.system_prompt = prompt;
        }
        if let Some(max) = lookup("AGENTWIRE_MAX_TOOL_INVOCATIONS") {
            match max.parse::<u32>() {
                Ok(parsed) => self.agent.max_tool_invocations = parsed,
                Err(_) => tracing::warn!(value = %max, "ignoring invalid AGENTWIRE_MAX_TOOL_INVOCATIONS"),
            }
        }
        if let Some(filter) = lookup("AGENTWIRE_LOG") {
            self.logging.filter = filter;
        }
    }

    /// Builds the agent settings, rejecting delimiter lists that are not
    /// empty or a pair.
    pub fn agent_config(&self) -> Result<AgentConfig> {
        OutputExtractor::from_tags(&self.agent.response_delimiters)?;
        let response_delimiters = match self.agent.response_delimiters.as_slice() {
            [open, close] => Some((open.clone(), close.clone())),
            _ => None,
        };
        Ok(AgentConfig {
            model: self.model.model.clone(),
            system_prompt: self.agent.system_prompt.clone(),
            max_tool_invocations: self.agent.max_tool_invocations,
            response_delimiters,
            tool_error_policy: self.agent.tool_error_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    use crate::provider::ProviderTransport;

    #[test]
    fn defaults_match_the_agent_defaults() {
        let cfg = AppConfig::default();
        let agent = cfg.agent_config().unwrap();
        assert_eq!(agent.model, "gpt-4o");
        assert_eq!(agent.system_prompt, "You are a helpful assistant.");
        assert_eq!(agent.max_tool_invocations, 5);
        assert!(agent.response_delimiters.is_none());
        assert_eq!(agent.tool_error_policy, ToolErrorPolicy::Abort);
    }

    #[test]
    fn loads_sections_and_providers() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[model]
model = "gpt-4o-mini"

[agent]
max_tool_invocations = 3
response_delimiters = ["<answer>", "</answer>"]
tool_error_policy = "report_to_model"

[logging]
format = "json"

[[providers]]
name = "fs"
transport = "stdio"
command = "fs-provider"
args = ["--root-dir", "/srv/data"]

[[providers]]
name = "remote"
transport = "http"
url = "http://localhost:3000/mcp"
"#
        )
        .unwrap();

        let cfg = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.filter, "info");
        assert_eq!(cfg.providers.len(), 2);
        assert!(matches!(
            &cfg.providers[1].transport,
            ProviderTransport::Http { url, .. } if url == "http://localhost:3000/mcp"
        ));

        let agent = cfg.agent_config().unwrap();
        assert_eq!(agent.model, "gpt-4o-mini");
        assert_eq!(agent.max_tool_invocations, 3);
        assert_eq!(
            agent.response_delimiters,
            Some(("<answer>".to_string(), "</answer>".to_string()))
        );
        assert_eq!(agent.tool_error_policy, ToolErrorPolicy::ReportToModel);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut cfg = AppConfig::from_toml("[model]\napi_key = 'from-file'\n").unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("AGENTWIRE_MODEL", "gpt-4.1"),
            ("AGENTWIRE_MAX_TOOL_INVOCATIONS", "9"),
            ("OPENAI_API_KEY", "from-openai-env"),
            ("AGENTWIRE_LOG", "agentwire=debug"),
        ]);
        cfg.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.model.model, "gpt-4.1");
        assert_eq!(cfg.agent.max_tool_invocations, 9);
        assert_eq!(cfg.model.api_key.as_deref(), Some("from-file"));
        assert_eq!(cfg.logging.filter, "agentwire=debug");
    }

    #[test]
    fn openai_key_fills_missing_key() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|key| (key == "OPENAI_API_KEY").then(|| "sk-test".to_string()));
        assert_eq!(cfg.model.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn rejects_a_single_delimiter() {
        let cfg = AppConfig::from_toml("[agent]\nresponse_delimiters = ['<answer>']\n").unwrap();
        assert!(matches!(cfg.agent_config(), Err(AgentError::Config(_))));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            AppConfig::from_toml("[model\nmodel = 1"),
            Err(AgentError::Config(_))
        ));
    }
}
