//! Configuration for the `eddie` shell.
//!
//! Settings come from an optional YAML file and from the command line, with
//! command-line values taking precedence.  [`EddieConfig`] then builds the
//! pieces a session needs: the completion client, the memory store and the
//! [`SessionConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::CompletionClient;
use crate::error::{Error, Result};
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::memory::MemoryStore;
use crate::prompt::{DEFAULT_FIRST_MESSAGE, DEFAULT_PERSONA};
use crate::session::{DEFAULT_MAX_TOOL_ITERATIONS, DEFAULT_MODEL, SessionConfig};

const CONFIG_FILE: &str = "config.yaml";

/// Command-line arguments for the eddie shell.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct EddieArgs {
    /// Path to a YAML configuration file.
    #[arrrg(optional, "YAML config file (default: <config dir>/eddie/config.yaml)", "FILE")]
    pub config: Option<String>,

    /// Model to use for chat.
    #[arrrg(optional, "Model to use (default: gpt-4o)", "MODEL")]
    pub model: Option<String>,

    /// Base URL of an OpenAI-compatible endpoint.
    #[arrrg(optional, "Endpoint base URL (e.g. http://localhost:11434/v1)", "URL")]
    pub base_url: Option<String>,

    /// Where memories are stored.
    #[arrrg(optional, "Memory file (default: <config dir>/eddie/memories.json)", "FILE")]
    pub memory_file: Option<String>,

    /// Messages kept between turns.
    #[arrrg(optional, "Messages kept in history (default: 30)", "N")]
    pub history_limit: Option<u32>,

    /// Tool rounds allowed per turn.
    #[arrrg(optional, "Tool rounds allowed per turn (default: 5)", "N")]
    pub max_tool_iterations: Option<u32>,
}

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EddieConfig {
    /// The model to request completions from.
    pub model: String,
    /// Endpoint base URL; the public OpenAI endpoint when unset.
    pub base_url: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Memory file; the per-user default when unset.
    pub memory_path: Option<PathBuf>,
    /// Messages kept in history between turns.
    pub history_limit: usize,
    /// Tool rounds allowed per turn.
    pub max_tool_iterations: usize,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional cap on tokens per completion.
    pub max_tokens: Option<u32>,
    /// The persona at the head of the system instructions.
    pub persona: String,
    /// The greeting the assistant opens with.
    pub first_message: String,
}

impl Default for EddieConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: None,
            timeout_secs: None,
            memory_path: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            temperature: None,
            max_tokens: None,
            persona: DEFAULT_PERSONA.to_string(),
            first_message: DEFAULT_FIRST_MESSAGE.to_string(),
        }
    }
}

impl EddieConfig {
    /// Parse a YAML document.  Missing keys keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|err| {
            Error::io(format!("failed to read config {}", path.display()), err)
        })?;
        Self::from_yaml(&yaml)
    }

    /// The per-user config file location, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("eddie").join(CONFIG_FILE))
    }

    /// Resolve the configuration for `args`.
    ///
    /// An explicit `--config` file must exist.  Otherwise the per-user file
    /// is read when present.  Command-line values override the file.
    pub fn load(args: &EddieArgs) -> Result<Self> {
        let base = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|path| path.exists()) {
                Some(path) => {
                    debug!(path = %path.display(), "reading config");
                    Self::from_file(path)?
                }
                None => Self::default(),
            },
        };
        let config = base.with_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides.
    pub fn with_args(mut self, args: &EddieArgs) -> Self {
        if let Some(model) = &args.model {
            self.model = model.clone();
        }
        if let Some(base_url) = &args.base_url {
            self.base_url = Some(base_url.clone());
        }
        if let Some(memory_file) = &args.memory_file {
            self.memory_path = Some(PathBuf::from(memory_file));
        }
        if let Some(limit) = args.history_limit {
            self.history_limit = limit as usize;
        }
        if let Some(rounds) = args.max_tool_iterations {
            self.max_tool_iterations = rounds as usize;
        }
        self
    }

    /// Check values that would make a session unusable.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::validation(
                "model must not be empty",
                Some("model".to_string()),
            ));
        }
        if self.history_limit == 0 {
            return Err(Error::validation(
                "history_limit must be at least 1",
                Some("history_limit".to_string()),
            ));
        }
        if let Some(temperature) = self.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(Error::validation(
                format!("temperature must be between 0.0 and 2.0, got {temperature}"),
                Some("temperature".to_string()),
            ));
        }
        Ok(())
    }

    /// The session settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_model(self.model.clone())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_history_limit(self.history_limit)
            .with_max_tool_iterations(self.max_tool_iterations)
            .with_persona(self.persona.clone())
            .with_first_message(self.first_message.clone())
    }

    /// A client for the configured endpoint.  The API key comes from the
    /// environment.
    pub fn client(&self) -> Result<CompletionClient> {
        CompletionClient::with_options(
            None,
            self.base_url.clone(),
            self.timeout_secs.map(Duration::from_secs),
        )
    }

    /// The configured memory store.
    pub fn memory_store(&self) -> Result<MemoryStore> {
        match &self.memory_path {
            Some(path) => Ok(MemoryStore::open(path.clone())),
            None => MemoryStore::open_default(),
        }
    }
}

impl From<EddieArgs> for EddieConfig {
    fn from(args: EddieArgs) -> Self {
        EddieConfig::default().with_args(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EddieConfig::default();
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.history_limit, 30);
        assert_eq!(config.max_tool_iterations, 5);
        assert!(config.base_url.is_none());
        assert!(config.memory_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EddieConfig::from_yaml(
            "model: llama3.1\nbase_url: http://localhost:11434/v1\ntemperature: 0.4\n",
        )
        .unwrap();
        assert_eq!(config.model, "llama3.1");
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:11434/v1"));
        assert_eq!(config.temperature, Some(0.4));
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.first_message, DEFAULT_FIRST_MESSAGE);
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(EddieConfig::from_yaml("").unwrap(), EddieConfig::default());
    }

    #[test]
    fn bad_yaml_is_a_serialization_error() {
        let err = EddieConfig::from_yaml("history_limit: [1, 2").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn args_override_file() {
        let file = EddieConfig::from_yaml("model: llama3.1\nhistory_limit: 12\n").unwrap();
        let args = EddieArgs {
            model: Some("gpt-4o-mini".to_string()),
            memory_file: Some("/tmp/eddie-memories.json".to_string()),
            max_tool_iterations: Some(2),
            ..EddieArgs::default()
        };
        let config = file.with_args(&args);
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.history_limit, 12);
        assert_eq!(config.max_tool_iterations, 2);
        assert_eq!(
            config.memory_path,
            Some(PathBuf::from("/tmp/eddie-memories.json"))
        );
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eddie.yaml");
        fs::write(&path, "model: mistral\nmax_tokens: 512\n").unwrap();
        let args = EddieArgs {
            config: Some(path.display().to_string()),
            history_limit: Some(8),
            ..EddieArgs::default()
        };
        let config = EddieConfig::load(&args).unwrap();
        assert_eq!(config.model, "mistral");
        assert_eq!(config.max_tokens, Some(512));
        assert_eq!(config.history_limit, 8);
    }

    #[test]
    fn load_fails_on_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = EddieArgs {
            config: Some(dir.path().join("absent.yaml").display().to_string()),
            ..EddieArgs::default()
        };
        assert!(EddieConfig::load(&args).unwrap_err().is_persistence());
    }

    #[test]
    fn zero_history_limit_is_rejected() {
        let args = EddieArgs {
            history_limit: Some(0),
            ..EddieArgs::default()
        };
        let config = EddieConfig::from(args);
        assert!(config.validate().unwrap_err().is_validation());
    }

    #[test]
    fn session_config_carries_settings() {
        let config = EddieConfig {
            model: "llama3.1".to_string(),
            temperature: Some(0.7),
            history_limit: 10,
            ..EddieConfig::default()
        };
        let session = config.session_config();
        assert_eq!(session.model, "llama3.1");
        assert_eq!(session.temperature, Some(0.7));
        assert_eq!(session.history_limit, 10);
        assert_eq!(session.max_tool_iterations, DEFAULT_MAX_TOOL_ITERATIONS);
    }

    #[test]
    fn memory_store_uses_configured_path() {
        let config = EddieConfig {
            memory_path: Some(PathBuf::from("/tmp/somewhere/memories.json")),
            ..EddieConfig::default()
        };
        assert_eq!(
            config.memory_store().unwrap().path(),
            Path::new("/tmp/somewhere/memories.json")
        );
    }
}
