use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::primitives::parser::DEFAULT_MAX_LINE_LENGTH;

/// Tokenizer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TokenizerConfig {
    /// Keep compiled grammars by identifier
    #[serde(default = "default_true")]
    pub cache_grammars: bool,

    /// Keep parsed themes by identifier
    #[serde(default = "default_true")]
    pub cache_themes: bool,

    /// Lines longer than this many bytes are not tokenized
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Extra directories searched for `<id>.tmLanguage.json` and
    /// `<id>.tmTheme.json` before the user config directory
    #[serde(default)]
    pub grammar_dirs: Vec<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            cache_grammars: default_true(),
            cache_themes: default_true(),
            max_line_length: default_max_line_length(),
            grammar_dirs: Vec::new(),
        }
    }
}

impl TokenizerConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: TokenizerConfig =
            serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_line_length == 0 {
            return Err(ConfigError::ValidationError(
                "max_line_length must be greater than 0".to_string(),
            ));
        }

        for dir in &self.grammar_dirs {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "grammar_dirs cannot contain an empty path".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "IO error: {msg}"),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {msg}"),
            ConfigError::SerializeError(msg) => write!(f, "Serialize error: {msg}"),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
