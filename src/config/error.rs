//! Config error types for lazynote.
//!
//! Errors render Cargo-style, with the file location and typo suggestions.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed YAML or an unknown key.
    Parse {
        path: PathBuf,
        message: String,
        suggestion: Option<String>,
    },

    /// Semantic error in otherwise well-formed YAML.
    Validation { path: PathBuf, message: String },
}

impl ConfigError {
    /// Render as a Cargo diagnostic: headline, file location, optional help.
    pub fn format_cargo_style(&self) -> String {
        let (headline, path, help) = match self {
            ConfigError::Io { path, source } => (
                "cannot read config file".to_string(),
                path,
                Some(source.to_string()),
            ),
            ConfigError::Parse {
                path,
                message,
                suggestion,
            } => (
                message.clone(),
                path,
                suggestion
                    .as_ref()
                    .map(|s| format!("help: did you mean `{}`?", s)),
            ),
            ConfigError::Validation { path, message } => (message.clone(), path, None),
        };

        let mut out = format!("error: {}\n  --> {}\n  |\n", headline, path.display());
        if let Some(help) = help {
            out.push_str(&format!("  = {}\n", help));
        }
        out
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_cargo_style())
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
