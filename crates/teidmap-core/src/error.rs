//! Error types for teidmap-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for teidmap-core
#[derive(Error, Debug)]
pub enum Error {
    /// Record store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Resolver query errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialization errors
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (server bind refusal, task join failures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Store(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Resolve(_) | Self::Logging(_) => None,
            Self::Io(_) => Some(
                Remediation::new("Check that the capture feed paths exist and are readable.")
                    .alternative("Use '-' to read a decoded-message feed from stdin."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json"),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Review the bind address and restart the service.")
                    .command("Show effective config", "teidmap config"),
            ),
        }
    }
}

/// Record store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backing store cannot be reached; the single operation is aborted
    #[error("record store unavailable")]
    Unavailable,
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unavailable => Remediation::new(
                "The record store rejected the operation. Capture loops keep running; retry the query.",
            )
            .command("Health", "curl -s http://127.0.0.1:8080/health"),
        }
    }
}

/// Resolver query errors, surfaced to API clients as structured responses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No data at any fallback tier
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Missing or empty required query parameters
    #[error("{0}")]
    BadRequest(&'static str),

    /// The store failed while answering
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// Failed to read config file
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    /// Failed to parse config
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    /// Invalid config value
    #[error("Invalid config value: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Create {path} or point --config at an existing file."
            ))
            .command("Print defaults", "teidmap config > teidmap.toml"),
            Self::ReadFailed(..) => {
                Remediation::new("Check file permissions on the config file.")
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Print defaults", "teidmap config"),
            Self::SerializeFailed(_) => Remediation::new("Report this as a bug."),
            Self::ValidationError(_) => {
                Remediation::new("Correct the reported value and restart.")
                    .alternative("Remove the key to fall back to its default.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_subject() {
        let err = ResolveError::NotFound("UE IP");
        assert_eq!(err.to_string(), "UE IP not found");
    }

    #[test]
    fn store_error_converts_into_resolve_error() {
        let err: ResolveError = StoreError::Unavailable.into();
        assert_eq!(err, ResolveError::Store(StoreError::Unavailable));
        assert_eq!(err.to_string(), "record store unavailable");
    }

    #[test]
    fn remediation_renders_commands_and_alternatives() {
        let text = ConfigError::ValidationError("api.port must be non-zero".into())
            .remediation()
            .render_plain();
        assert!(text.starts_with("To fix:"));
        assert!(text.contains("Alternatives:"));

        let text = Error::Store(StoreError::Unavailable)
            .remediation()
            .unwrap()
            .render_plain();
        assert!(text.contains("Health: curl"));
    }
}
