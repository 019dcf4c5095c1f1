//! Error types for step execution

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccordError {
    #[error("No application found for url prefix: {0}")]
    UnknownApplication(String),

    #[error("No url prefix found in: {0}")]
    MissingUrlPrefix(String),

    #[error("Unable to find variable {0} in test context")]
    VariableNotFound(String),

    #[error("Invalid JSON path \"{path}\": {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("No step matches phrase: {0}")]
    UnknownPhrase(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Path \"{path}\" not found in JSON")]
    PathNotFound { path: String },

    #[error("JSON at path \"{path}\" is not a list")]
    NotAList { path: String },

    #[error("Server application {prefix} failed to start within {timeout:?}")]
    ApplicationNotReady { prefix: String, timeout: Duration },

    #[error("Failed to connect to {target} after {attempts} attempts: {reason}")]
    ConnectFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("{} of {total} table rows failed: {}", .failures.len(), RowFailures(.failures))]
    RowsFailed {
        total: usize,
        failures: Vec<(usize, AccordError)>,
    },

    #[error("No response recorded yet on this worker")]
    NoResponse,

    #[error("{fixture} fixture is not configured")]
    FixtureDisabled { fixture: &'static str },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Mail parse error: {0}")]
    MailParse(#[from] mailparse::MailParseError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

pub type AccordResult<T> = Result<T, AccordError>;

/// Failure categories driving retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal, surfaces immediately and is never retried
    Configuration,
    /// Step-level mismatch, retried inside polling loops
    Assertion,
    /// Infrastructure hiccup such as connection refused
    Transient,
    Other,
}

impl AccordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccordError::UnknownApplication(_)
            | AccordError::MissingUrlPrefix(_)
            | AccordError::VariableNotFound(_)
            | AccordError::InvalidPath { .. }
            | AccordError::UnknownPhrase(_)
            | AccordError::InvalidConfig(_)
            | AccordError::FixtureDisabled { .. } => ErrorKind::Configuration,
            AccordError::AssertionFailed(_)
            | AccordError::PathNotFound { .. }
            | AccordError::NotAList { .. }
            | AccordError::NoResponse => ErrorKind::Assertion,
            AccordError::ApplicationNotReady { .. }
            | AccordError::ConnectFailed { .. }
            | AccordError::Http(_)
            | AccordError::Io(_) => ErrorKind::Transient,
            _ => ErrorKind::Other,
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        AccordError::AssertionFailed(message.into())
    }
}

struct RowFailures<'a>(&'a [(usize, AccordError)]);

impl fmt::Display for RowFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (index, err)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "row {} ({})", index + 1, err)?;
        }
        Ok(())
    }
}

/// Fails with an assertion error unless `condition` holds
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> AccordResult<()> {
    if condition {
        Ok(())
    } else {
        Err(AccordError::AssertionFailed(message()))
    }
}
