use thiserror::Error;

/// A textual address that does not follow the active address grammar.
///
/// Raised by the address codec, the multi-segment address parser and the
/// peer exchange format. Never retried: the input itself is bad.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed address {input:?}: {reason}")]
pub struct MalformedAddress {
    pub input: String,
    pub reason: String,
}

impl MalformedAddress {
    pub fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
