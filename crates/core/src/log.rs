use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(CoreError::InvalidData(format!("unknown log level: {s}"))),
        }
    }
}

/// Structured event persisted for consumers outside the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub key: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEvent {
    pub fn new(key: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            level,
            message: message.into(),
        }
    }
}
