// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the connection pooling agent

use thiserror::Error;

use crate::key::EndpointKey;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while pooling connections
#[derive(Debug, Error)]
pub enum AgentError {
    /// Establishing a connection for a request failed
    #[error("connect to {key} failed: {source}")]
    Connect {
        /// Endpoint the connection was opened for
        key: EndpointKey,
        /// Underlying transport error
        #[source]
        source: std::io::Error,
    },

    /// An option was given a value outside its allowed set
    #[error("The argument '{name}' is invalid. Received {value}")]
    InvalidArgValue {
        /// Option name
        name: &'static str,
        /// Rejected value
        value: String,
    },

    /// A numeric option was out of range
    #[error("RangeError: The value of \"{name}\" is out of range. Received {value}")]
    OutOfRange {
        /// Option name
        name: &'static str,
        /// Rejected value
        value: String,
    },

    /// Malformed configuration source
    #[error("Configuration error: {0}")]
    Config(String),

    /// The agent was destroyed
    #[error("agent destroyed")]
    Destroyed,

    /// The request was cancelled before it received a socket
    #[error("request cancelled")]
    Cancelled,

    /// The agent task is no longer running
    #[error("agent task closed")]
    Closed,

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create an invalid argument value error
    pub fn invalid_arg(name: &'static str, value: impl ToString) -> Self {
        Self::InvalidArgValue {
            name,
            value: value.to_string(),
        }
    }

    /// Create a range error
    pub fn out_of_range(name: &'static str, value: impl ToString) -> Self {
        Self::OutOfRange {
            name,
            value: value.to_string(),
        }
    }

    /// Create a connection error for `key`
    pub fn connect(key: EndpointKey, source: std::io::Error) -> Self {
        Self::Connect { key, source }
    }

    /// Whether the error was raised while validating configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgValue { .. } | Self::OutOfRange { .. } | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AgentError::invalid_arg("scheduling", "random");
        assert_eq!(
            err.to_string(),
            "The argument 'scheduling' is invalid. Received random"
        );
        assert!(err.is_config_error());

        let err = AgentError::connect(
            EndpointKey::from("example.com:80:"),
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        );
        assert!(err.to_string().starts_with("connect to example.com:80: failed"));
        assert!(!err.is_config_error());
    }
}
