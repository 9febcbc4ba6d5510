//! Error types for Vouch

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("factory error: {0}")]
    Factory(String),

    #[error("plugin '{plugin}' invocation failed: {failure}")]
    PluginInvocation {
        plugin: String,
        failure: InvocationFailure,
    },

    #[error("store error: {store} - {message}")]
    Store { store: String, message: String },

    #[error("verifier error: {verifier} - {message}")]
    Verifier { verifier: String, message: String },

    #[error("policy error: {0}")]
    Policy(String),

    #[error("invalid artifact reference: {0}")]
    InvalidReference(String),

    #[error("verification request cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why an out-of-process plugin call did not produce a usable result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationFailure {
    #[error("failed to launch: {0}")]
    Spawn(String),

    #[error("exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("plugin speaks version {declared}, supported: {supported}")]
    VersionMismatch { declared: String, supported: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn factory(message: impl Into<String>) -> Self {
        Self::Factory(message.into())
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::Policy(message.into())
    }

    pub fn invocation(plugin: impl Into<String>, failure: InvocationFailure) -> Self {
        Self::PluginInvocation {
            plugin: plugin.into(),
            failure,
        }
    }

    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            store: store.into(),
            message: message.into(),
        }
    }

    pub fn verifier(verifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Verifier {
            verifier: verifier.into(),
            message: message.into(),
        }
    }

    /// True when the error came from a deadline rather than a broken component.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::PluginInvocation {
                failure: InvocationFailure::Timeout(_),
                ..
            }
        )
    }
}
