//! Failure codes reported through plugin callbacks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved failure codes.
///
/// Codes are stable integers because they cross the process boundary.
/// Unknown codes decode as [`FailureType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
#[repr(i32)]
pub enum FailureType {
    /// Instantiating the plugin failed.
    LoadingPlugin = 1,
    /// Executing the plugin failed or the call was not valid in the current state.
    ExecutingPlugin = 2,
    /// Releasing the plugin failed.
    UnloadingPlugin = 3,
    /// Unclassified failure.
    Unknown = 4,
    /// Synthetic: the channel broke before the worker answered.
    Transport = 100,
}

impl FailureType {
    /// Wire code.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a wire code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::LoadingPlugin,
            2 => Self::ExecutingPlugin,
            3 => Self::UnloadingPlugin,
            100 => Self::Transport,
            _ => Self::Unknown,
        }
    }

    /// Constant-style name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadingPlugin => "ERROR_LOADING_PLUGIN",
            Self::ExecutingPlugin => "ERROR_EXECUTING_PLUGIN",
            Self::UnloadingPlugin => "ERROR_UNLOADING_PLUGIN",
            Self::Unknown => "ERROR_UNKNOWN",
            Self::Transport => "ERROR_TRANSPORT",
        }
    }
}

impl From<FailureType> for i32 {
    fn from(value: FailureType) -> Self {
        value.code()
    }
}

impl From<i32> for FailureType {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure outcome: code plus optional detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Reserved code.
    pub code: FailureType,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Failure {
    /// Failure with no detail.
    pub fn new(code: FailureType) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Attach a detail message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// `ERROR_LOADING_PLUGIN` with a message.
    pub fn loading(message: impl Into<String>) -> Self {
        Self::new(FailureType::LoadingPlugin).with_message(message)
    }

    /// `ERROR_EXECUTING_PLUGIN` with a message.
    pub fn executing(message: impl Into<String>) -> Self {
        Self::new(FailureType::ExecutingPlugin).with_message(message)
    }

    /// `ERROR_UNLOADING_PLUGIN` with a message.
    pub fn unloading(message: impl Into<String>) -> Self {
        Self::new(FailureType::UnloadingPlugin).with_message(message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Failure {}
