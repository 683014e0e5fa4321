//! Per-plugin lifecycle state inside a worker session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one plugin instance.
///
/// `NotLoaded -> Loaded -> Executing -> Loaded -> Unloaded`. Any state can
/// fall into `Exception` when plugin code panics; only a fresh load leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Never loaded under this name.
    NotLoaded,
    /// Ready to execute.
    Loaded,
    /// An execute call is running.
    Executing,
    /// Released.
    Unloaded,
    /// Plugin code panicked, or the state query itself failed.
    Exception,
}

impl PluginState {
    /// Whether an execute call may start from this state.
    #[inline]
    pub fn can_execute(self) -> bool {
        self == Self::Loaded
    }

    /// Whether unload is valid from this state.
    #[inline]
    pub fn can_unload(self) -> bool {
        matches!(self, Self::Loaded | Self::Exception)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotLoaded => "not_loaded",
            Self::Loaded => "loaded",
            Self::Executing => "executing",
            Self::Unloaded => "unloaded",
            Self::Exception => "exception",
        })
    }
}

/// Result of a state query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Plugin name the query was for.
    pub plugin: String,
    /// Observed state.
    pub state: PluginState,
}

impl StateSnapshot {
    /// Build a snapshot.
    pub fn new(plugin: impl Into<String>, state: PluginState) -> Self {
        Self {
            plugin: plugin.into(),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(PluginState::NotLoaded, false, false)]
    #[case(PluginState::Loaded, true, true)]
    #[case(PluginState::Executing, false, false)]
    #[case(PluginState::Unloaded, false, false)]
    #[case(PluginState::Exception, false, true)]
    fn transitions_allowed(
        #[case] state: PluginState,
        #[case] execute: bool,
        #[case] unload: bool,
    ) {
        assert_eq!(state.can_execute(), execute);
        assert_eq!(state.can_unload(), unload);
    }

    #[test]
    fn serialises_snake_case() {
        let json = serde_json::to_string(&PluginState::NotLoaded).unwrap();
        assert_eq!(json, r#""not_loaded""#);
    }
}
