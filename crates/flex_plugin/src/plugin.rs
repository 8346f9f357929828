use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Arbitrary JSON passed into and returned from a hook.
pub type HookPayload = Value;

/// The one trait plugin authors implement.
///
/// Plugins are handed to the host as an explicit list at process start; the
/// host calls [`Plugin::initialize`] exactly once, before the plugin becomes
/// visible to hook dispatch.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name of the plugin. A second plugin with the same name is
    /// rejected by the host.
    fn name(&self) -> &str;

    /// One-time setup. An error keeps the plugin out of the registry.
    async fn initialize(&self) -> Result<(), PluginError>;

    /// Whether this plugin takes part in hook dispatch.
    fn handles_hooks(&self) -> bool {
        false
    }

    /// Handle a named hook and return a (possibly transformed) payload.
    async fn execute_hook(&self, hook: &str, _data: HookPayload) -> Result<HookPayload, PluginError> {
        Err(PluginError::HookUnsupported(hook.to_string()))
    }
}

/// Errors that a Plugin implementation can return.
#[derive(Error, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum PluginError {
    /// Setup failed; the plugin is not registered.
    #[error("initialization failed: {0}")]
    Init(String),

    /// The plugin does not implement hooks.
    #[error("hook `{0}` is not supported by this plugin")]
    HookUnsupported(String),

    /// The hook ran and failed.
    #[error("hook failed: {0}")]
    Hook(String),

    /// The host gave up waiting for the hook.
    #[error("hook timed out after {0} ms")]
    Timeout(u64),
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Hook(err.to_string())
    }
}
