pub mod plugin;

pub use plugin::{HookPayload, Plugin, PluginError};
