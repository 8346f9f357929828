use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use flex_plugin::{HookPayload, Plugin, PluginError};
use serde_json::{Value, json};
use tracing::debug;

/// Tags hook payloads with analytics metadata.
///
/// Object payloads get an `analytics` field; any other payload is wrapped as
/// `{ "value": <payload>, "analytics": {..} }`.
#[derive(Debug, Default)]
pub struct AnalyticsPlugin {
    ready: AtomicBool,
    sequence: AtomicU64,
}

impl AnalyticsPlugin {
    pub const NAME: &'static str = "analytics";

    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks processed so far.
    pub fn processed(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for AnalyticsPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self) -> Result<(), PluginError> {
        self.ready.store(true, Ordering::Release);
        debug!("analytics plugin ready");
        Ok(())
    }

    fn handles_hooks(&self) -> bool {
        true
    }

    async fn execute_hook(&self, hook: &str, data: HookPayload) -> Result<HookPayload, PluginError> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(PluginError::Hook("analytics plugin not initialized".into()));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let tag = json!({
            "hook": hook,
            "processedAt": Utc::now().to_rfc3339(),
            "sequence": sequence,
        });

        let out = match data {
            Value::Object(mut obj) => {
                obj.insert("analytics".into(), tag);
                Value::Object(obj)
            }
            other => json!({ "value": other, "analytics": tag }),
        };
        Ok(out)
    }
}
