use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flex_plugin::{HookPayload, Plugin, PluginError};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub hook: String,
    pub at: DateTime<Utc>,
}

/// Remembers the most recent hook invocations, oldest dropped first.
#[derive(Debug)]
pub struct AuditTrailPlugin {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditTrailPlugin {
    pub const NAME: &'static str = "audit-trail";
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl Plugin for AuditTrailPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn handles_hooks(&self) -> bool {
        true
    }

    async fn execute_hook(&self, hook: &str, _data: HookPayload) -> Result<HookPayload, PluginError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PluginError::Hook("audit trail lock poisoned".into()))?;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(AuditEntry {
            hook: hook.to_string(),
            at: Utc::now(),
        });
        Ok(json!({ "recorded": entries.len() }))
    }
}
