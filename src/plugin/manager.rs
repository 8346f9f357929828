//! PluginManager: registers plugins from an explicit start-up list and fans
//! hook calls out to every plugin that handles hooks.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use flex_plugin::{HookPayload, Plugin, PluginError};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{FlexError, FlexResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub initialized: bool,
    pub handles_hooks: bool,
}

/// PluginManager owns every registered plugin, keyed by name.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Arc<DashMap<String, Arc<dyn Plugin>>>,
    /// Per-call limit for hook execution. `None` waits forever.
    hook_timeout: Option<Duration>,
}

impl PluginManager {
    pub fn new(hook_timeout: Option<Duration>) -> Self {
        Self {
            plugins: Arc::new(DashMap::new()),
            hook_timeout,
        }
    }

    /// Register one plugin.
    ///
    /// Returns `Ok(false)` when a plugin with the same name is already
    /// registered; the existing entry is kept and the newcomer is never
    /// initialized. An initialization error keeps the plugin out.
    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<bool, PluginError> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            warn!("Plugin `{name}` is already registered; keeping the existing one");
            return Ok(false);
        }

        if let Err(e) = plugin.initialize().await {
            error!("Plugin `{name}` failed to initialize: {e}");
            return Err(e);
        }

        // initialize() may have raced with another registration of the same name
        match self.plugins.entry(name.clone()) {
            Entry::Occupied(_) => {
                warn!("Plugin `{name}` was registered concurrently; keeping the existing one");
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(plugin);
                info!("Plugin `{name}` registered");
                Ok(true)
            }
        }
    }

    /// Register a start-up list in order. Failures are logged and skipped so
    /// one broken plugin does not stop the service. Returns how many were
    /// registered.
    pub async fn register_all(&self, plugins: Vec<Arc<dyn Plugin>>) -> usize {
        let mut registered = 0;
        for plugin in plugins {
            if let Ok(true) = self.register_plugin(plugin).await {
                registered += 1;
            }
        }
        info!("{registered} plugin(s) registered");
        registered
    }

    pub fn unregister_plugin(&self, name: &str) -> bool {
        let removed = self.plugins.remove(name).is_some();
        if removed {
            info!("Plugin `{name}` unregistered");
        }
        removed
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).map(|p| p.value().clone())
    }

    /// Every registered plugin, sorted by name.
    pub fn get_all_plugins(&self) -> Vec<PluginInfo> {
        let mut all: Vec<PluginInfo> = self
            .plugins
            .iter()
            .map(|kv| PluginInfo {
                name: kv.key().clone(),
                // only successfully initialized plugins are ever stored
                initialized: true,
                handles_hooks: kv.value().handles_hooks(),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Run `hook` on every plugin that handles hooks, concurrently.
    ///
    /// The result maps plugin name to that plugin's output. Plugins that fail
    /// or time out are logged and left out.
    pub async fn execute_hook(&self, hook: &str, data: HookPayload) -> BTreeMap<String, HookPayload> {
        // snapshot so no map guard is held across an await
        let targets: Vec<(String, Arc<dyn Plugin>)> = self
            .plugins
            .iter()
            .filter(|kv| kv.value().handles_hooks())
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();

        let calls = targets.into_iter().map(|(name, plugin)| {
            let data = data.clone();
            async move {
                let outcome = self.call_hook(plugin.as_ref(), hook, data).await;
                (name, outcome)
            }
        });

        join_all(calls)
            .await
            .into_iter()
            .filter_map(|(name, outcome)| match outcome {
                Ok(value) => Some((name, value)),
                Err(e) => {
                    error!("Plugin `{name}` failed hook `{hook}`: {e}");
                    None
                }
            })
            .collect()
    }

    /// Run `hook` on a single plugin.
    pub async fn execute_plugin_hook(
        &self,
        name: &str,
        hook: &str,
        data: HookPayload,
    ) -> FlexResult<HookPayload> {
        let plugin = self
            .get_plugin(name)
            .ok_or_else(|| FlexError::PluginNotFound(name.to_string()))?;
        if !plugin.handles_hooks() {
            return Err(FlexError::HookUnsupported(name.to_string()));
        }
        Ok(self.call_hook(plugin.as_ref(), hook, data).await?)
    }

    async fn call_hook(
        &self,
        plugin: &dyn Plugin,
        hook: &str,
        data: HookPayload,
    ) -> Result<HookPayload, PluginError> {
        match self.hook_timeout {
            Some(limit) => tokio::time::timeout(limit, plugin.execute_hook(hook, data))
                .await
                .map_err(|_| PluginError::Timeout(limit.as_millis() as u64))?,
            None => plugin.execute_hook(hook, data).await,
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.plugins.len())
            .field("hook_timeout", &self.hook_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A test plugin whose behaviour is chosen per instance.
    struct TestPlugin {
        name: &'static str,
        hooks: bool,
        fail_init: bool,
        fail_hook: bool,
        hang: bool,
        inits: Arc<AtomicUsize>,
    }

    impl TestPlugin {
        fn new(name: &'static str) -> Self {
            TestPlugin {
                name,
                hooks: true,
                fail_init: false,
                fail_hook: false,
                hang: false,
                inits: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            self.name
        }

        async fn initialize(&self) -> Result<(), PluginError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                Err(PluginError::Init("no database".into()))
            } else {
                Ok(())
            }
        }

        fn handles_hooks(&self) -> bool {
            self.hooks
        }

        async fn execute_hook(&self, hook: &str, data: HookPayload) -> Result<HookPayload, PluginError> {
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if self.fail_hook {
                return Err(PluginError::Hook("boom".into()));
            }
            Ok(json!({ "plugin": self.name, "hook": hook, "data": data }))
        }
    }

    #[tokio::test]
    async fn duplicate_names_keep_the_first_plugin() {
        let mgr = PluginManager::default();
        let first = TestPlugin::new("analytics");
        let second = TestPlugin::new("analytics");
        let second_inits = second.inits.clone();

        assert_eq!(mgr.register_plugin(Arc::new(first)).await, Ok(true));
        assert_eq!(mgr.register_plugin(Arc::new(second)).await, Ok(false));

        assert_eq!(mgr.get_all_plugins().len(), 1);
        assert_eq!(second_inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn init_failure_keeps_plugin_out() {
        let mgr = PluginManager::default();
        let broken = TestPlugin { fail_init: true, ..TestPlugin::new("broken") };
        let err = mgr.register_plugin(Arc::new(broken)).await.unwrap_err();
        assert_eq!(err, PluginError::Init("no database".into()));
        assert!(mgr.get_plugin("broken").is_none());
    }

    #[tokio::test]
    async fn register_all_skips_failures() {
        let mgr = PluginManager::default();
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(TestPlugin::new("a")),
            Arc::new(TestPlugin { fail_init: true, ..TestPlugin::new("b") }),
            Arc::new(TestPlugin::new("a")),
            Arc::new(TestPlugin::new("c")),
        ];
        assert_eq!(mgr.register_all(plugins).await, 2);
        let names: Vec<_> = mgr.get_all_plugins().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn failing_plugin_is_dropped_from_results() {
        let mgr = PluginManager::default();
        mgr.register_plugin(Arc::new(TestPlugin::new("one"))).await.unwrap();
        mgr.register_plugin(Arc::new(TestPlugin { fail_hook: true, ..TestPlugin::new("two") }))
            .await
            .unwrap();
        mgr.register_plugin(Arc::new(TestPlugin::new("three"))).await.unwrap();

        let results = mgr.execute_hook("submission.created", json!({"id": 7})).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["one"]["data"]["id"], 7);
        assert_eq!(results["three"]["hook"], "submission.created");
        assert!(!results.contains_key("two"));
    }

    #[tokio::test]
    async fn plugins_without_hooks_are_not_called() {
        let mgr = PluginManager::default();
        mgr.register_plugin(Arc::new(TestPlugin { hooks: false, ..TestPlugin::new("silent") }))
            .await
            .unwrap();
        assert!(mgr.execute_hook("any", json!(null)).await.is_empty());

        let err = mgr.execute_plugin_hook("silent", "any", json!(null)).await.unwrap_err();
        assert!(matches!(err, FlexError::HookUnsupported(_)));
    }

    #[tokio::test]
    async fn single_plugin_execution() {
        let mgr = PluginManager::default();
        mgr.register_plugin(Arc::new(TestPlugin::new("one"))).await.unwrap();

        let out = mgr.execute_plugin_hook("one", "ping", json!("x")).await.unwrap();
        assert_eq!(out["data"], "x");

        let err = mgr.execute_plugin_hook("ghost", "ping", json!("x")).await.unwrap_err();
        assert!(matches!(err, FlexError::PluginNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_plugin_times_out_when_limit_set() {
        let mgr = PluginManager::new(Some(Duration::from_millis(100)));
        mgr.register_plugin(Arc::new(TestPlugin { hang: true, ..TestPlugin::new("stuck") }))
            .await
            .unwrap();
        mgr.register_plugin(Arc::new(TestPlugin::new("quick"))).await.unwrap();

        let results = mgr.execute_hook("tick", json!({})).await;
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["quick"]);

        let err = mgr.execute_plugin_hook("stuck", "tick", json!({})).await.unwrap_err();
        assert!(matches!(err, FlexError::Plugin(PluginError::Timeout(100))));
    }

    #[tokio::test]
    async fn unregister_removes_plugin() {
        let mgr = PluginManager::default();
        mgr.register_plugin(Arc::new(TestPlugin::new("one"))).await.unwrap();
        assert!(mgr.unregister_plugin("one"));
        assert!(!mgr.unregister_plugin("one"));
        assert!(mgr.get_all_plugins().is_empty());
    }
}
