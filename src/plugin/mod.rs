pub mod analytics;
pub mod audit;
pub mod manager;

use std::sync::Arc;

use flex_plugin::Plugin;

pub use analytics::AnalyticsPlugin;
pub use audit::AuditTrailPlugin;
pub use manager::{PluginInfo, PluginManager};

/// Plugins compiled into the service, registered in this order at start-up.
pub fn builtin_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(AnalyticsPlugin::new()),
        Arc::new(AuditTrailPlugin::new(AuditTrailPlugin::DEFAULT_CAPACITY)),
    ]
}
