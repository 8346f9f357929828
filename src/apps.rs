use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Error, Result};
use flex_plugin::Plugin;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

use crate::{
    config::{ConfigManager, FlexConfig},
    controller::{self, FlexibilityState},
    feature_flags::FeatureFlagsService,
    plugin::PluginManager,
    service_discovery::ServiceDiscoveryService,
};

/// Owns the registries and background tasks of one running service.
pub struct App {
    config: FlexConfig,
    state: FlexibilityState,
    cleanup_task: Option<JoinHandle<()>>,
}

impl App {
    /// Bootstraps the flexibility layer:
    ///   - resolves configuration
    ///   - seeds feature flags from `FEATURE_FLAGS` + defaults
    ///   - registers the internal services
    ///   - registers `plugins` in order
    ///   - starts the stale-service sweep if an interval is configured
    pub async fn bootstrap(config: ConfigManager, plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, Error> {
        let config = FlexConfig::load(&config)
            .await
            .context("could not resolve configuration")?;

        let flags = FeatureFlagsService::from_config(&config);
        let services = ServiceDiscoveryService::from_config(&config);
        let plugin_manager = PluginManager::new(config.hook_timeout);
        plugin_manager.register_all(plugins).await;

        let cleanup_task = config.cleanup_interval.map(|every| {
            info!("Sweeping stale services every {}s", every.as_secs());
            services.spawn_cleanup_task(every)
        });

        Ok(Self {
            state: FlexibilityState {
                flags,
                services,
                plugins: plugin_manager,
            },
            config,
            cleanup_task,
        })
    }

    pub fn config(&self) -> &FlexConfig {
        &self.config
    }

    pub fn state(&self) -> FlexibilityState {
        self.state.clone()
    }

    pub fn router(&self) -> axum::Router {
        controller::router(self.state())
    }

    /// Serve HTTP on the configured address until `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F) -> Result<SocketAddr>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("could not bind {}", self.config.bind_addr))?;
        let addr = listener.local_addr()?;
        info!("Flexibility API listening on http://{addr}/flexibility");

        if let Err(e) = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {e}");
            return Err(e.into());
        }
        Ok(addr)
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.cleanup_task.as_ref() {
            handle.abort();
        }
        info!("Flexibility layer shut down");
    }
}
