//! ServiceDiscoveryService: in-memory service records kept fresh by heartbeats.
//!
//! Two staleness thresholds apply to two different operations:
//! [`ServiceDiscoveryService::check_service_health`] marks a record unhealthy
//! after [`HEALTH_STALE_AFTER`], while
//! [`ServiceDiscoveryService::cleanup_stale_services`] deletes records older
//! than [`CLEANUP_STALE_AFTER`].

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FlexConfig;

pub const HEALTH_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const CLEANUP_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

pub const API_SERVICE: &str = "vulhub-api";
pub const WEBSOCKET_SERVICE: &str = "vulhub-websocket";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub health: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A heartbeat stamped in the future counts as zero age.
    fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// What a caller supplies to register a service; health and heartbeat are
/// stamped by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub version: String,
    pub endpoint: String,
    pub health: bool,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub services: Vec<ServiceSummary>,
}

#[derive(Debug, Default)]
pub struct ServiceDiscoveryService {
    services: DashMap<String, ServiceRecord>,
}

impl ServiceDiscoveryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry and register this process's own services.
    pub fn from_config(config: &FlexConfig) -> Arc<Self> {
        let service = Self::new();
        service.register_internal_services(config);
        Arc::new(service)
    }

    pub fn register_service(&self, registration: ServiceRegistration) {
        self.register_service_at(registration, Utc::now());
    }

    pub fn register_service_at(&self, registration: ServiceRegistration, now: DateTime<Utc>) {
        let record = ServiceRecord {
            name: registration.name,
            version: registration.version,
            host: registration.host,
            port: registration.port,
            health: true,
            metadata: registration.metadata,
            last_heartbeat: now,
        };
        info!(
            "Service `{}` registered at {} (v{})",
            record.name,
            record.endpoint(),
            record.version
        );
        self.services.insert(record.name.clone(), record);
    }

    pub fn unregister_service(&self, name: &str) -> bool {
        let removed = self.services.remove(name).is_some();
        if removed {
            info!("Service `{name}` unregistered");
        }
        removed
    }

    pub fn discover_service(&self, name: &str) -> Option<ServiceRecord> {
        self.services.get(name).map(|s| s.value().clone())
    }

    /// All records, sorted by name.
    pub fn get_all_services(&self) -> Vec<ServiceRecord> {
        let mut all: Vec<ServiceRecord> = self.services.iter().map(|kv| kv.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Records whose stored health flag is set.
    pub fn get_healthy_services(&self) -> Vec<ServiceRecord> {
        self.get_all_services().into_iter().filter(|s| s.health).collect()
    }

    pub fn update_service_health(&self, name: &str, healthy: bool) -> bool {
        match self.services.get_mut(name) {
            Some(mut record) => {
                if record.health != healthy {
                    info!("Service `{name}` health changed to {healthy}");
                }
                record.health = healthy;
                true
            }
            None => false,
        }
    }

    pub fn heartbeat(&self, name: &str) -> bool {
        self.heartbeat_at(name, Utc::now())
    }

    pub fn heartbeat_at(&self, name: &str, now: DateTime<Utc>) -> bool {
        match self.services.get_mut(name) {
            Some(mut record) => {
                record.last_heartbeat = now;
                record.health = true;
                debug!("Heartbeat from `{name}`");
                true
            }
            None => {
                debug!("Heartbeat for unknown service `{name}` ignored");
                false
            }
        }
    }

    /// Recompute health from heartbeat age and store it.
    pub fn check_service_health(&self, name: &str) -> bool {
        self.check_service_health_at(name, Utc::now())
    }

    pub fn check_service_health_at(&self, name: &str, now: DateTime<Utc>) -> bool {
        let Some(mut record) = self.services.get_mut(name) else {
            return false;
        };
        let healthy = record.heartbeat_age(now) < HEALTH_STALE_AFTER;
        if record.health != healthy {
            warn!("Service `{name}` health changed to {healthy} (last heartbeat {})", record.last_heartbeat);
        }
        record.health = healthy;
        healthy
    }

    /// Delete every record whose heartbeat is older than the cleanup
    /// threshold. Returns the removed names.
    pub fn cleanup_stale_services(&self) -> Vec<String> {
        self.cleanup_stale_services_at(Utc::now())
    }

    pub fn cleanup_stale_services_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        self.services.retain(|name, record| {
            let keep = record.heartbeat_age(now) <= CLEANUP_STALE_AFTER;
            if !keep {
                removed.push(name.clone());
            }
            keep
        });
        removed.sort();
        for name in &removed {
            warn!("Removed stale service `{name}`");
        }
        removed
    }

    pub fn get_service_stats(&self) -> ServiceStats {
        let services = self.get_all_services();
        let healthy = services.iter().filter(|s| s.health).count();
        ServiceStats {
            total: services.len(),
            healthy,
            unhealthy: services.len() - healthy,
            services: services
                .into_iter()
                .map(|s| ServiceSummary {
                    endpoint: s.endpoint(),
                    name: s.name,
                    version: s.version,
                    health: s.health,
                    last_heartbeat: s.last_heartbeat,
                })
                .collect(),
        }
    }

    /// Register the API and websocket services of this deployment.
    pub fn register_internal_services(&self, config: &FlexConfig) {
        let metadata = |kind: &str| {
            let mut m = Map::new();
            m.insert("environment".into(), json!(config.node_env));
            m.insert("internal".into(), json!(true));
            m.insert("kind".into(), json!(kind));
            Some(m)
        };

        self.register_service(ServiceRegistration {
            name: API_SERVICE.to_string(),
            version: config.app_version.clone(),
            host: config.host.clone(),
            port: config.port,
            metadata: metadata("http"),
        });
        self.register_service(ServiceRegistration {
            name: WEBSOCKET_SERVICE.to_string(),
            version: config.app_version.clone(),
            host: config.host.clone(),
            port: config.websocket_port,
            metadata: metadata("websocket"),
        });
    }

    /// Periodically run [`Self::cleanup_stale_services`] until the handle is
    /// aborted.
    pub fn spawn_cleanup_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = me.cleanup_stale_services();
                if !removed.is_empty() {
                    info!("Stale service sweep removed {} service(s)", removed.len());
                }
            }
        })
    }
}
