//! HTTP façade over the three registries, mounted under `/flexibility`.
use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::{
    error::{FlexError, FlexResult},
    feature_flags::{FeatureFlag, FeatureFlagsService, FlagContext, FlagUpdate},
    plugin::{PluginInfo, PluginManager},
    service_discovery::{ServiceDiscoveryService, ServiceRecord, ServiceStats},
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct FlexibilityState {
    pub flags: Arc<FeatureFlagsService>,
    pub services: Arc<ServiceDiscoveryService>,
    pub plugins: PluginManager,
}

#[derive(Debug, Deserialize)]
pub struct SetFlagBody {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FlagState {
    pub flag: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub hook: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CleanupBody {
    pub removed: Vec<String>,
}

pub fn router(state: FlexibilityState) -> Router {
    let flexibility = Router::new()
        .route("/feature-flags", get(list_flags))
        .route("/feature-flags/{flag}", post(set_flag))
        .route("/feature-flags/{flag}/evaluate", get(evaluate_flag))
        .route("/plugins", get(list_plugins))
        .route("/plugins/{name}/execute", post(execute_plugin))
        .route("/hooks/{hook}", post(broadcast_hook))
        .route("/services", get(list_services))
        .route("/services/healthy", get(list_healthy_services))
        .route("/services/stats", get(service_stats))
        .route("/services/cleanup", post(cleanup_services))
        .route("/services/{name}/heartbeat", post(heartbeat));

    Router::new()
        .route("/health", get(health))
        .nest("/flexibility", flexibility)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_flags(State(state): State<FlexibilityState>) -> Json<Vec<FeatureFlag>> {
    Json(state.flags.get_all_flags())
}

async fn set_flag(
    State(state): State<FlexibilityState>,
    Path(flag): Path<String>,
    Json(body): Json<SetFlagBody>,
) -> FlexResult<Json<FlagState>> {
    if !state.flags.update_flag(&flag, FlagUpdate::enabled(body.enabled)) {
        return Err(FlexError::FlagNotFound(flag));
    }
    Ok(Json(FlagState {
        flag,
        enabled: body.enabled,
    }))
}

async fn evaluate_flag(
    State(state): State<FlexibilityState>,
    Path(flag): Path<String>,
    Query(ctx): Query<FlagContext>,
) -> Json<FlagState> {
    let ctx = ctx.with_typed_attributes();
    let enabled = state.flags.is_enabled(&flag, Some(&ctx));
    Json(FlagState { flag, enabled })
}

async fn list_plugins(State(state): State<FlexibilityState>) -> Json<Vec<PluginInfo>> {
    Json(state.plugins.get_all_plugins())
}

async fn execute_plugin(
    State(state): State<FlexibilityState>,
    Path(name): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> FlexResult<Json<Value>> {
    let out = state
        .plugins
        .execute_plugin_hook(&name, &body.hook, body.data)
        .await?;
    Ok(Json(out))
}

async fn broadcast_hook(
    State(state): State<FlexibilityState>,
    Path(hook): Path<String>,
    body: Bytes,
) -> FlexResult<Json<BTreeMap<String, Value>>> {
    // an empty body is a null payload
    let data = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| FlexError::BadRequest(e.to_string()))?
    };
    Ok(Json(state.plugins.execute_hook(&hook, data).await))
}

async fn list_services(State(state): State<FlexibilityState>) -> Json<Vec<ServiceRecord>> {
    Json(state.services.get_all_services())
}

async fn list_healthy_services(State(state): State<FlexibilityState>) -> Json<Vec<ServiceRecord>> {
    Json(state.services.get_healthy_services())
}

async fn service_stats(State(state): State<FlexibilityState>) -> Json<ServiceStats> {
    Json(state.services.get_service_stats())
}

async fn cleanup_services(State(state): State<FlexibilityState>) -> Json<CleanupBody> {
    Json(CleanupBody {
        removed: state.services.cleanup_stale_services(),
    })
}

async fn heartbeat(
    State(state): State<FlexibilityState>,
    Path(name): Path<String>,
) -> FlexResult<Json<MessageBody>> {
    if !state.services.heartbeat(&name) {
        return Err(FlexError::ServiceNotFound(name));
    }
    Ok(Json(MessageBody {
        message: format!("Heartbeat received for {name}"),
    }))
}
