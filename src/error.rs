use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use flex_plugin::PluginError;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the flexibility host.
#[derive(Error, Debug)]
pub enum FlexError {
    #[error("feature flag `{0}` not found")]
    FlagNotFound(String),

    #[error("plugin `{0}` not found")]
    PluginNotFound(String),

    #[error("plugin `{0}` does not support hooks")]
    HookUnsupported(String),

    #[error("service `{0}` not found")]
    ServiceNotFound(String),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("invalid configuration for `{key}`: {reason}")]
    Config { key: String, reason: String },
}

impl FlexError {
    pub fn status(&self) -> StatusCode {
        match self {
            FlexError::FlagNotFound(_)
            | FlexError::PluginNotFound(_)
            | FlexError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            FlexError::BadRequest(_) => StatusCode::BAD_REQUEST,
            FlexError::HookUnsupported(_) | FlexError::Plugin(PluginError::HookUnsupported(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            FlexError::Plugin(PluginError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            FlexError::Plugin(_) => StatusCode::BAD_GATEWAY,
            FlexError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for FlexError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

pub type FlexResult<T> = Result<T, FlexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entities_map_to_not_found() {
        assert_eq!(FlexError::FlagNotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(FlexError::PluginNotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(FlexError::ServiceNotFound("x".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn plugin_failures_are_not_generic_500s() {
        assert_eq!(
            FlexError::HookUnsupported("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            FlexError::from(PluginError::Timeout(50)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            FlexError::from(PluginError::Hook("boom".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
