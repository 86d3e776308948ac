use crate::error::{
    AccessError, AgentError, ChannelError, ConfigError, DbError, IdentityError, OmniError,
    RegistryError, TraceStoreError,
};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

/// Structured wire error: `{error: {kind, message, detail?}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid or missing x-api-key")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = serde_json::json!({
            "kind": self.kind,
            "message": self.message,
        });
        if let Some(detail) = self.detail {
            error["detail"] = detail;
        }
        (self.status, Json(serde_json::json!({ "error": error }))).into_response()
    }
}

impl From<OmniError> for ApiError {
    fn from(err: OmniError) -> Self {
        match err {
            OmniError::Registry(e) => e.into(),
            OmniError::Access(e) => e.into(),
            OmniError::Identity(e) => e.into(),
            OmniError::TraceStore(e) => e.into(),
            OmniError::Channel(e) => e.into(),
            OmniError::Agent(e) => e.into(),
            OmniError::Config(e) => e.into(),
            OmniError::Db(e) => e.into(),
            OmniError::Other(e) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::NotFound(_) => Self::not_found(err.to_string()),
            RegistryError::AlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "conflict", err.to_string())
            }
            RegistryError::InvalidName(_) | RegistryError::MissingCredential { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_instance", err.to_string())
            }
            RegistryError::Broker(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "broker", err.to_string())
            }
            RegistryError::Sqlx(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        }
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match &err {
            AccessError::RuleNotFound(_) => Self::not_found(err.to_string()),
            AccessError::InvalidPattern(_) => Self::bad_request(err.to_string()),
            AccessError::Sqlx(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match &err {
            IdentityError::UserNotFound(_) => Self::not_found(err.to_string()),
            IdentityError::UniqueViolation { .. } => {
                Self::new(StatusCode::CONFLICT, "conflict", err.to_string())
            }
            IdentityError::Sqlx(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        }
    }
}

impl From<TraceStoreError> for ApiError {
    fn from(err: TraceStoreError) -> Self {
        match &err {
            TraceStoreError::NotFound(_) => Self::not_found(err.to_string()),
            TraceStoreError::TraceClosed(_) => {
                Self::new(StatusCode::CONFLICT, "trace_closed", err.to_string())
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string()),
        }
    }
}

impl From<ChannelError> for ApiError {
    fn from(err: ChannelError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "channel", err.to_string())
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "agent", err.to_string())
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_not_found_maps_to_404() {
        let api: ApiError = RegistryError::NotFound("acme".into()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert!(api.message.contains("acme"));
    }

    #[test]
    fn missing_credentials_map_to_422() {
        let api: ApiError = RegistryError::MissingCredential {
            channel: "whatsapp",
            field: "evolution_key",
        }
        .into();
        assert_eq!(api.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn unique_violation_maps_to_409() {
        let api: ApiError = IdentityError::UniqueViolation {
            provider: "discord".into(),
            external_id: "42".into(),
        }
        .into();
        assert_eq!(api.status, StatusCode::CONFLICT);
    }

    #[test]
    fn invalid_pattern_maps_to_400() {
        let api: ApiError = AccessError::InvalidPattern("**".into()).into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
    }
}
