use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::client::ClientError;
use crate::dispatch::DispatchError;
use crate::protocol::ErrorBody;
use crate::resolver::ResolveError;
use crate::session::RegistryError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly. The body is
/// `{"error": <message>, "trace": [<causes>], "code": <code>}`.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 403 - Valid principal, action not allowed.
    PermissionDenied,
    /// 403 - Terminals switched off by host config.
    Disabled(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 404 - Unknown target or terminal.
    NotFound(String),
    /// 409 - Terminal already exists.
    AlreadyExists(String),
    /// 429 - Terminal limit reached.
    CapacityExceeded(String),
    /// 503 - Server is draining.
    ShuttingDown,
    /// 502 - Remote agent unreachable or misbehaving.
    Upstream { message: String, trace: Vec<String> },
    /// Remote agent answered with an error; its status is kept.
    Remote {
        status: StatusCode,
        error: String,
        trace: Vec<String>,
    },
    /// 500 - Catch-all internal error.
    InternalError { message: String, trace: Vec<String> },
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::InternalError {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::PermissionDenied => StatusCode::FORBIDDEN,
            ApiError::Disabled(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Remote { status, .. } => *status,
            ApiError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::PermissionDenied => "permission_denied",
            ApiError::Disabled(_) => "terminals_disabled",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyExists(_) => "already_exists",
            ApiError::CapacityExceeded(_) => "capacity_exceeded",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::Upstream { .. } => "upstream_error",
            ApiError::Remote { .. } => "remote_error",
            ApiError::InternalError { .. } => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a bearer token or x-api-key and x-api-secret headers.".to_string()
            }
            ApiError::AuthInvalid => "Invalid credentials.".to_string(),
            ApiError::PermissionDenied => "Permission denied.".to_string(),
            ApiError::Disabled(detail) => detail.clone(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}", detail),
            ApiError::NotFound(detail) => detail.clone(),
            ApiError::AlreadyExists(detail) => detail.clone(),
            ApiError::CapacityExceeded(detail) => detail.clone(),
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::Upstream { message, .. } => format!("Remote agent error: {}", message),
            ApiError::Remote { error, .. } => error.clone(),
            ApiError::InternalError { message, .. } => message.clone(),
        }
    }

    pub fn trace(&self) -> Vec<String> {
        match self {
            ApiError::Upstream { trace, .. }
            | ApiError::Remote { trace, .. }
            | ApiError::InternalError { trace, .. } => trace.clone(),
            _ => Vec::new(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.message(),
            trace: self.trace(),
            code: Some(self.code().to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

/// Messages of `err`'s sources, outermost first.
fn causes(err: &dyn std::error::Error) -> Vec<String> {
    let mut trace = Vec::new();
    let mut source = err.source();
    while let Some(e) = source {
        trace.push(e.to_string());
        source = e.source();
    }
    trace
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidName(_) | RegistryError::InvalidTag(_) => {
                ApiError::InvalidRequest(err.to_string())
            }
            RegistryError::AlreadyExists(_) | RegistryError::CommandMismatch { .. } => {
                ApiError::AlreadyExists(err.to_string())
            }
            RegistryError::NotFound(_) => ApiError::NotFound(err.to_string()),
            RegistryError::CapacityExceeded(_) => ApiError::CapacityExceeded(err.to_string()),
            RegistryError::ShuttingDown => ApiError::ShuttingDown,
            RegistryError::Spawn(_) | RegistryError::ExitedImmediately(_) | RegistryError::Join(_) => {
                ApiError::InternalError {
                    message: err.to_string(),
                    trace: causes(&err),
                }
            }
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Invalid(e) => ApiError::InvalidRequest(e.to_string()),
            other => ApiError::NotFound(other.to_string()),
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Validation(e) => ApiError::InvalidRequest(e.to_string()),
            ClientError::Api { status, error, trace } => ApiError::Remote {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                error,
                trace,
            },
            other => ApiError::Upstream {
                message: other.to_string(),
                trace: causes(&other),
            },
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Resolve(e) => e.into(),
            DispatchError::Invalid(e) => ApiError::InvalidRequest(e.to_string()),
            DispatchError::Disabled(detail) => ApiError::Disabled(detail.to_string()),
            DispatchError::Registry(e) => e.into(),
            DispatchError::Remote(e) => e.into(),
            DispatchError::Spawn(_) | DispatchError::InputClosed(_) => ApiError::InternalError {
                message: err.to_string(),
                trace: causes(&err),
            },
        }
    }
}
