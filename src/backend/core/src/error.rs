//! Error handling for the synchronization engine.
//!
//! This module provides:
//! - A single error type carrying a stable [`ErrorCode`]
//! - Namespaced client codes (`model.not-found`, ...) that are safe to put on the wire
//! - User-facing vs internal messages (internal detail never leaves the process)
//! - Severity-aware logging and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use modelsync_core::error::{SyncError, ErrorCode, Result};
//!
//! fn lookup(name: &str) -> Result<()> {
//!     Err(SyncError::unknown_entity_type(name))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Generic client code used whenever the real cause must not leak.
pub const GENERIC_CLIENT_CODE: &str = "model";

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The Dispatcher has no factory for the requested entity type
    UnknownEntityType,
    /// The request names a method other than read/write/delete
    UnknownMethod,
    /// The inbound frame could not be decoded
    InvalidRequest,
    /// An authorize hook rejected the request
    AuthorizationFailed,
    /// A validate hook rejected the request
    ValidationFailed,
    /// The model reached its terminal state
    ModelDestroyed,
    /// The database rejected the operation
    StoreFailure,
    /// An entity type was registered twice
    DuplicateEntityType,
    /// Configuration could not be loaded or is inconsistent
    ConfigurationError,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// The namespaced code sent to clients.
    pub const fn client_code(&self) -> &'static str {
        match self {
            Self::UnknownEntityType => "model.not-found",
            Self::UnknownMethod => "model.method-not-found",
            Self::InvalidRequest => "model.invalid-request",
            Self::AuthorizationFailed => "model.unauthorized",
            Self::ValidationFailed => "model.invalid",
            Self::ModelDestroyed => "model.destroyed",
            Self::StoreFailure
            | Self::DuplicateEntityType
            | Self::ConfigurationError
            | Self::Internal => GENERIC_CLIENT_CODE,
        }
    }

    /// HTTP status used by the one-shot HTTP transport.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::UnknownEntityType => StatusCode::NOT_FOUND,
            Self::UnknownMethod | Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::AuthorizationFailed => StatusCode::FORBIDDEN,
            Self::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ModelDestroyed | Self::DuplicateEntityType => StatusCode::CONFLICT,
            Self::StoreFailure => StatusCode::BAD_GATEWAY,
            Self::ConfigurationError | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure is caused by the request itself rather than the server.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownEntityType
                | Self::UnknownMethod
                | Self::InvalidRequest
                | Self::AuthorizationFailed
                | Self::ValidationFailed
                | Self::ModelDestroyed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The engine's error type.
///
/// Cheap to clone: a failed coalesced read hands the same error to every
/// waiter, so the source is reference counted.
#[derive(Debug, Clone)]
pub struct SyncError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Client code override supplied by a hook (validated on output)
    custom_code: Option<String>,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl SyncError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            custom_code: None,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        }
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::Internal, "An internal error occurred", message)
    }

    pub fn unknown_entity_type(name: &str) -> Self {
        Self::new(
            ErrorCode::UnknownEntityType,
            format!("Unknown entity type: {}", name),
        )
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(ErrorCode::UnknownMethod, format!("Unknown method: {}", method))
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Rejection raised by an authorize hook.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::AuthorizationFailed, message)
    }

    /// Rejection raised by a validate hook.
    pub fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn destroyed(identifier: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ModelDestroyed,
            format!("Model {} has been destroyed", identifier),
        )
    }

    /// A database rejection. The detail is kept internal.
    pub fn store(internal_message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreFailure,
            "The data store rejected the operation",
            internal_message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a hook-provided client code such as `task.forbidden`.
    pub fn with_client_code(mut self, code: impl Into<String>) -> Self {
        self.custom_code = Some(code.into());
        self
    }

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// The code that may be shown to a client.
    ///
    /// Hook-provided codes pass through only when namespaced; anything else
    /// collapses to the generic `model` code.
    pub fn client_code(&self) -> Cow<'static, str> {
        match self.custom_code {
            Some(ref custom) if is_namespaced(custom) => Cow::Owned(custom.clone()),
            Some(_) => Cow::Borrowed(GENERIC_CLIENT_CODE),
            None => Cow::Borrowed(self.code.client_code()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error at a level matching its cause and count it.
    pub fn log(&self) {
        let code = self.code.to_string();
        let client_code = self.client_code();

        if self.code.is_client_error() {
            debug!(
                error_code = %code,
                client_code = %client_code,
                user_message = %self.user_message,
                "Request rejected"
            );
        } else if self.code == ErrorCode::StoreFailure {
            warn!(
                error_code = %code,
                client_code = %client_code,
                internal_message = ?self.internal_message,
                "Store failure"
            );
        } else {
            error!(
                error_code = %code,
                client_code = %client_code,
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                source = ?self.source,
                "Internal error"
            );
        }

        counter!("modelsync_errors_total", "code" => code).increment(1);
    }
}

/// `segment.segment[...]`, each segment non-empty, no whitespace.
fn is_namespaced(code: &str) -> bool {
    code.contains('.')
        && !code.chars().any(char::is_whitespace)
        && code.split('.').all(|segment| !segment.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidRequest,
            "Malformed request",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            err.to_string(),
        )
        .with_source(err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body for the HTTP surface. Mirrors the websocket error payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        self.log();
        let body = ErrorBody {
            error: self.client_code().into_owned(),
        };
        (self.code.http_status(), Json(body)).into_response()
    }
}
