//! Error types for lia operations.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a lia-related operation.
pub type LiaResult<T> = Result<T, LiaError>;

/// An error that occurred during a lia-related operation.
#[derive(Debug, Error)]
pub enum LiaError {
    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// A request violated the schema or a value constraint.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// An operation was attempted against a task in an incompatible state.
    #[error("invalid task state: {0}")]
    InvalidState(String),

    /// No free IP address or vsock context id remains.
    #[error("resource allocation failed: {0}")]
    Allocation(String),

    /// The hypervisor failed to start or configure; carries the failing step.
    #[error("vm launch failed during {step}: {message}")]
    VmLaunch {
        /// The launch step that failed.
        step: LaunchStep,
        /// What went wrong at that step.
        message: String,
    },

    /// The vsock multiplexer handshake or the init write failed.
    #[error("relay handshake failed: {0}")]
    RelayHandshake(String),

    /// An error from the database layer.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error applying database migrations.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// An error loading or validating configuration.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Any other error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The step of the VM launch pipeline an error occurred in.
///
/// Each step maps to one entry of the VM manager's failure taxonomy, so a
/// launch failure always names where in the pipeline it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStep {
    /// Kernel or rootfs template missing before launch.
    Preflight,
    /// Host-side files, tap device, or volumes could not be prepared.
    Resources,
    /// The hypervisor process failed to spawn.
    ProcessSpawn,
    /// The control API socket never appeared.
    ApiSocket,
    /// A control API configuration call returned an error.
    Configure,
    /// The instance start action failed.
    InstanceStart,
}

/// Error payload returned to HTTP clients.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LiaError {
    /// Creates a VM launch error for the given step.
    pub fn vm_launch(step: LaunchStep, message: impl Into<String>) -> Self {
        Self::VmLaunch {
            step,
            message: message.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self {
            LaunchStep::Preflight => "preflight",
            LaunchStep::Resources => "resource setup",
            LaunchStep::ProcessSpawn => "process spawn",
            LaunchStep::ApiSocket => "api socket wait",
            LaunchStep::Configure => "configuration",
            LaunchStep::InstanceStart => "instance start",
        };
        write!(f, "{}", step)
    }
}

impl IntoResponse for LiaError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            LiaError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND", self.to_string()),
            LiaError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            LiaError::InvalidState(msg) => (StatusCode::CONFLICT, "INVALID_STATE", msg.clone()),
            LiaError::Allocation(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ALLOCATION", msg.clone())
            }
            LiaError::VmLaunch { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "VM_ERROR", self.to_string())
            }
            LiaError::RelayHandshake(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "RELAY_ERROR", self.to_string())
            }
            LiaError::Database(e) => {
                tracing::error!("database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "database error occurred".to_string(),
                )
            }
            _ => {
                tracing::error!("internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error occurred".to_string(),
                )
            }
        };

        let body = Json(ErrorBody {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}
