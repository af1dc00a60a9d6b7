//! Typed error hierarchy for the jobsite coordinator.
//!
//! - `StateError`: rejected phase transitions on the builder
//! - `EngineError`: build engine launch failures
//! - `StoreError`: source store archive failures
//! - `ApiError`: builder HTTP failures, rendered as status codes
//! - `ManagerError`: manager step failures
//!
//! `ExitStatus` maps every way a process can end onto the four exit codes
//! shared by both binaries.

use std::path::PathBuf;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::phase::Phase;

/// Errors from the builder state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Phase regression from {from} to {to}")]
    Regression { from: Phase, to: Phase },

    #[error("Expected phase {expected} but builder is in {current}")]
    WrongPhase { expected: Phase, current: Phase },
}

/// Errors from launching the build engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn build engine {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Build engine is already running")]
    AlreadyRunning,

    #[error("Invalid environment declaration '{0}', expected KEY=VALUE")]
    BadEnvironment(String),
}

/// Errors from unpacking a source store archive.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Archive entry '{0}' escapes the store directory")]
    Escape(String),

    #[error("Archive entry '{path}' has unsupported type {kind}")]
    Unsupported { path: String, kind: String },

    #[error("Malformed archive: {0}")]
    Malformed(#[source] std::io::Error),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by builder handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    WrongPhase(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::WrongPhase(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::WrongPhase { .. } => ApiError::WrongPhase(err.to_string()),
            StateError::Regression { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::BadEnvironment(_) => ApiError::BadRequest(err.to_string()),
            EngineError::AlreadyRunning => ApiError::WrongPhase(err.to_string()),
            EngineError::Spawn { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io { .. } => ApiError::Internal(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

/// Errors from a single manager step.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Failed to read manifest from stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("{step}: got an unexpected response {status} while expecting {expected}")]
    UnexpectedStatus { step: Phase, status: u16, expected: u16 },

    #[error("{step}: timed out after {seconds}s")]
    Timeout { step: Phase, seconds: u64 },

    #[error("Request to builder failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write build progress: {0}")]
    Output(#[source] std::io::Error),

    #[error("Refusing to overwrite existing file {path}")]
    Exists { path: PathBuf },

    #[error("Export path '{0}' must be relative and stay inside the output directory")]
    InvalidExportPath(String),

    #[error("Failed to pack source store {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode build request: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Process exit status shared by the builder and the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok = 0,
    Error = 1,
    Timeout = 2,
    Signal = 3,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&ManagerError> for ExitStatus {
    fn from(err: &ManagerError) -> Self {
        match err {
            ManagerError::Timeout { .. } => ExitStatus::Timeout,
            _ => ExitStatus::Error,
        }
    }
}
