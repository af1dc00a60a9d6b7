//! Builder: the server half of the jobsite.
//!
//! ## Overview
//!
//! A builder owns one private build directory and serves exactly one
//! build. The manager walks it through the phases over HTTP; the builder
//! writes the manifest, runs the build engine, streams the engine's stdout
//! back, and serves the exported artifacts.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────┐  HTTP  ┌──────────────────────────────────────────────┐
//! │ Manager │ ─────> │ server.rs  (listener, watchdog, signals)     │
//! │         │ <───── │   └─ api.rs  (one handler per phase)         │
//! └─────────┘        │        │ StateMachine::guard / set          │
//!                    │        v                                     │
//!                    │  state.rs   (phase tracker + event ring)     │
//!                    │        │                                     │
//!                    │        │ engine::spawn() on POST /build      │
//!                    │        v                                     │
//!                    │  engine.rs  (subprocess, stdout pump)        │
//!                    │        │                                     │
//!                    │        v                                     │
//!                    │  progress.rs (append-only log, exit latch)   │
//!                    └──────────────────────────────────────────────┘
//! ```
//!
//! The optional source archive sent with `POST /populate` is unpacked by
//! [`crate::store::unpack`].

pub mod api;
pub mod engine;
pub mod progress;
pub mod server;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::error;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::phase::Phase;
use engine::EngineHandle;
use progress::ProgressLog;
use state::StateMachine;

/// How long the builder waits in each phase for the manager's next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub claim: Duration,
    pub provision: Duration,
    pub populate: Duration,
    /// Until `POST /build` arrives. The engine itself is not bounded.
    pub build: Duration,
    pub export: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            claim: Duration::from_secs(600),
            provision: Duration::from_secs(30),
            populate: Duration::from_secs(300),
            build: Duration::from_secs(3600),
            export: Duration::from_secs(1800),
        }
    }
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::Claim => Some(self.claim),
            Phase::Provision => Some(self.provision),
            Phase::Populate => Some(self.populate),
            Phase::Build => Some(self.build),
            Phase::Export => Some(self.export),
            Phase::Progress | Phase::Done | Phase::Error => None,
        }
    }
}

/// Configuration for one builder process.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub host: String,
    pub port: u16,
    pub build_path: PathBuf,
    pub engine: PathBuf,
    pub max_body_size: usize,
    pub timeouts: PhaseTimeouts,
    /// How long to keep answering requests after entering `Error`, so the
    /// manager can observe the failure before the builder goes away.
    pub error_linger: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3333,
            build_path: PathBuf::from("/run/osbuild"),
            engine: PathBuf::from("/usr/bin/osbuild"),
            max_body_size: 256 * 1024 * 1024,
            timeouts: PhaseTimeouts::default(),
            error_linger: Duration::from_secs(10),
        }
    }
}

/// Everything one builder process knows about its build.
///
/// Handlers receive the session explicitly through axum state; nothing
/// lives in globals, so tests can start a session in any phase.
#[derive(Debug)]
pub struct BuilderSession {
    pub id: Uuid,
    pub config: BuilderConfig,
    pub state: StateMachine,
    pub progress: Arc<ProgressLog>,
    pub(crate) engine: Mutex<Option<EngineHandle>>,
    /// Serializes mutating handlers across guard, side effect, and set.
    pub(crate) ops: tokio::sync::Mutex<()>,
}

pub type SharedSession = Arc<BuilderSession>;

impl BuilderSession {
    pub fn new(config: BuilderConfig) -> Self {
        Self::starting_at(config, Phase::Claim)
    }

    pub fn starting_at(config: BuilderConfig, phase: Phase) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            state: StateMachine::starting_at(phase),
            progress: Arc::new(ProgressLog::new()),
            engine: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn build_dir(&self) -> &Path {
        &self.config.build_path
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.build_dir().join("manifest.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.build_dir().join("store")
    }

    pub(crate) fn engine_slot(&self) -> MutexGuard<'_, Option<EngineHandle>> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The engine is running right now.
    pub fn engine_running(&self) -> bool {
        self.engine_slot().is_some()
    }

    /// `POST /build` has launched the engine at some point.
    pub fn build_started(&self) -> bool {
        let slot = self.engine_slot();
        slot.is_some() || self.progress.exit().is_some()
    }

    /// Move to `Error` for failures that are the builder's fault.
    /// Client errors pass through without touching the phase.
    pub(crate) fn fail(&self, err: impl Into<ApiError>) -> ApiError {
        let err = err.into();
        if let ApiError::Internal(message) = &err {
            error!(session = %self.id, error = %message, "handler failed");
            let _ = self.state.set(Phase::Error);
        }
        err
    }

    /// Terminate and reap the engine if it is still running.
    pub async fn shutdown_engine(&self) {
        let handle = self.engine_slot().take();
        if let Some(handle) = handle {
            handle.terminate().await;
        }
    }
}
