//! Manager: the client half of the jobsite.
//!
//! Reads a manifest from stdin and walks one builder through every phase
//! in order. Each phase runs under its own deadline; the engine's progress
//! stream is copied to stdout and exported artifacts land under the
//! output directory.

pub mod client;
pub mod deadline;
pub mod export;
pub mod steps;
pub mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use crate::phase::Phase;

/// Per-phase deadlines on the manager side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTimeouts {
    pub claim: Duration,
    pub provision: Duration,
    pub populate: Duration,
    pub build: Duration,
    /// Bounds polling `/progress` and copying the log, not `POST /build`.
    pub progress: Duration,
    pub export: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            claim: Duration::from_secs(600),
            provision: Duration::from_secs(30),
            populate: Duration::from_secs(300),
            build: Duration::from_secs(30),
            progress: Duration::from_secs(3600),
            export: Duration::from_secs(1800),
        }
    }
}

impl StepTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Claim => self.claim,
            Phase::Provision => self.provision,
            Phase::Populate => self.populate,
            Phase::Build => self.build,
            Phase::Progress => self.progress,
            Phase::Export | Phase::Done | Phase::Error => self.export,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Identity of this manager, for logging only.
    pub manager_host: String,
    pub manager_port: u16,
    pub builder_host: String,
    pub builder_port: u16,
    pub timeouts: StepTimeouts,
    /// Passed to the builder as `BuildRequest.pipelines`.
    pub pipelines: Vec<String>,
    /// Passed to the builder as `BuildRequest.environments`.
    pub environments: Vec<String>,
    /// Relative paths fetched with `GET /export`.
    pub exports: Vec<String>,
    pub output: PathBuf,
    /// Local directory uploaded as the source store during populate.
    pub store: Option<PathBuf>,
    pub progress_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager_host: "localhost".to_string(),
            manager_port: 3333,
            builder_host: "localhost".to_string(),
            builder_port: 3333,
            timeouts: StepTimeouts::default(),
            pipelines: Vec::new(),
            environments: Vec::new(),
            exports: Vec::new(),
            output: PathBuf::from("/dev/null"),
            store: None,
            progress_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl ManagerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.builder_host, self.builder_port)
    }

    pub fn identity(&self) -> String {
        format!("{}:{}", self.manager_host, self.manager_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_defaults_match_builder_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.base_url(), "http://localhost:3333");
        assert_eq!(config.output, PathBuf::from("/dev/null"));
        assert_eq!(config.timeouts.build, Duration::from_secs(30));
        assert_eq!(config.timeouts.progress, Duration::from_secs(3600));
    }

    #[test]
    fn test_done_shares_the_export_deadline() {
        let timeouts = StepTimeouts::default();
        assert_eq!(timeouts.for_phase(Phase::Done), timeouts.export);
        assert_eq!(timeouts.for_phase(Phase::Claim), Duration::from_secs(600));
    }
}
