//! Phase definition for the jobsite protocol.
//!
//! Phases are totally ordered:
//! `Claim < Provision < Populate < Build < Progress < Export < Done`,
//! with `Error` as an absorbing sink that sorts after every other phase.
//! `Progress` is only ever observed by the manager; the builder stays in
//! `Build` while the engine runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named stage in the build protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Claim,
    Provision,
    Populate,
    Build,
    Progress,
    Export,
    Done,
    Error,
}

impl Phase {
    /// Every phase in protocol order.
    pub const ALL: [Phase; 8] = [
        Phase::Claim,
        Phase::Provision,
        Phase::Populate,
        Phase::Build,
        Phase::Progress,
        Phase::Export,
        Phase::Done,
        Phase::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Claim => "claim",
            Phase::Provision => "provision",
            Phase::Populate => "populate",
            Phase::Build => "build",
            Phase::Progress => "progress",
            Phase::Export => "export",
            Phase::Done => "done",
            Phase::Error => "error",
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    ///
    /// `Error` is always reachable, even from `Error` itself.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        next == Phase::Error || next > *self
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown phase: {}", s))
    }
}
