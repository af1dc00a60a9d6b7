//! Wire contract between the manager and the builder.
//!
//! | Request                  | Body           | Success | Pending |
//! |--------------------------|----------------|---------|---------|
//! | `POST /claim`            | empty          | 200     |         |
//! | `PUT /provision`         | manifest       | 201     |         |
//! | `POST /populate`         | empty or tar   | 200     |         |
//! | `POST /build`            | `BuildRequest` | 201     |         |
//! | `GET /progress`          |                | 200     | 202     |
//! | `GET /export?path=<rel>` |                | 200     |         |
//! | `POST /done`             | empty          | 200     |         |
//!
//! Any request made in the wrong phase is answered with `409`.

use serde::{Deserialize, Serialize};

pub const CLAIM: &str = "/claim";
pub const PROVISION: &str = "/provision";
pub const POPULATE: &str = "/populate";
pub const BUILD: &str = "/build";
pub const PROGRESS: &str = "/progress";
pub const EXPORT: &str = "/export";
pub const DONE: &str = "/done";

/// Body of `POST /build`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildRequest {
    /// Pipeline names passed to the engine as `--export`.
    #[serde(default)]
    pub pipelines: Vec<String>,
    /// `KEY=VALUE` declarations layered onto the engine's environment.
    #[serde(default)]
    pub environments: Vec<String>,
}

/// Query of `GET /export`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportQuery {
    pub path: Option<String>,
}
