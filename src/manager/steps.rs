//! The manager's phase driver.
//!
//! Simple request/response phases are described by a [`PhaseStep`] and
//! run through [`Driver::exchange`]. Progress polling and export are
//! loops of their own. Every phase runs under [`with_deadline`].

use std::path::Path;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use super::ManagerConfig;
use super::client::BuilderClient;
use super::deadline::with_deadline;
use super::export::write_artifact;
use crate::errors::ManagerError;
use crate::paths::confine;
use crate::phase::Phase;
use crate::protocol::{self, BuildRequest};
use crate::store;

/// One request/response exchange with the builder.
#[derive(Debug, Clone)]
pub struct PhaseStep {
    pub phase: Phase,
    pub timeout: Duration,
    pub method: Method,
    pub path: &'static str,
    pub expected: StatusCode,
    pub body: Option<Vec<u8>>,
}

impl PhaseStep {
    pub fn claim(timeout: Duration) -> Self {
        Self {
            phase: Phase::Claim,
            timeout,
            method: Method::POST,
            path: protocol::CLAIM,
            expected: StatusCode::OK,
            body: None,
        }
    }

    pub fn provision(timeout: Duration, manifest: Vec<u8>) -> Self {
        Self {
            phase: Phase::Provision,
            timeout,
            method: Method::PUT,
            path: protocol::PROVISION,
            expected: StatusCode::CREATED,
            body: Some(manifest),
        }
    }

    /// An empty archive sends an empty body.
    pub fn populate(timeout: Duration, archive: Vec<u8>) -> Self {
        Self {
            phase: Phase::Populate,
            timeout,
            method: Method::POST,
            path: protocol::POPULATE,
            expected: StatusCode::OK,
            body: (!archive.is_empty()).then_some(archive),
        }
    }

    pub fn build(timeout: Duration, request: &BuildRequest) -> Result<Self, ManagerError> {
        let body = serde_json::to_vec(request).map_err(ManagerError::Encode)?;
        Ok(Self {
            phase: Phase::Build,
            timeout,
            method: Method::POST,
            path: protocol::BUILD,
            expected: StatusCode::CREATED,
            body: Some(body),
        })
    }

    pub fn done(timeout: Duration) -> Self {
        Self {
            phase: Phase::Done,
            timeout,
            method: Method::POST,
            path: protocol::DONE,
            expected: StatusCode::OK,
            body: None,
        }
    }
}

fn expect_status(phase: Phase, response: &Response, expected: StatusCode) -> Result<(), ManagerError> {
    let status = response.status();
    if status == expected {
        Ok(())
    } else {
        Err(ManagerError::UnexpectedStatus {
            step: phase,
            status: status.as_u16(),
            expected: expected.as_u16(),
        })
    }
}

/// Walks one builder through every phase, copying progress to `output`.
pub struct Driver<W> {
    config: ManagerConfig,
    client: BuilderClient,
    output: W,
}

impl<W: AsyncWrite + Unpin> Driver<W> {
    pub fn new(config: ManagerConfig, output: W) -> Result<Self, ManagerError> {
        let client = BuilderClient::new(config.base_url(), config.retry_interval)?;
        Ok(Self {
            config,
            client,
            output,
        })
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Run every phase in order, stopping at the first failure.
    pub async fn run(&mut self, manifest: Vec<u8>) -> Result<(), ManagerError> {
        let timeouts = self.config.timeouts.clone();

        self.exchange(PhaseStep::claim(timeouts.claim)).await?;
        self.exchange(PhaseStep::provision(timeouts.provision, manifest)).await?;
        self.populate().await?;

        let request = BuildRequest {
            pipelines: self.config.pipelines.clone(),
            environments: self.config.environments.clone(),
        };
        self.exchange(PhaseStep::build(timeouts.build, &request)?).await?;

        self.progress().await?;
        self.export().await
    }

    /// Perform `step` under its own deadline.
    pub async fn exchange(&self, step: PhaseStep) -> Result<(), ManagerError> {
        with_deadline(step.phase, step.timeout, self.perform(&step)).await
    }

    async fn perform(&self, step: &PhaseStep) -> Result<(), ManagerError> {
        let response = self
            .client
            .send(step.method.clone(), step.path, &[], step.body.as_deref())
            .await?;
        expect_status(step.phase, &response, step.expected)?;
        info!(phase = %step.phase, status = response.status().as_u16(), "step done");
        Ok(())
    }

    /// Pack the configured store, if any, and upload it.
    pub async fn populate(&self) -> Result<(), ManagerError> {
        let timeout = self.config.timeouts.populate;
        with_deadline(Phase::Populate, timeout, self.upload_store(timeout)).await
    }

    async fn upload_store(&self, timeout: Duration) -> Result<(), ManagerError> {
        let archive = match &self.config.store {
            Some(dir) => pack_store(dir).await?,
            None => Vec::new(),
        };
        self.perform(&PhaseStep::populate(timeout, archive)).await
    }

    /// Poll `/progress` while it answers 202, then copy the log to the output.
    pub async fn progress(&mut self) -> Result<(), ManagerError> {
        let timeout = self.config.timeouts.progress;
        let interval = self.config.progress_interval;
        with_deadline(
            Phase::Progress,
            timeout,
            copy_progress(&self.client, &mut self.output, interval),
        )
        .await
    }

    /// Fetch every configured export, then release the builder.
    pub async fn export(&self) -> Result<(), ManagerError> {
        let timeout = self.config.timeouts.export;
        with_deadline(Phase::Export, timeout, self.fetch_exports(timeout)).await
    }

    async fn fetch_exports(&self, timeout: Duration) -> Result<(), ManagerError> {
        for rel in &self.config.exports {
            let response = self
                .client
                .send(Method::GET, protocol::EXPORT, &[("path", rel.as_str())], None)
                .await?;
            expect_status(Phase::Export, &response, StatusCode::OK)?;

            let dest = confine(&self.config.output, Path::new(rel))
                .ok_or_else(|| ManagerError::InvalidExportPath(rel.clone()))?;
            write_artifact(response, &dest).await?;
        }
        self.perform(&PhaseStep::done(timeout)).await
    }
}

async fn copy_progress<W: AsyncWrite + Unpin>(
    client: &BuilderClient,
    output: &mut W,
    interval: Duration,
) -> Result<(), ManagerError> {
    loop {
        let mut response = client.send(Method::GET, protocol::PROGRESS, &[], None).await?;
        if response.status() == StatusCode::ACCEPTED {
            info!("build pending, retrying");
            tokio::time::sleep(interval).await;
            continue;
        }
        expect_status(Phase::Progress, &response, StatusCode::OK)?;

        let mut copied = 0usize;
        while let Some(chunk) = response.chunk().await.map_err(ManagerError::Transport)? {
            output.write_all(&chunk).await.map_err(ManagerError::Output)?;
            output.flush().await.map_err(ManagerError::Output)?;
            copied += chunk.len();
        }
        info!(bytes = copied, "progress copied");
        return Ok(());
    }
}

async fn pack_store(dir: &Path) -> Result<Vec<u8>, ManagerError> {
    let owned = dir.to_path_buf();
    let store_err = |source| ManagerError::Store {
        path: dir.to_path_buf(),
        source,
    };
    let archive = tokio::task::spawn_blocking(move || store::pack(&owned))
        .await
        .map_err(|e| store_err(std::io::Error::other(e)))?
        .map_err(store_err)?;
    info!(path = %dir.display(), bytes = archive.len(), "source store packed");
    Ok(archive)
}
