//! Manager process lifecycle: run the driver, race it against signals,
//! and map the outcome to an exit status.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use super::ManagerConfig;
use super::steps::Driver;
use crate::errors::{ExitStatus, ManagerError};

/// Read the whole manifest from `input`, then drive the builder.
pub async fn drive<R, W>(config: ManagerConfig, mut input: R, output: W) -> Result<(), ManagerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut manifest = Vec::new();
    input
        .read_to_end(&mut manifest)
        .await
        .map_err(ManagerError::Stdin)?;

    info!(
        manager = %config.identity(),
        builder = %config.base_url(),
        manifest_bytes = manifest.len(),
        "starting build"
    );
    let mut driver = Driver::new(config, output)?;
    driver.run(manifest).await
}

/// Drive a build with the manifest on stdin and progress on stdout.
pub async fn run(config: ManagerConfig) -> ExitStatus {
    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to install signal handlers");
            return ExitStatus::Error;
        }
    };

    let mut work = tokio::spawn(drive(config, tokio::io::stdin(), tokio::io::stdout()));

    let status = tokio::select! {
        result = &mut work => match result {
            Ok(Ok(())) => {
                info!("all phases complete");
                ExitStatus::Ok
            }
            Ok(Err(e)) => {
                error!(error = %e, "build failed");
                ExitStatus::from(&e)
            }
            Err(e) => {
                error!(error = %e, "driver task failed");
                ExitStatus::Error
            }
        },
        _ = sigint.recv() => {
            info!("received SIGINT");
            ExitStatus::Signal
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
            ExitStatus::Signal
        }
    };

    if status == ExitStatus::Signal {
        // Dropping the driver removes any partially written export.
        work.abort();
        let _ = work.await;
    }
    status
}
