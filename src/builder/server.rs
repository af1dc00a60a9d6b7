//! Builder process lifecycle.
//!
//! Serves the router until the session reaches a terminal phase, a phase
//! watchdog fires, or the process is signalled, then shuts the engine and
//! the listener down and reports how the builder ended.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BuilderConfig, BuilderSession, PhaseTimeouts, SharedSession, api};
use crate::errors::ExitStatus;
use crate::phase::Phase;

/// Grace period for in-flight requests once the builder is finished.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Bind the configured address and serve one build.
pub async fn run(config: BuilderConfig) -> Result<ExitStatus> {
    tokio::fs::create_dir_all(&config.build_path)
        .await
        .with_context(|| format!("Failed to create build path {}", config.build_path.display()))?;
    let build_path = tokio::fs::canonicalize(&config.build_path)
        .await
        .with_context(|| format!("Failed to resolve build path {}", config.build_path.display()))?;
    let config = BuilderConfig {
        build_path,
        ..config
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let session = Arc::new(BuilderSession::new(config));
    info!(
        session = %session.id,
        addr = %listener.local_addr().context("Failed to get listener address")?,
        build_path = %session.build_dir().display(),
        "builder listening"
    );
    serve(listener, session).await
}

/// Tracks the deadline for the phase the builder is currently waiting in.
struct Watchdog {
    timeouts: PhaseTimeouts,
    phase: Phase,
    deadline: Option<Instant>,
}

impl Watchdog {
    fn new(timeouts: PhaseTimeouts, phase: Phase) -> Self {
        let mut watchdog = Self {
            timeouts,
            phase,
            deadline: None,
        };
        watchdog.enter(phase);
        watchdog
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.deadline = self.timeouts.for_phase(phase).map(|t| Instant::now() + t);
        debug!(phase = %phase, armed = self.deadline.is_some(), "watchdog entered phase");
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Serve `session` on an already bound listener until the build ends.
pub async fn serve(listener: TcpListener, session: SharedSession) -> Result<ExitStatus> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let shutdown = CancellationToken::new();
    let app = api::router(session.clone());
    let mut server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });
    let mut server_finished = false;

    let mut watchdog = Watchdog::new(session.config.timeouts.clone(), session.state.get());

    let mut status = loop {
        let deadline = watchdog.deadline;
        tokio::select! {
            phase = session.state.next_event() => match phase {
                Phase::Done => break ExitStatus::Ok,
                Phase::Error => break ExitStatus::Error,
                phase => watchdog.enter(phase),
            },
            _ = sleep_until(deadline) => {
                let phase = session.state.get();
                if phase != watchdog.phase {
                    // The transition event is already queued.
                    continue;
                }
                if phase == Phase::Build && session.build_started() {
                    debug!("engine running, build watchdog disarmed");
                    watchdog.disarm();
                    continue;
                }
                warn!(session = %session.id, phase = %phase, "timed out waiting for the manager");
                let _ = session.state.set(Phase::Error);
                break ExitStatus::Timeout;
            }
            result = &mut server => {
                server_finished = true;
                match result {
                    Ok(Ok(())) => error!("HTTP server stopped unexpectedly"),
                    Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                    Err(e) => error!(error = %e, "HTTP server task failed"),
                }
                let _ = session.state.set(Phase::Error);
                break ExitStatus::Error;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break ExitStatus::Signal;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break ExitStatus::Signal;
            }
        }
    };

    if status == ExitStatus::Error && !server_finished {
        info!(
            linger_ms = session.config.error_linger.as_millis() as u64,
            "build failed, answering requests before exit"
        );
        tokio::select! {
            _ = tokio::time::sleep(session.config.error_linger) => {}
            _ = sigint.recv() => status = ExitStatus::Signal,
            _ = sigterm.recv() => status = ExitStatus::Signal,
        }
    }

    session.shutdown_engine().await;
    shutdown.cancel();

    if !server_finished {
        if status == ExitStatus::Signal {
            server.abort();
        } else {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server failed during shutdown"),
                Ok(Err(e)) => warn!(error = %e, "HTTP server task failed during shutdown"),
                Err(_) => {
                    warn!("in-flight requests did not finish within the grace period");
                    server.abort();
                }
            }
        }
    }

    info!(session = %session.id, status = ?status, phase = %session.state.get(), "builder exiting");
    Ok(status)
}
