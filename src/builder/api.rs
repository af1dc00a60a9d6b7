//! HTTP handlers, one per phase.
//!
//! Every handler checks the phase first and answers `409` without side
//! effects when it does not match. Mutating handlers hold the session's
//! `ops` lock from that check until the phase has been advanced.

use std::io::ErrorKind;
use std::path::Path;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use futures::{Stream, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::progress::{EngineExit, ProgressChunk};
use super::{BuilderSession, SharedSession, engine};
use crate::errors::{ApiError, StateError};
use crate::paths::confine;
use crate::phase::Phase;
use crate::protocol::{self, BuildRequest, ExportQuery};
use crate::store;

pub fn router(session: SharedSession) -> Router {
    Router::new()
        .route(protocol::CLAIM, post(claim))
        .route(protocol::PROVISION, put(provision))
        .route(protocol::POPULATE, post(populate))
        .route(protocol::BUILD, post(build))
        .route(protocol::PROGRESS, get(progress))
        .route(protocol::EXPORT, get(export))
        .route(protocol::DONE, post(done))
        .layer(TraceLayer::new_for_http())
        .with_state(session)
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn read_body(session: &BuilderSession, body: Body) -> Result<Bytes, ApiError> {
    axum::body::to_bytes(body, session.config.max_body_size)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))
}

fn advance_to(session: &BuilderSession, next: Phase) -> Result<(), ApiError> {
    session.state.set(next).map_err(|e| session.fail(e))
}

/// Settle the build phase once a reader has drained the whole log.
fn finish_build(session: &BuilderSession, exit: EngineExit) {
    let next = if exit.success() {
        Phase::Export
    } else {
        Phase::Error
    };
    match session.state.advance(Phase::Build, next) {
        Ok(()) => info!(session = %session.id, code = ?exit.code, phase = %next, "build settled"),
        // Another reader settled it first.
        Err(StateError::WrongPhase { .. }) => {}
        Err(e) => error!(session = %session.id, error = %e, "failed to settle build"),
    }
}

fn progress_stream(session: SharedSession) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold((session, 0usize), |(session, offset)| async move {
        match session.progress.read_from(offset).await {
            ProgressChunk::Data(bytes) => {
                let next = offset + bytes.len();
                Some((Ok::<_, std::io::Error>(Bytes::from(bytes)), (session, next)))
            }
            ProgressChunk::Finished(exit) => {
                finish_build(&session, exit);
                None
            }
        }
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn claim(State(session): State<SharedSession>) -> Result<impl IntoResponse, ApiError> {
    let _ops = session.ops.lock().await;
    session.state.guard(Phase::Claim)?;

    advance_to(&session, Phase::Provision)?;
    info!(session = %session.id, "claimed");
    Ok((StatusCode::OK, "done"))
}

async fn provision(
    State(session): State<SharedSession>,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let _ops = session.ops.lock().await;
    session.state.guard(Phase::Provision)?;

    // The manifest is opaque; the engine judges it.
    let manifest = read_body(&session, body).await?;

    let path = session.manifest_path();
    let write = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .open(&path)
            .await?;
        file.write_all(&manifest).await?;
        file.sync_all().await
    };
    write.await.map_err(|e| {
        session.fail(ApiError::Internal(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )))
    })?;

    advance_to(&session, Phase::Populate)?;
    info!(session = %session.id, bytes = manifest.len(), "manifest written");
    Ok((StatusCode::CREATED, "done"))
}

async fn populate(
    State(session): State<SharedSession>,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let _ops = session.ops.lock().await;
    session.state.guard(Phase::Populate)?;

    let archive = read_body(&session, body).await?;
    if archive.is_empty() {
        debug!(session = %session.id, "no source store supplied");
    } else {
        let dest = session.store_path();
        let entries = tokio::task::spawn_blocking(move || store::unpack(&archive, &dest))
            .await
            .map_err(|e| session.fail(ApiError::Internal(format!("Unpack task failed: {}", e))))?
            .map_err(|e| session.fail(e))?;
        info!(session = %session.id, entries, "source store unpacked");
    }

    advance_to(&session, Phase::Build)?;
    Ok((StatusCode::OK, "done"))
}

async fn build(
    State(session): State<SharedSession>,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let _ops = session.ops.lock().await;
    session.state.guard(Phase::Build)?;

    let bytes = read_body(&session, body).await?;
    let request: BuildRequest = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("Invalid build request: {}", e)))?;

    engine::spawn(&session, &request).map_err(|e| session.fail(e))?;
    Ok((StatusCode::CREATED, "done"))
}

async fn progress(State(session): State<SharedSession>) -> Result<Response, ApiError> {
    session.state.guard(Phase::Build)?;
    if !session.build_started() {
        return Err(ApiError::WrongPhase("Build has not been started".into()));
    }

    if session.progress.is_pending() {
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    let body = Body::from_stream(progress_stream(session));
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

async fn export(
    State(session): State<SharedSession>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    session.state.guard(Phase::Export)?;

    let rel = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing export path".into()))?;
    if rel.contains('\0') {
        return Err(ApiError::BadRequest("Export path contains a NUL byte".into()));
    }
    let escape = || ApiError::BadRequest(format!("Export path '{}' escapes the build directory", rel));

    let build_dir = tokio::fs::canonicalize(session.build_dir())
        .await
        .map_err(|e| session.fail(ApiError::Internal(format!("Build directory unavailable: {}", e))))?;
    let candidate = confine(&build_dir, Path::new(&rel)).ok_or_else(escape)?;

    let resolved = match tokio::fs::canonicalize(&candidate).await {
        Ok(resolved) => resolved,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            return Err(ApiError::NotFound(format!("Export not found: {}", rel)));
        }
        // The build directory itself resolved, so the client's path is at fault.
        Err(e) => {
            return Err(ApiError::BadRequest(format!(
                "Export path '{}' cannot be resolved: {}",
                rel, e
            )));
        }
    };
    if !resolved.starts_with(&build_dir) {
        return Err(escape());
    }

    let file = tokio::fs::File::open(&resolved).await.map_err(|e| {
        session.fail(ApiError::Internal(format!("Failed to open {}: {}", rel, e)))
    })?;
    let metadata = file.metadata().await.map_err(|e| {
        session.fail(ApiError::Internal(format!("Failed to stat {}: {}", rel, e)))
    })?;
    if !metadata.is_file() {
        return Err(ApiError::BadRequest(format!("Export path '{}' is not a file", rel)));
    }

    info!(session = %session.id, path = %rel, bytes = metadata.len(), "serving export");
    let failing = session.clone();
    let stream = ReaderStream::new(file).inspect_err(move |e| {
        error!(session = %failing.id, error = %e, "export read failed");
        let _ = failing.state.set(Phase::Error);
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, metadata.len().to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn done(State(session): State<SharedSession>) -> Result<impl IntoResponse, ApiError> {
    let _ops = session.ops.lock().await;
    session.state.guard(Phase::Export)?;

    advance_to(&session, Phase::Done)?;
    info!(session = %session.id, "done");
    Ok((StatusCode::OK, "done"))
}
