//! Build engine adapter.
//!
//! `POST /build` turns into one engine subprocess running in the build
//! directory. Its stdout is pumped verbatim into the session's
//! [`ProgressLog`]; its stderr goes to the builder's own log. When the
//! process exits the progress log's exit latch is set.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::BuilderSession;
use super::progress::{EngineExit, ProgressLog};
use crate::errors::EngineError;
use crate::protocol::BuildRequest;

const STDOUT_BUFFER: usize = 8 * 1024;

/// A running engine process, owned by the session while it runs.
#[derive(Debug)]
pub struct EngineHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Kill the process and wait until it has been reaped.
    pub async fn terminate(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "engine supervisor task failed");
        }
    }
}

/// Arguments passed to the engine, in order.
pub fn engine_args(build_dir: &Path, request: &BuildRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--store".into(),
        build_dir.join("store").into_os_string(),
        "--cache-max-size".into(),
        "0".into(),
        "--output-directory".into(),
        build_dir.as_os_str().to_owned(),
        "--json".into(),
    ];
    for pipeline in &request.pipelines {
        args.push("--export".into());
        args.push(pipeline.into());
    }
    args.push(build_dir.join("manifest.json").into_os_string());
    args
}

/// Split `KEY=VALUE` declarations. Values may contain further `=`.
pub fn parse_environment(declarations: &[String]) -> Result<Vec<(String, String)>, EngineError> {
    declarations
        .iter()
        .map(|decl| match decl.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(EngineError::BadEnvironment(decl.clone())),
        })
        .collect()
}

/// Launch the engine for `request` and return immediately.
///
/// Fails with `AlreadyRunning` if this session has launched an engine
/// before; a builder runs exactly one build.
pub fn spawn(session: &Arc<BuilderSession>, request: &BuildRequest) -> Result<(), EngineError> {
    let env = parse_environment(&request.environments)?;

    let mut slot = session.engine_slot();
    if slot.is_some() || session.progress.exit().is_some() {
        return Err(EngineError::AlreadyRunning);
    }

    let engine = &session.config.engine;
    let build_dir = session.build_dir();
    let args = engine_args(build_dir, request);

    info!(
        session = %session.id,
        engine = %engine.display(),
        args = ?args,
        env = ?request.environments,
        "starting build engine"
    );

    let mut child = Command::new(engine)
        .args(&args)
        .envs(env)
        .current_dir(build_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| EngineError::Spawn {
            path: engine.clone(),
            source,
        })?;

    info!(session = %session.id, pid = ?child.id(), "build engine running");
    let cancel = CancellationToken::new();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let task = tokio::spawn(supervise(
        Arc::clone(session),
        child,
        stdout,
        stderr,
        cancel.clone(),
    ));

    *slot = Some(EngineHandle { cancel, task });
    Ok(())
}

async fn supervise<O, E>(
    session: Arc<BuilderSession>,
    mut child: Child,
    stdout: Option<O>,
    stderr: Option<E>,
    cancel: CancellationToken,
) where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let pump = stdout.map(|out| tokio::spawn(pump_stdout(out, Arc::clone(&session.progress))));
    let drain = stderr.map(|err| tokio::spawn(log_stderr(err)));

    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = cancel.cancelled() => {
            warn!(session = %session.id, "terminating build engine");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to signal build engine");
            }
            (child.wait().await, true)
        }
    };

    // Orphaned grandchildren may still hold the pipes open after a kill.
    for task in [pump, drain].into_iter().flatten() {
        if killed {
            task.abort();
        }
        let _ = task.await;
    }

    let exit = match status {
        Ok(status) => EngineExit::from(status),
        Err(e) => {
            error!(error = %e, "failed to wait for build engine");
            EngineExit { code: None }
        }
    };

    {
        let mut slot = session.engine_slot();
        slot.take();
        session.progress.finish(exit);
    }

    if exit.success() {
        info!(session = %session.id, "build engine exited successfully");
    } else {
        warn!(session = %session.id, code = ?exit.code, "build engine failed");
    }
}

async fn pump_stdout<R: AsyncRead + Unpin>(mut stdout: R, progress: Arc<ProgressLog>) {
    let mut buf = vec![0u8; STDOUT_BUFFER];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => progress.append(&buf[..n]),
            Err(e) => {
                error!(error = %e, "failed to read build engine stdout");
                break;
            }
        }
    }
}

async fn log_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(stream = "stderr", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::progress::ProgressChunk;
    use crate::builder::{BuilderConfig, BuilderSession};
    use crate::phase::Phase;
    use crate::test_support::create_test_script;
    use std::path::PathBuf;
    use std::time::Duration;

    fn session_with_engine(build_dir: &Path, engine: PathBuf) -> Arc<BuilderSession> {
        let config = BuilderConfig {
            build_path: build_dir.to_path_buf(),
            engine,
            ..BuilderConfig::default()
        };
        Arc::new(BuilderSession::starting_at(config, Phase::Build))
    }

    async fn read_all(progress: &ProgressLog) -> (Vec<u8>, EngineExit) {
        let mut out = Vec::new();
        loop {
            match progress.read_from(out.len()).await {
                ProgressChunk::Data(bytes) => out.extend_from_slice(&bytes),
                ProgressChunk::Finished(exit) => return (out, exit),
            }
        }
    }

    #[test]
    fn test_engine_args_layout() {
        let request = BuildRequest {
            pipelines: vec!["build".into(), "image".into()],
            environments: vec![],
        };
        let args = engine_args(Path::new("/run/osbuild"), &request);
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--store",
                "/run/osbuild/store",
                "--cache-max-size",
                "0",
                "--output-directory",
                "/run/osbuild",
                "--json",
                "--export",
                "build",
                "--export",
                "image",
                "/run/osbuild/manifest.json",
            ]
        );
    }

    #[test]
    fn test_parse_environment_splits_on_first_equals() {
        let env = parse_environment(&["A=1".into(), "OPTS=x=y".into(), "EMPTY=".into()]).unwrap();
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("OPTS".to_string(), "x=y".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_environment_rejects_malformed() {
        assert!(matches!(
            parse_environment(&["NOEQUALS".into()]),
            Err(EngineError::BadEnvironment(_))
        ));
        assert!(parse_environment(&["=value".into()]).is_err());
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = create_test_script(
            dir.path(),
            "engine.sh",
            "#!/bin/sh\necho hello\necho oops >&2\nexit 0\n",
        );
        let session = session_with_engine(dir.path(), engine);

        spawn(&session, &BuildRequest::default()).unwrap();
        let (out, exit) = tokio::time::timeout(Duration::from_secs(10), read_all(&session.progress))
            .await
            .unwrap();

        assert_eq!(out, b"hello\n");
        assert!(exit.success());
        assert!(!session.engine_running());
        assert!(session.build_started());
    }

    #[tokio::test]
    async fn test_spawn_passes_environment_and_runs_in_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = create_test_script(
            dir.path(),
            "engine.sh",
            "#!/bin/sh\necho \"$JOBSITE_TEST_VAR\"\npwd\n",
        );
        let session = session_with_engine(dir.path(), engine);
        let request = BuildRequest {
            pipelines: vec![],
            environments: vec!["JOBSITE_TEST_VAR=layered".into()],
        };

        spawn(&session, &request).unwrap();
        let (out, _) = tokio::time::timeout(Duration::from_secs(10), read_all(&session.progress))
            .await
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("layered"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            cwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let engine = create_test_script(dir.path(), "engine.sh", "#!/bin/sh\necho boom\nexit 1\n");
        let session = session_with_engine(dir.path(), engine);

        spawn(&session, &BuildRequest::default()).unwrap();
        let (out, exit) = tokio::time::timeout(Duration::from_secs(10), read_all(&session.progress))
            .await
            .unwrap();

        assert_eq!(out, b"boom\n");
        assert_eq!(exit.code, Some(1));
    }

    #[tokio::test]
    async fn test_second_spawn_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = create_test_script(dir.path(), "engine.sh", "#!/bin/sh\nexec sleep 5\n");
        let session = session_with_engine(dir.path(), engine);

        spawn(&session, &BuildRequest::default()).unwrap();
        assert!(matches!(
            spawn(&session, &BuildRequest::default()),
            Err(EngineError::AlreadyRunning)
        ));
        session.shutdown_engine().await;
    }

    #[tokio::test]
    async fn test_shutdown_kills_and_reaps_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = create_test_script(dir.path(), "engine.sh", "#!/bin/sh\nexec sleep 30\n");
        let session = session_with_engine(dir.path(), engine);

        spawn(&session, &BuildRequest::default()).unwrap();
        assert!(session.engine_running());

        tokio::time::timeout(Duration::from_secs(5), session.shutdown_engine())
            .await
            .unwrap();

        assert!(!session.engine_running());
        let exit = session.progress.exit().unwrap();
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_missing_engine_binary_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_engine(dir.path(), dir.path().join("no-such-engine"));

        assert!(matches!(
            spawn(&session, &BuildRequest::default()),
            Err(EngineError::Spawn { .. })
        ));
        assert!(!session.build_started());
    }
}
