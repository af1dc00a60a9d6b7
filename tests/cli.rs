//! Binary-level tests: argument handling, exit codes, and signals.

use std::io::{BufRead, BufReader, Read};
use std::net::TcpListener;
use std::process::{Child, Command as StdCommand, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn builder() -> Command {
    cargo_bin_cmd!("jobsite-builder")
}

fn manager() -> Command {
    cargo_bin_cmd!("jobsite-manager")
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn create_test_script(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let script_path = dir.join(name);
    std::fs::write(&script_path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}

/// Block until a line containing `needle` shows up on the child's stderr.
fn wait_for_log(child: &mut Child, needle: &str) {
    let stderr = child.stderr.take().unwrap();
    wait_for_line(stderr, needle);
}

fn wait_for_line(stream: impl Read + Send + 'static, needle: &str) {
    let mut lines = BufReader::new(stream).lines();
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        match lines.next() {
            Some(Ok(line)) if line.contains(needle) => {
                // Keep draining so the child never blocks on a full pipe.
                std::thread::spawn(move || lines.for_each(drop));
                return;
            }
            Some(_) => {}
            None => break,
        }
    }
    panic!("never saw '{}' in child output", needle);
}

fn send_signal(child: &Child, signal: &str) {
    let status = StdCommand::new("kill")
        .arg(format!("-{}", signal))
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_builder_help() {
        builder()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--build-path"))
            .stdout(predicate::str::contains("--timeout-claim"));
    }

    #[test]
    fn test_manager_help() {
        manager()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--export-file"))
            .stdout(predicate::str::contains("--timeout-progress"));
    }

    #[test]
    fn test_version() {
        builder().arg("--version").assert().success();
        manager().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_flag_exits_with_error() {
        builder().arg("--no-such-flag").assert().code(1);
        manager().arg("--no-such-flag").assert().code(1);
    }
}

mod exit_codes {
    use super::*;

    #[test]
    fn test_builder_claim_timeout_exits_2() {
        let dir = TempDir::new().unwrap();
        builder()
            .args(["--builder-host", "127.0.0.1", "--builder-port", "0"])
            .arg("--build-path")
            .arg(dir.path().join("build"))
            .args(["--timeout-claim", "1"])
            .timeout(Duration::from_secs(30))
            .assert()
            .code(2);
    }

    #[test]
    fn test_builder_bind_failure_exits_1() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port().to_string();
        let dir = TempDir::new().unwrap();

        builder()
            .args(["--builder-host", "127.0.0.1"])
            .args(["--builder-port", port.as_str()])
            .arg("--build-path")
            .arg(dir.path())
            .timeout(Duration::from_secs(30))
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Failed to bind"));
    }

    #[test]
    fn test_manager_unreachable_builder_exits_2() {
        let port = free_port().to_string();
        manager()
            .args(["--builder-host", "127.0.0.1"])
            .args(["--builder-port", port.as_str()])
            .args(["--timeout-claim", "1"])
            .write_stdin("{}")
            .timeout(Duration::from_secs(30))
            .assert()
            .code(2)
            .stdout(predicate::str::is_empty());
    }

    #[test]
    fn test_binaries_complete_a_build() {
        let scratch = TempDir::new().unwrap();
        let engine = create_test_script(
            scratch.path(),
            "engine.sh",
            "#!/bin/sh\nmkdir -p p1\nprintf ABCD > p1/image.raw\necho hello\n",
        );
        let port = free_port().to_string();
        let output = scratch.path().join("out");

        let mut server = StdCommand::new(env!("CARGO_BIN_EXE_jobsite-builder"))
            .args(["--builder-host", "127.0.0.1", "--builder-port", port.as_str()])
            .arg("--build-path")
            .arg(scratch.path().join("build"))
            .arg("--engine")
            .arg(&engine)
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        manager()
            .args(["--builder-host", "127.0.0.1", "--builder-port", port.as_str()])
            .args(["--export", "p1", "--export-file", "p1/image.raw"])
            .args(["--progress-interval", "1"])
            .arg("--output")
            .arg(&output)
            .write_stdin(r#"{"version":"1","pipelines":[{"name":"p1"}]}"#)
            .timeout(Duration::from_secs(60))
            .assert()
            .success()
            .stdout("hello\n");

        assert_eq!(std::fs::read(output.join("p1/image.raw")).unwrap(), b"ABCD");
        assert_eq!(server.wait().unwrap().code(), Some(0));
    }
}

mod signals {
    use super::*;

    #[test]
    fn test_builder_sigterm_exits_3() {
        let dir = TempDir::new().unwrap();
        let mut child = StdCommand::new(env!("CARGO_BIN_EXE_jobsite-builder"))
            .args(["--builder-host", "127.0.0.1", "--builder-port", "0"])
            .arg("--build-path")
            .arg(dir.path())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        wait_for_log(&mut child, "builder listening");
        std::thread::sleep(Duration::from_millis(300));
        send_signal(&child, "TERM");

        assert_eq!(child.wait().unwrap().code(), Some(3));
    }

    #[test]
    fn test_manager_sigint_while_waiting_for_builder_exits_3() {
        let port = free_port().to_string();
        let mut child = StdCommand::new(env!("CARGO_BIN_EXE_jobsite-manager"))
            .args(["--builder-host", "127.0.0.1"])
            .args(["--builder-port", port.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        wait_for_log(&mut child, "starting build");
        send_signal(&child, "INT");

        assert_eq!(child.wait().unwrap().code(), Some(3));
    }

    #[test]
    fn test_manager_sigint_while_streaming_progress_exits_3() {
        let scratch = TempDir::new().unwrap();
        let engine = create_test_script(
            scratch.path(),
            "engine.sh",
            "#!/bin/sh\necho started\nexec sleep 30\n",
        );
        let port = free_port().to_string();

        let mut server = StdCommand::new(env!("CARGO_BIN_EXE_jobsite-builder"))
            .args(["--builder-host", "127.0.0.1", "--builder-port", port.as_str()])
            .arg("--build-path")
            .arg(scratch.path().join("build"))
            .arg("--engine")
            .arg(&engine)
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let mut child = StdCommand::new(env!("CARGO_BIN_EXE_jobsite-manager"))
            .args(["--builder-host", "127.0.0.1", "--builder-port", port.as_str()])
            .args(["--progress-interval", "1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let stdout = child.stdout.take().unwrap();
        wait_for_line(stdout, "started");
        send_signal(&child, "INT");
        assert_eq!(child.wait().unwrap().code(), Some(3));

        send_signal(&server, "TERM");
        assert_eq!(server.wait().unwrap().code(), Some(3));
    }
}
