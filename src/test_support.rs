//! Fixtures shared by unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable shell script standing in for the build engine.
pub fn create_test_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    let script_path = dir.join(name);
    std::fs::write(&script_path, content).unwrap();
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();
    script_path
}
