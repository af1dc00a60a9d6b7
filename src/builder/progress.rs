//! Append-only capture of the build engine's stdout.
//!
//! One writer (the stdout pump) appends; readers follow along by offset and
//! wait for either new bytes or the engine's exit. The exit latch is set
//! once and never cleared.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// Largest slice handed to a reader in one go.
const MAX_CHUNK: usize = 64 * 1024;

/// How the build engine terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    /// Exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

impl EngineExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for EngineExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Result of waiting on the log at some offset.
#[derive(Debug, PartialEq, Eq)]
pub enum ProgressChunk {
    /// Bytes starting at the requested offset.
    Data(Vec<u8>),
    /// Everything has been read and the engine has exited.
    Finished(EngineExit),
}

#[derive(Debug, Default)]
struct Inner {
    bytes: Vec<u8>,
    exit: Option<EngineExit>,
}

#[derive(Debug, Default)]
pub struct ProgressLog {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock().bytes.extend_from_slice(data);
        self.changed.notify_waiters();
    }

    /// Latch the engine's exit. Only the first call has any effect.
    pub fn finish(&self, exit: EngineExit) {
        {
            let mut inner = self.lock();
            if inner.exit.is_some() {
                return;
            }
            inner.exit = Some(exit);
        }
        self.changed.notify_waiters();
    }

    pub fn exit(&self) -> Option<EngineExit> {
        self.lock().exit
    }

    /// Nothing written yet and the engine is still running.
    pub fn is_pending(&self) -> bool {
        let inner = self.lock();
        inner.bytes.is_empty() && inner.exit.is_none()
    }

    /// Wait until there are bytes past `offset` or the engine has exited
    /// with everything before it drained.
    pub async fn read_from(&self, offset: usize) -> ProgressChunk {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.lock();
                if offset < inner.bytes.len() {
                    let end = inner.bytes.len().min(offset + MAX_CHUNK);
                    return ProgressChunk::Data(inner.bytes[offset..end].to_vec());
                }
                if let Some(exit) = inner.exit {
                    return ProgressChunk::Finished(exit);
                }
            }
            notified.await;
        }
    }
}
