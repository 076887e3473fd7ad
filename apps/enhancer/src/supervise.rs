//! Child-process supervision primitives shared by the helper bridge and the
//! document compiler.
//!
//! - `StreamCapture` drains one child pipe on its own task, appending to a
//!   shared buffer, so partial output survives a timeout or an aborted drain.
//! - `terminate` sends SIGTERM to the child's process group, waits `grace`,
//!   then escalates to SIGKILL. The child is always reaped before it returns.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Incremental, order-preserving capture of a single child stream.
pub struct StreamCapture {
    buf: Arc<Mutex<BytesMut>>,
    task: JoinHandle<()>,
}

impl StreamCapture {
    /// Starts draining `reader`. `None` yields an empty capture.
    pub fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(BytesMut::new()));
        let sink = Arc::clone(&buf);

        let task = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut guard) = sink.lock() {
                            guard.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(e) => {
                        debug!("Child stream read failed: {e}");
                        break;
                    }
                }
            }
        });

        Self { buf, task }
    }

    /// Waits up to `grace` for end-of-stream, then returns whatever was captured.
    /// A grandchild holding the pipe open cannot stall the caller past `grace`.
    pub async fn finish(self, grace: Duration) -> Bytes {
        let StreamCapture { buf, mut task } = self;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            debug!("Stream drain did not finish within {grace:?}; aborting");
            task.abort();
        }
        let taken = match buf.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        taken.freeze()
    }

    /// `finish` decoded lossily as UTF-8.
    pub async fn finish_text(self, grace: Duration) -> String {
        let bytes = self.finish(grace).await;
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Puts the child in a new process group led by itself, so `terminate` can reach
/// everything the child forks.
pub fn isolate(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Terminates `child` and its process group: SIGTERM first, SIGKILL for whatever
/// is still alive after `grace`. The child is always reaped before it returns.
///
/// Assumes the child was spawned through `isolate`.
pub async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let group = Pid::from_raw(pid as i32);
            let mut reaped = false;

            match killpg(group, Signal::SIGTERM) {
                Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!("Child {pid} exited after SIGTERM: {status}");
                        reaped = true;
                    }
                    Ok(Err(e)) => warn!("Waiting for child {pid} after SIGTERM failed: {e}"),
                    Err(_) => warn!("Child {pid} ignored SIGTERM for {grace:?}; sending SIGKILL"),
                },
                Err(e) => debug!("SIGTERM to process group {pid} failed: {e}"),
            }

            // Sweep the group even if the leader is gone; its forks may not be.
            match killpg(group, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => debug!("SIGKILL to process group {pid} failed: {e}"),
            }

            if reaped {
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill child process: {e}");
    }
}


/// Liveness check for test assertions. A zombie counts as gone: it has exited
/// and only waits for its new parent to reap it.
#[cfg(all(test, unix))]
pub(crate) fn process_alive(pid: i32) -> bool {
    let stat = format!("/proc/{pid}/stat");
    if std::path::Path::new("/proc/self/stat").exists() {
        return match std::fs::read_to_string(&stat) {
            Ok(text) => text
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map_or(false, |state| state != 'Z' && state != 'X'),
            Err(_) => false,
        };
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Polls `process_alive` until the process is gone or `limit` elapses.
#[cfg(all(test, unix))]
pub(crate) async fn wait_until_gone(pid: i32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}
