//! Cooperative cancellation for build child processes.

use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

/// A shared cancellation flag.
///
/// The orchestrator checks it between stages and stops spawning new work;
/// whoever owns the active child process is responsible for terminating it
/// (see [`terminate`]). Cleanup paths always run after cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Terminate a child process: SIGTERM, a grace period, then SIGKILL.
pub fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        // std only exposes SIGKILL; deliver the polite signal via kill(1)
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &child.id().to_string()])
            .status();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "child exited after SIGTERM");
                    return;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn terminate_kills_a_stubborn_child() {
        // a child that ignores SIGTERM still dies by SIGKILL
        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();

        let start = Instant::now();
        terminate(&mut child, Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(10));
        // the process is gone
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn terminate_prefers_the_polite_signal() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        terminate(&mut child, Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
    }
}
