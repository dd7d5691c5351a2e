use crate::fm::fm_event;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::sync::oneshot;

/// Send a signal to a pid, swallowing "process already gone" as benign.
/// Returns false when the process no longer exists.
pub(crate) fn send_signal(pid: u32, sig: Signal) -> bool {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            fm_event("kill", Some(pid), format!("sig={sig} outcome=already_gone"));
            false
        }
        Err(e) => {
            // EPERM etc: nothing useful to do beyond logging; the exit waiter
            // still bounds the wait.
            fm_event("kill", Some(pid), format!("sig={sig} outcome=error err={e}"));
            false
        }
    }
}

/// Cancels the pending force kill when dropped. The supervisor holds this for
/// each terminating worker and drops it on the worker's exit event.
#[derive(Debug)]
pub struct KillGuard {
    cancel: Option<oneshot::Sender<()>>,
}

impl Drop for KillGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// Graceful-then-forceful termination: SIGTERM now, SIGKILL after `grace`
/// unless the returned guard is dropped first.
///
/// The caller must mark the worker expected-to-exit before invoking this, so
/// the exit handler does not classify the result as a crash.
pub fn terminate(pid: u32, grace: Duration) -> KillGuard {
    fm_event("kill", Some(pid), format!("sig=SIGTERM grace_ms={}", grace.as_millis()));
    send_signal(pid, Signal::SIGTERM);

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::select! {
            // Either an explicit cancel or the guard being dropped; both mean
            // the process exited first.
            _ = rx => {}
            _ = tokio::time::sleep(grace) => {
                fm_event("kill", Some(pid), "sig=SIGKILL reason=grace_expired");
                send_signal(pid, Signal::SIGKILL);
            }
        }
    });
    KillGuard { cancel: Some(tx) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt as _;
    use std::time::Instant;

    #[tokio::test(flavor = "multi_thread")]
    async fn cooperative_process_dies_from_sigterm_without_sigkill() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let t0 = Instant::now();
        let guard = terminate(pid, Duration::from_secs(10));
        let status = child.wait().await.unwrap();
        drop(guard);

        assert_eq!(status.signal(), Some(libc_sigterm()));
        assert!(t0.elapsed() < Duration::from_secs(5), "exit should be prompt");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stubborn_process_is_force_killed_after_grace() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.05; done")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let grace = Duration::from_millis(400);
        let t0 = Instant::now();
        let _guard = terminate(pid, grace);
        let status = child.wait().await.unwrap();

        assert_eq!(status.signal(), Some(libc_sigkill()));
        assert!(
            t0.elapsed() >= Duration::from_millis(350),
            "force kill fired early: {:?}",
            t0.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_the_guard_cancels_the_force_kill() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.05; done")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let guard = terminate(pid, Duration::from_millis(300));
        drop(guard);
        tokio::time::sleep(Duration::from_millis(600)).await;

        // SIGKILL was cancelled, so the trap-TERM shell is still alive.
        assert!(child.try_wait().unwrap().is_none(), "process should still be running");
        send_signal(pid, Signal::SIGKILL);
        let _ = child.wait().await;
    }

    #[test]
    fn signaling_a_dead_pid_is_benign() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // The pid is reaped; kill must not panic or error out.
        let _ = send_signal(pid, Signal::SIGTERM);
    }

    fn libc_sigterm() -> i32 {
        Signal::SIGTERM as i32
    }

    fn libc_sigkill() -> i32 {
        Signal::SIGKILL as i32
    }
}
