//! Child process helpers shared by the sandbox, the decoder probe and the
//! version probe.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Put the child in its own process group so a timeout can take down
/// everything it forked.
pub(crate) fn isolate_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Extension trait to add `wait_timeout` to `Child`.
pub(crate) trait ChildExt {
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>>;

    /// Kill (the whole group when isolated) and reap.
    fn terminate(&mut self);

    /// SIGKILL whatever is left in the child's process group. Safe after the
    /// leader has been reaped; ESRCH (empty group) is ignored.
    fn kill_group(&self);
}

impl ChildExt for Child {
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
        }
    }

    fn terminate(&mut self) {
        if let Ok(Some(_)) = self.try_wait() {
            return;
        }
        self.kill_group();
        let _ = self.kill();
        let _ = self.wait(); // reap
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Ok(pid) = i32::try_from(self.id()) {
                // Fails with ESRCH when the child is not a group leader.
                let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}
