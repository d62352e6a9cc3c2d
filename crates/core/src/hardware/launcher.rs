//! Low-priority subprocess launch capability.
//!
//! On Unix the renderer is started through `nice -n 19` so it yields to
//! interactive use of the machine. Availability of the `nice` binary is
//! probed once at startup; when it is missing the renderer launches at
//! normal priority and a warning is logged. On Unix the child is also
//! placed in its own process group so the supervisor can terminate the
//! renderer together with any helpers it spawned.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// Niceness applied to render subprocesses.
const NICE_LEVEL: &str = "19";

/// Builds renderer commands, lowering their OS priority when possible.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    nice_available: bool,
}

impl ProcessLauncher {
    /// Probe for the `nice` binary once. Call this at startup and reuse
    /// the launcher for every render.
    pub fn detect() -> Self {
        let nice_available = probe_nice();
        if !nice_available {
            tracing::warn!(
                "No low-priority launch capability found, renderers will run at normal priority"
            );
        }
        Self { nice_available }
    }

    /// Construct a launcher with a known capability. Used by tests.
    pub fn with_capability(nice_available: bool) -> Self {
        Self { nice_available }
    }

    pub fn lowers_priority(&self) -> bool {
        self.nice_available
    }

    /// Build a [`Command`] for `program`, prefixed with `nice` when
    /// available, with stdout/stderr piped for supervision and the child
    /// in its own process group (Unix).
    pub fn command(&self, program: &Path) -> Command {
        let mut cmd = if self.nice_available {
            let mut cmd = Command::new("nice");
            cmd.arg("-n").arg(NICE_LEVEL).arg(program);
            cmd
        } else {
            Command::new(program)
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

#[cfg(unix)]
fn probe_nice() -> bool {
    std::process::Command::new("nice")
        .arg("true")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn probe_nice() -> bool {
    false
}

/// Send SIGKILL to the child's entire process group. Falls back to
/// killing just the direct child where process groups are unavailable.
pub fn kill_process_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was spawned with process_group(0), so its pid is
        // also its pgid.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }

    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn command_without_nice_runs_program_directly() {
        let launcher = ProcessLauncher::with_capability(false);
        let cmd = launcher.command(&PathBuf::from("/opt/renderer"));
        assert_eq!(cmd.as_std().get_program(), "/opt/renderer");
    }

    #[test]
    fn command_with_nice_prefixes_program() {
        let launcher = ProcessLauncher::with_capability(true);
        let cmd = launcher.command(&PathBuf::from("/opt/renderer"));
        assert_eq!(cmd.as_std().get_program(), "nice");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["-n", NICE_LEVEL, "/opt/renderer"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_command_is_supervised() {
        let launcher = ProcessLauncher::detect();
        let mut cmd = launcher.command(&PathBuf::from("true"));
        let status = cmd.spawn().unwrap().wait().await.unwrap();
        assert!(status.success());
    }
}
