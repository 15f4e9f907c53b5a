//! Process spawner.
//!
//! Spawns one child per call with:
//! - `env_clear()` plus an explicit allow-list projected from the parent
//!   environment, so unrelated secrets never reach the child;
//! - its own process group (unix), so the whole tree can be killed when
//!   the child forks helpers;
//! - piped stdin/stdout/stderr and `kill_on_drop(true)`, wrapped in a
//!   [`ChildGuard`] that kills the group if the call is abandoned.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{ProcessError, ProcessErrorKind};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables always inherited by the child process.
///
/// Every other variable is stripped unless named in
/// [`CommandSpec::env_allowlist`].
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Project the allow-list over an environment snapshot (default deny).
///
/// Names are matched exactly; the order of `vars` is preserved.
#[must_use]
pub fn project_env<I>(extra_allowed: &[String], vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| {
            ALLOWED_ENV_VARS.contains(&key.as_str()) || extra_allowed.iter().any(|a| a == key)
        })
        .collect()
}

// ── Command specification ────────────────────────────────────────────────────

/// Everything needed to spawn one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Binary to execute.
    pub program: String,
    /// Arguments, never including the prompt.
    pub args: Vec<String>,
    /// Extra variable names projected from the parent environment.
    pub env_allowlist: Vec<String>,
    /// Variables set explicitly on the child.
    pub env: Vec<(String, String)>,
    /// Working directory; inherits the parent's when unset.
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Spec for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an explicit environment variable on the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Build the tokio command for a spec without spawning it.
#[must_use]
pub fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);

    // Strip inherited environment, then inject only the allow-list.
    cmd.env_clear();
    for (key, value) in project_env(&spec.env_allowlist, std::env::vars()) {
        cmd.env(key, value);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

/// Spawn the child for a spec, guarded by a [`ChildGuard`].
///
/// # Errors
///
/// Returns a `spawn_failed` [`ProcessError`] if the OS refuses to start
/// the binary.
pub fn spawn(spec: &CommandSpec) -> std::result::Result<ChildGuard, ProcessError> {
    let child = build_command(spec).spawn().map_err(|err| {
        ProcessError::new(
            ProcessErrorKind::SpawnFailed,
            format!("failed to spawn {}: {err}", spec.program),
            Duration::ZERO,
        )
    })?;

    info!(
        program = spec.program,
        pid = child.id().unwrap_or(0),
        "process spawned"
    );
    Ok(ChildGuard::new(child))
}

// ── Termination ──────────────────────────────────────────────────────────────

/// A spawned child whose whole process group is killed if the guard is
/// dropped before the child has been reaped.
///
/// Covers callers that abandon a call by dropping its future, such as an
/// outer `tokio::time::timeout`; `kill_on_drop` alone reaches only the
/// direct child.
#[derive(Debug)]
pub struct ChildGuard {
    child: Child,
    pid: Option<u32>,
    armed: bool,
}

impl ChildGuard {
    /// Guard a freshly spawned child.
    #[must_use]
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            armed: true,
        }
    }

    /// Stop guarding once the child has been reaped.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Deref for ChildGuard {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ChildGuard {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pid) = self.pid {
            warn!(pid, "call abandoned before exit; killing process tree");
            kill_group(pid);
        }
        if let Err(err) = self.child.start_kill() {
            debug!(%err, "start_kill failed; child already exited");
        }
    }
}

/// Kill the child and every process in its group.
///
/// Best effort: errors are logged, never returned. The child is reaped
/// by the caller's subsequent `wait`.
pub fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_group(pid);
    }

    if let Err(err) = child.start_kill() {
        debug!(%err, "start_kill failed; child already exited");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range for killpg");
        return;
    };

    debug!(pid, "sending SIGKILL to process group");
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        // ESRCH: the group already exited.
        debug!(pid, %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}
