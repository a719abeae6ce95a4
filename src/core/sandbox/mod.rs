//! Per-run isolation boundary: a private scratch directory, the processes spawned
//! into it and the restrictions they run under.

mod capabilities;
mod cgroup;
mod isolation;
pub mod procfs;
mod scratch;

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use uuid::Uuid;

pub use capabilities::Capabilities;
pub use cgroup::RunCgroup;
use isolation::IsolationPlan;
#[cfg(test)]
pub(crate) use isolation::filesystem_rules_enforced;

use crate::{constants::SANDBOX_PATH, core::domain::TeardownWarning};

const KILL_SETTLE_TIMEOUT: Duration = Duration::from_millis(500);
const KILL_SETTLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up cgroup: {0}")]
    Cgroup(#[source] io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("sandbox has already been destroyed")]
    Destroyed,
}

/// A process to start inside the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    read_paths: Vec<PathBuf>,
    piped_stdin: bool,
}

impl SandboxCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            read_paths: Vec::new(),
            piped_stdin: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Extra paths this process may read on top of the sandbox capabilities.
    pub fn read_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_paths.push(path.into());
        self
    }

    pub fn piped_stdin(mut self) -> Self {
        self.piped_stdin = true;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Processes were still running when teardown began.
    pub lingering_processes: bool,
    pub warning: Option<TeardownWarning>,
}

#[derive(Debug)]
pub struct SandboxContext {
    id: Uuid,
    scratch_dir: PathBuf,
    capabilities: Capabilities,
    cgroup: Option<RunCgroup>,
    process_groups: Mutex<Vec<i32>>,
    destroyed: AtomicBool,
    report: OnceLock<TeardownReport>,
}

impl SandboxContext {
    /// Creates the sandbox with an empty scratch directory, replacing any leftover one.
    #[tracing::instrument(skip(capabilities))]
    pub async fn create(
        id: Uuid,
        scratch_dir: PathBuf,
        capabilities: Capabilities,
        cgroup_root: Option<&Path>,
    ) -> Result<Self, SandboxError> {
        scratch::recreate(&scratch_dir)
            .await
            .map_err(|source| SandboxError::Scratch {
                path: scratch_dir.clone(),
                source,
            })?;

        let cgroup = match cgroup_root {
            Some(root) => Some(
                RunCgroup::create(root, id)
                    .await
                    .map_err(SandboxError::Cgroup)?,
            ),
            None => None,
        };

        tracing::debug!(scratch = %scratch_dir.display(), cgroup = cgroup.is_some(), "sandbox created");

        Ok(Self {
            id,
            scratch_dir,
            capabilities,
            cgroup,
            process_groups: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            report: OnceLock::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn cgroup(&self) -> Option<&RunCgroup> {
        self.cgroup.as_ref()
    }

    pub fn process_groups(&self) -> Vec<i32> {
        self.process_groups.lock().clone()
    }

    /// Applies the kernel memory backstop. Called once compilation is over so the
    /// compiler does not count against it.
    pub fn arm_memory_backstop(&self) {
        let (Some(cgroup), Some(limit)) = (&self.cgroup, self.capabilities.memory_backstop_bytes)
        else {
            return;
        };
        if let Err(e) = cgroup.set_memory_max(limit) {
            tracing::warn!(cgroup = %cgroup.path().display(), "failed to set memory.max: {}", e);
        }
    }

    /// Whether the kernel killed a process of this sandbox at the memory backstop.
    pub fn memory_backstop_tripped(&self) -> bool {
        self.cgroup.as_ref().is_some_and(|cgroup| cgroup.oom_kills() > 0)
    }

    /// Spawns `command` in its own process group with stdout and stderr piped.
    /// The child is killed when the returned handle is dropped.
    pub fn spawn(&self, command: SandboxCommand) -> Result<Child, SandboxError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SandboxError::Destroyed);
        }

        let cgroup_procs = self
            .cgroup
            .as_ref()
            .map(RunCgroup::procs_file)
            .transpose()
            .map_err(SandboxError::Cgroup)?;
        let plan = IsolationPlan::prepare(
            &self.capabilities,
            &self.scratch_dir,
            &command.read_paths,
            cgroup_procs,
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &self.scratch_dir)
            .env("TMPDIR", &self.scratch_dir)
            .env("LANG", "C.UTF-8")
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.scratch_dir)
            .stdin(if command.piped_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        plan.install(&mut cmd);

        let child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;
        if let Some(pid) = child.id() {
            self.process_groups.lock().push(pid as i32);
        }
        tracing::debug!(pid = ?child.id(), program = %command.program.display(), "spawned sandboxed process");

        Ok(child)
    }

    /// Whether any process spawned into this sandbox is still running.
    pub fn has_live_processes(&self) -> bool {
        if self.cgroup.as_ref().is_some_and(RunCgroup::is_populated) {
            return true;
        }
        !procfs::group_members(&self.process_groups()).is_empty()
    }

    pub fn kill_processes(&self) {
        if let Some(cgroup) = &self.cgroup {
            cgroup.kill();
        }
        for pgid in self.process_groups() {
            // ESRCH just means the group is already gone.
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }

    pub async fn scratch_size(&self) -> io::Result<u64> {
        scratch::dir_size(self.scratch_dir.clone()).await
    }

    /// Kills everything still running, clears and removes the scratch directory.
    /// Safe to call more than once. Never fails, problems end up in the report.
    #[tracing::instrument(skip(self), fields(sandbox_id = %self.id))]
    pub async fn destroy(&self) -> TeardownReport {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return self.report.get().cloned().unwrap_or_default();
        }

        let mut report = TeardownReport {
            lingering_processes: self.has_live_processes(),
            warning: None,
        };
        if report.lingering_processes {
            tracing::warn!("processes still alive at teardown, killing");
        }

        self.kill_processes();
        let deadline = tokio::time::Instant::now() + KILL_SETTLE_TIMEOUT;
        while self.has_live_processes() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(KILL_SETTLE_POLL).await;
        }

        if let Err(e) = scratch::clear_and_remove(self.scratch_dir.clone()).await {
            tracing::warn!(scratch = %self.scratch_dir.display(), "failed to clear scratch directory: {}", e);
            report.warning = Some(TeardownWarning::ClearDirFailed);
        }

        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.remove().await {
                tracing::warn!(cgroup = %cgroup.path().display(), "failed to remove cgroup: {}", e);
                if report.warning.is_none() {
                    report.warning = Some(TeardownWarning::CgroupRemoveFailed);
                }
            }
        }

        let _ = self.report.set(report.clone());
        report
    }
}
