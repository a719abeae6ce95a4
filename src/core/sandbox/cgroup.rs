use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use uuid::Uuid;

/// A cgroup v2 directory owned by one run.
#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
}

impl RunCgroup {
    /// Creates `<root>/<run_id>`.
    pub async fn create(root: &Path, run_id: Uuid) -> io::Result<Self> {
        let path = root.join(run_id.to_string());
        tokio::fs::create_dir_all(&path).await?;
        let cgroup = Self { path };

        if cgroup.path.join("memory.oom.group").exists() {
            if let Err(e) = tokio::fs::write(cgroup.path.join("memory.oom.group"), "1").await {
                tracing::warn!(path = %cgroup.path.display(), "failed to set memory.oom.group: {}", e);
            }
        }
        Ok(cgroup)
    }

    /// Hard kernel memory limit for everything in the cgroup.
    pub fn set_memory_max(&self, limit: u64) -> io::Result<()> {
        fs::write(self.path.join("memory.max"), limit.to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opened in the parent so the child can attach itself without allocating.
    pub fn procs_file(&self) -> io::Result<fs::File> {
        fs::OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
    }

    /// Current usage. The peak counter would include the compiler.
    pub fn memory_bytes(&self) -> Option<u64> {
        read_u64(&self.path.join("memory.current"))
    }

    pub fn cpu_usage(&self) -> Option<Duration> {
        let stat = fs::read_to_string(self.path.join("cpu.stat")).ok()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("usage_usec "))
            .and_then(|value| value.trim().parse().ok())
            .map(Duration::from_micros)
    }

    /// Processes the kernel killed for exceeding `memory.max`.
    pub fn oom_kills(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .ok()
            .and_then(|events| {
                events
                    .lines()
                    .find_map(|line| line.strip_prefix("oom_kill "))
                    .and_then(|value| value.trim().parse().ok())
            })
            .unwrap_or(0)
    }

    pub fn is_populated(&self) -> bool {
        fs::read_to_string(self.path.join("cgroup.events"))
            .map(|events| events.lines().any(|line| line.trim() == "populated 1"))
            .unwrap_or(false)
    }

    /// Kills every process in the cgroup. Returns false when unsupported.
    pub fn kill(&self) -> bool {
        fs::write(self.path.join("cgroup.kill"), "1").is_ok()
    }

    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir(&self.path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
