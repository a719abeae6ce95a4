use std::{path::PathBuf, time::Duration};

use crate::config::EngineConfig;

const SYSTEM_READ_PATHS: &[&str] = &["/usr", "/lib", "/lib64", "/lib32", "/bin", "/sbin", "/etc"];
const DEVICE_PATHS: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

/// What a sandboxed process is allowed to do.
///
/// Filesystem access is read/execute on `read_paths`, read/write on `device_paths`
/// and unrestricted inside the scratch directory. Outbound network is permitted,
/// listening and accepting connections is not.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub read_paths: Vec<PathBuf>,
    pub device_paths: Vec<PathBuf>,
    pub restrict_filesystem: bool,
    /// Whether one sandboxed process may inspect another one's memory.
    pub allow_member_access: bool,
    pub max_open_files: u64,
    pub max_file_size_bytes: Option<u64>,
    pub cpu_time_limit: Option<Duration>,
    /// cgroup `memory.max` applied while the program runs.
    pub memory_backstop_bytes: Option<u64>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            read_paths: SYSTEM_READ_PATHS.iter().map(PathBuf::from).collect(),
            device_paths: DEVICE_PATHS.iter().map(PathBuf::from).collect(),
            restrict_filesystem: true,
            allow_member_access: true,
            max_open_files: 256,
            max_file_size_bytes: None,
            cpu_time_limit: None,
            memory_backstop_bytes: None,
        }
    }
}

impl Capabilities {
    pub fn for_config(config: &EngineConfig) -> Self {
        Self {
            allow_member_access: config.allow_member_access,
            max_file_size_bytes: Some(config.scratch_dir_limit_bytes.saturating_mul(2)),
            cpu_time_limit: Some(config.execution_backstop()),
            memory_backstop_bytes: Some(config.memory_limit_bytes.saturating_mul(2)),
            ..Self::default()
        }
    }
}
