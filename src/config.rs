use std::{path::PathBuf, str::FromStr, time::Duration};

use uuid::Uuid;

use crate::constants::SCRATCH_ROOT_DIR_NAME;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },
    #[error("compile timeout must not exceed the backstop of the execution time limit")]
    CompileTimeoutTooLong,
    #[error("toolchain root {0:?} would expose the whole filesystem")]
    ToolchainRootTooBroad(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ToolchainPaths {
    pub python: PathBuf,
    pub shell: PathBuf,
    pub gnucpp: PathBuf,
    /// Installation prefix readable by sandboxed toolchains, for toolchains
    /// living outside the system paths (`/opt/python3.12`).
    pub root: Option<PathBuf>,
}

impl Default for ToolchainPaths {
    fn default() -> Self {
        Self {
            python: PathBuf::from("/usr/bin/python3"),
            shell: PathBuf::from("/bin/sh"),
            gnucpp: PathBuf::from("/usr/bin/g++"),
            root: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_id: Uuid,
    pub execution_time_limit: Duration,
    pub compile_timeout: Duration,
    pub memory_limit_bytes: u64,
    pub output_limit_chars: usize,
    pub code_size_limit_chars: usize,
    pub scratch_dir_limit_bytes: u64,
    pub scratch_root: PathBuf,
    /// Turns off time and memory checks, disk checks always stay on.
    pub monitoring_enabled: bool,
    pub allow_member_access: bool,
    pub cgroup_root: Option<PathBuf>,
    pub reference_root: Option<PathBuf>,
    pub toolchains: ToolchainPaths,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            execution_time_limit: Duration::from_millis(5000),
            compile_timeout: Duration::from_millis(4000),
            memory_limit_bytes: 64 * 1024 * 1024,
            output_limit_chars: 100_000,
            code_size_limit_chars: 100_000,
            scratch_dir_limit_bytes: 1024 * 1024,
            scratch_root: std::env::temp_dir().join(SCRATCH_ROOT_DIR_NAME),
            monitoring_enabled: true,
            allow_member_access: true,
            cgroup_root: None,
            reference_root: None,
            toolchains: ToolchainPaths::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SANDBOX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = parse(&lookup, "SANDBOX_WORKER_ID")? {
            config.worker_id = id;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SANDBOX_EXECUTION_TIME_LIMIT_MS")? {
            config.execution_time_limit = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SANDBOX_COMPILE_TIMEOUT_MS")? {
            config.compile_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse(&lookup, "SANDBOX_MEMORY_LIMIT_BYTES")? {
            config.memory_limit_bytes = bytes;
        }
        if let Some(chars) = parse(&lookup, "SANDBOX_OUTPUT_LIMIT_CHARS")? {
            config.output_limit_chars = chars;
        }
        if let Some(chars) = parse(&lookup, "SANDBOX_CODE_SIZE_LIMIT_CHARS")? {
            config.code_size_limit_chars = chars;
        }
        if let Some(bytes) = parse(&lookup, "SANDBOX_SCRATCH_DIR_LIMIT_BYTES")? {
            config.scratch_dir_limit_bytes = bytes;
        }
        if let Some(root) = lookup("SANDBOX_SCRATCH_ROOT") {
            config.scratch_root = root.into();
        }
        if let Some(disabled) = parse::<bool, _>(&lookup, "SANDBOX_DISABLE_MONITORING")? {
            config.monitoring_enabled = !disabled;
        }
        if let Some(allow) = parse(&lookup, "SANDBOX_ALLOW_MEMBER_ACCESS")? {
            config.allow_member_access = allow;
        }
        config.cgroup_root = lookup("SANDBOX_CGROUP_ROOT").map(PathBuf::from);
        config.reference_root = lookup("SANDBOX_REFERENCE_ROOT").map(PathBuf::from);
        if let Some(path) = lookup("SANDBOX_PYTHON_PATH") {
            config.toolchains.python = path.into();
        }
        if let Some(path) = lookup("SANDBOX_SHELL_PATH") {
            config.toolchains.shell = path.into();
        }
        if let Some(path) = lookup("SANDBOX_GNUCPP_PATH").or_else(|| lookup("GNUCPP_PATH")) {
            config.toolchains.gnucpp = path.into();
        }
        config.toolchains.root = lookup("SANDBOX_TOOLCHAIN_ROOT").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_time_limit.is_zero() {
            return Err(ConfigError::ZeroLimit {
                field: "execution_time_limit",
            });
        }
        if self.compile_timeout.is_zero() {
            return Err(ConfigError::ZeroLimit {
                field: "compile_timeout",
            });
        }
        if self.memory_limit_bytes == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "memory_limit_bytes",
            });
        }
        if self.output_limit_chars == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "output_limit_chars",
            });
        }
        if self.code_size_limit_chars == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "code_size_limit_chars",
            });
        }
        if self.scratch_dir_limit_bytes == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "scratch_dir_limit_bytes",
            });
        }
        if self.compile_timeout > self.execution_backstop() {
            return Err(ConfigError::CompileTimeoutTooLong);
        }
        if let Some(root) = &self.toolchains.root {
            if root.parent().is_none() {
                return Err(ConfigError::ToolchainRootTooBroad(root.clone()));
            }
        }
        Ok(())
    }

    pub fn execution_backstop(&self) -> Duration {
        self.execution_time_limit * crate::constants::EXECUTION_BACKSTOP_FACTOR
    }

    /// Scratch directory of the run with the given id.
    pub fn scratch_dir(&self, run_id: Uuid) -> PathBuf {
        self.scratch_root
            .join(self.worker_id.to_string())
            .join(run_id.to_string())
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.execution_time_limit, Duration::from_millis(5000));
        assert_eq!(config.output_limit_chars, 100_000);
        assert_eq!(config.code_size_limit_chars, 100_000);
        assert_eq!(config.scratch_dir_limit_bytes, 1024 * 1024);
        assert!(config.compile_timeout < config.execution_time_limit);
        assert!(config.monitoring_enabled);
        assert!(config.allow_member_access);
        assert!(config.scratch_root.ends_with("Workers"));
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("SANDBOX_EXECUTION_TIME_LIMIT_MS", "250"),
            ("SANDBOX_COMPILE_TIMEOUT_MS", "100"),
            ("SANDBOX_OUTPUT_LIMIT_CHARS", "10"),
            ("SANDBOX_DISABLE_MONITORING", "true"),
            ("GNUCPP_PATH", "/opt/gcc/bin/g++"),
        ]))
        .unwrap();

        assert_eq!(config.execution_time_limit, Duration::from_millis(250));
        assert_eq!(config.compile_timeout, Duration::from_millis(100));
        assert_eq!(config.output_limit_chars, 10);
        assert!(!config.monitoring_enabled);
        assert_eq!(config.toolchains.gnucpp, PathBuf::from("/opt/gcc/bin/g++"));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let result = EngineConfig::from_lookup(lookup_from(&[(
            "SANDBOX_MEMORY_LIMIT_BYTES",
            "lots",
        )]));

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                var: "SANDBOX_MEMORY_LIMIT_BYTES",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let result =
            EngineConfig::from_lookup(lookup_from(&[("SANDBOX_CODE_SIZE_LIMIT_CHARS", "0")]));

        assert!(matches!(
            result,
            Err(ConfigError::ZeroLimit {
                field: "code_size_limit_chars"
            })
        ));
    }

    #[test]
    fn test_compile_timeout_bounded_by_backstop() {
        let result = EngineConfig::from_lookup(lookup_from(&[
            ("SANDBOX_EXECUTION_TIME_LIMIT_MS", "100"),
            ("SANDBOX_COMPILE_TIMEOUT_MS", "1000"),
        ]));

        assert!(matches!(result, Err(ConfigError::CompileTimeoutTooLong)));
    }

    #[test]
    fn test_toolchain_root() {
        let config =
            EngineConfig::from_lookup(lookup_from(&[("SANDBOX_TOOLCHAIN_ROOT", "/opt/python3.12")]))
                .unwrap();
        assert_eq!(config.toolchains.root, Some(PathBuf::from("/opt/python3.12")));

        let result = EngineConfig::from_lookup(lookup_from(&[("SANDBOX_TOOLCHAIN_ROOT", "/")]));
        assert!(matches!(result, Err(ConfigError::ToolchainRootTooBroad(_))));
    }

    #[test]
    fn test_scratch_dir_is_per_worker_and_run() {
        let config = EngineConfig::default();
        let run_id = Uuid::new_v4();

        let dir = config.scratch_dir(run_id);

        assert!(dir.starts_with(&config.scratch_root));
        assert!(dir.ends_with(run_id.to_string()));
    }
}
