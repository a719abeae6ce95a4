//! Restrictions applied to a sandboxed child between fork and exec.
//!
//! Everything that allocates is prepared in the parent by [`IsolationPlan::prepare`].
//! The `pre_exec` hook only issues syscalls.

use std::{
    fs::File,
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use tokio::process::Command;

use crate::core::sandbox::Capabilities;

macro_rules! set_limit {
    ($resource:expr, $value:expr) => {{
        let limit = libc::rlimit {
            rlim_cur: $value as libc::rlim_t,
            rlim_max: $value as libc::rlim_t,
        };
        if libc::setrlimit($resource, &limit) != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

pub struct IsolationPlan {
    cgroup_procs: Option<File>,
    max_open_files: u64,
    max_file_size: Option<u64>,
    cpu_seconds: Option<u64>,
    #[cfg(target_os = "linux")]
    landlock: std::sync::Mutex<Option<landlock::RulesetCreated>>,
    #[cfg(target_os = "linux")]
    seccomp: Option<Vec<libc::sock_filter>>,
}

impl std::fmt::Debug for IsolationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationPlan")
            .field("cgroup", &self.cgroup_procs.is_some())
            .field("max_open_files", &self.max_open_files)
            .field("max_file_size", &self.max_file_size)
            .field("cpu_seconds", &self.cpu_seconds)
            .finish()
    }
}

impl IsolationPlan {
    pub fn prepare(
        capabilities: &Capabilities,
        scratch_dir: &Path,
        extra_read_paths: &[PathBuf],
        cgroup_procs: Option<File>,
    ) -> Self {
        #[cfg(not(target_os = "linux"))]
        let _ = (scratch_dir, extra_read_paths);

        Self {
            cgroup_procs,
            max_open_files: capabilities.max_open_files,
            max_file_size: capabilities.max_file_size_bytes,
            cpu_seconds: capabilities
                .cpu_time_limit
                .map(|limit| limit.as_secs_f64().ceil() as u64),
            #[cfg(target_os = "linux")]
            landlock: std::sync::Mutex::new(if capabilities.restrict_filesystem {
                let read_paths = readable_paths(capabilities, extra_read_paths);
                match filesystem::ruleset(&read_paths, &capabilities.device_paths, scratch_dir) {
                    Ok(ruleset) => Some(ruleset),
                    Err(e) => {
                        tracing::warn!("filesystem restrictions unavailable: {}", e);
                        None
                    }
                }
            } else {
                None
            }),
            #[cfg(target_os = "linux")]
            seccomp: seccomp::filter(capabilities.allow_member_access),
        }
    }

    /// Installs the plan as the command's `pre_exec` hook.
    pub fn install(self, cmd: &mut Command) {
        let plan = self;
        // SAFETY: pre_exec runs between fork() and exec() in the child. The closure
        // only issues syscalls on data prepared by the parent and does not allocate
        // on the success path.
        unsafe {
            cmd.pre_exec(move || plan.apply());
        }
    }

    fn apply(&self) -> io::Result<()> {
        // SAFETY: plain syscalls in the freshly forked child.
        unsafe {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }

            if let Some(procs) = &self.cgroup_procs {
                let pid = b"0";
                if libc::write(procs.as_raw_fd(), pid.as_ptr().cast(), pid.len()) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            set_limit!(libc::RLIMIT_CORE, 0);
            set_limit!(libc::RLIMIT_NOFILE, self.max_open_files);
            if let Some(bytes) = self.max_file_size {
                set_limit!(libc::RLIMIT_FSIZE, bytes);
            }
            if let Some(seconds) = self.cpu_seconds {
                set_limit!(libc::RLIMIT_CPU, seconds.max(1));
            }
        }

        #[cfg(target_os = "linux")]
        {
            let ruleset = self.landlock.lock().ok().and_then(|mut slot| slot.take());
            if let Some(ruleset) = ruleset {
                ruleset.restrict_self().map_err(io::Error::other)?;
            }

            // SAFETY: prctl with constant arguments.
            let rc = unsafe {
                libc::prctl(
                    libc::PR_SET_NO_NEW_PRIVS,
                    1 as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }

            if let Some(filter) = &self.seccomp {
                seccomp::install(filter)?;
            }
        }

        Ok(())
    }
}

/// Capability read paths plus the extra ones, minus anything that would grant
/// the whole filesystem.
fn readable_paths<'a>(capabilities: &'a Capabilities, extra: &'a [PathBuf]) -> Vec<&'a PathBuf> {
    capabilities
        .read_paths
        .iter()
        .chain(extra)
        .filter(|path| {
            let is_root = path.parent().is_none();
            if is_root {
                tracing::warn!(path = %path.display(), "refusing to grant read access to the filesystem root");
            }
            !is_root
        })
        .collect()
}

/// Whether the running kernel enforces Landlock filesystem rules.
#[cfg(test)]
pub(crate) fn filesystem_rules_enforced() -> bool {
    #[cfg(target_os = "linux")]
    {
        const LANDLOCK_CREATE_RULESET_VERSION: libc::c_ulong = 1;
        // SAFETY: a version query takes no ruleset attributes.
        let abi = unsafe {
            libc::syscall(
                libc::SYS_landlock_create_ruleset,
                std::ptr::null::<libc::c_void>(),
                0 as libc::size_t,
                LANDLOCK_CREATE_RULESET_VERSION,
            )
        };
        abi >= 1
    }
    #[cfg(not(target_os = "linux"))]
    false
}

#[cfg(target_os = "linux")]
mod filesystem {
    use std::path::{Path, PathBuf};

    use landlock::{
        ABI, Access as _, AccessFs, AccessNet, PathBeneath, PathFd, Ruleset, RulesetAttr as _,
        RulesetCreated, RulesetCreatedAttr as _, RulesetError,
    };

    const ABI_VERSION: ABI = ABI::V4;

    /// Read/execute on `read_paths`, read/write on devices, everything in scratch.
    /// TCP bind is handled without any rule so it is always denied.
    pub fn ruleset(
        read_paths: &[&PathBuf],
        device_paths: &[PathBuf],
        scratch_dir: &Path,
    ) -> Result<RulesetCreated, RulesetError> {
        let mut created = Ruleset::default()
            .handle_access(AccessFs::from_all(ABI_VERSION))?
            .handle_access(AccessNet::BindTcp)?
            .create()?;

        for path in read_paths {
            let Ok(fd) = PathFd::new(path) else {
                continue;
            };
            created = if path.is_dir() {
                created.add_rule(PathBeneath::new(fd, AccessFs::from_read(ABI_VERSION)))?
            } else {
                created.add_rule(PathBeneath::new(fd, AccessFs::ReadFile | AccessFs::Execute))?
            };
        }

        for path in device_paths {
            if let Ok(fd) = PathFd::new(path) {
                created = created.add_rule(PathBeneath::new(
                    fd,
                    AccessFs::ReadFile | AccessFs::WriteFile | AccessFs::Truncate,
                ))?;
            }
        }

        if let Ok(fd) = PathFd::new(scratch_dir) {
            created = created.add_rule(PathBeneath::new(fd, AccessFs::from_all(ABI_VERSION)))?;
        }

        Ok(created)
    }
}

#[cfg(target_os = "linux")]
pub(crate) mod seccomp {
    use std::io;

    const BPF_LD: u16 = 0x00;
    const BPF_JMP: u16 = 0x05;
    const BPF_RET: u16 = 0x06;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_JEQ: u16 = 0x10;
    const BPF_JGE: u16 = 0x30;
    const BPF_K: u16 = 0x00;

    const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
    const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
    const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

    const NR_OFFSET: u32 = 0;
    const ARCH_OFFSET: u32 = 4;

    #[cfg(target_arch = "x86_64")]
    const AUDIT_ARCH: Option<u32> = Some(0xc000_003e);
    #[cfg(target_arch = "aarch64")]
    const AUDIT_ARCH: Option<u32> = Some(0xc000_00b7);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    const AUDIT_ARCH: Option<u32> = None;

    #[cfg(target_arch = "x86_64")]
    const X32_SYSCALL_BIT: Option<u32> = Some(0x4000_0000);
    #[cfg(not(target_arch = "x86_64"))]
    const X32_SYSCALL_BIT: Option<u32> = None;

    pub fn denied_syscalls(allow_member_access: bool) -> Vec<libc::c_long> {
        let mut denied = vec![libc::SYS_listen, libc::SYS_accept, libc::SYS_accept4];
        if !allow_member_access {
            denied.extend([
                libc::SYS_ptrace,
                libc::SYS_process_vm_readv,
                libc::SYS_process_vm_writev,
            ]);
        }
        denied
    }

    /// BPF program denying the given syscalls with EPERM. `None` on unknown architectures.
    pub fn filter(allow_member_access: bool) -> Option<Vec<libc::sock_filter>> {
        let arch = AUDIT_ARCH?;
        let deny = SECCOMP_RET_ERRNO | (libc::EPERM as u32 & 0xffff);

        let mut program = vec![
            stmt(BPF_LD | BPF_W | BPF_ABS, ARCH_OFFSET),
            jump(BPF_JMP | BPF_JEQ | BPF_K, arch, 1, 0),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
            stmt(BPF_LD | BPF_W | BPF_ABS, NR_OFFSET),
        ];
        if let Some(bit) = X32_SYSCALL_BIT {
            program.push(jump(BPF_JMP | BPF_JGE | BPF_K, bit, 0, 1));
            program.push(stmt(BPF_RET | BPF_K, deny));
        }
        for nr in denied_syscalls(allow_member_access) {
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, 1));
            program.push(stmt(BPF_RET | BPF_K, deny));
        }
        program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

        Some(program)
    }

    pub fn install(filter: &[libc::sock_filter]) -> io::Result<()> {
        let prog = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: `prog` points into `filter`, which outlives the call.
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const libc::sock_fprog,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn stmt(code: u16, k: u32) -> libc::sock_filter {
        libc::sock_filter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
        libc::sock_filter { code, jt, jf, k }
    }

}
