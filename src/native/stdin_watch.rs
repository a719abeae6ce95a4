//! Detects a sandboxed process blocked reading an empty stdin pipe.
//!
//! A task is waiting for input when its fd 0 is our pipe, the pipe holds no
//! unread bytes and the task sleeps in `read(0, ..)`. The syscall comes from
//! `/proc/<pid>/task/<tid>/syscall`, kernels without it fall back to `wchan`.

use std::{
    fs, io,
    os::{fd::AsRawFd, unix::fs::MetadataExt},
};

use crate::core::sandbox::{SandboxContext, procfs};

const PIPE_WAIT_CHANNELS: &[&str] = &["pipe_read", "pipe_wait", "pipe_wait_readable"];

/// Contents of a `syscall` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSyscall {
    Running,
    Blocked { number: i64, first_arg: u64 },
}

impl TaskSyscall {
    pub fn is_stdin_read(&self) -> bool {
        match *self {
            TaskSyscall::Running => false,
            TaskSyscall::Blocked { number, first_arg } => {
                first_arg == 0 && (number == libc::SYS_read as i64 || number == libc::SYS_readv as i64)
            }
        }
    }
}

pub fn parse_syscall(content: &str) -> Option<TaskSyscall> {
    let mut fields = content.split_whitespace();
    let number = fields.next()?;
    if number == "running" {
        return Some(TaskSyscall::Running);
    }
    let number = number.parse().ok()?;
    let first_arg = fields
        .next()
        .map(|arg| u64::from_str_radix(arg.trim_start_matches("0x"), 16))
        .transpose()
        .ok()?
        .unwrap_or(0);

    Some(TaskSyscall::Blocked { number, first_arg })
}

/// Inode of a `pipe:[1234]` fd link target.
pub fn parse_pipe_inode(target: &str) -> Option<u64> {
    target.strip_prefix("pipe:[")?.strip_suffix(']')?.parse().ok()
}

/// Inode of the pipe behind `fd` in this process.
pub fn pipe_inode(fd: &impl AsRawFd) -> Option<u64> {
    fs::metadata(format!("/proc/self/fd/{}", fd.as_raw_fd()))
        .ok()
        .map(|meta| meta.ino())
}

/// Bytes waiting to be read from a pipe. Works on either end.
pub fn pending_bytes(fd: &impl AsRawFd) -> io::Result<usize> {
    let mut pending: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single int through the pointer.
    let rc = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            libc::FIONREAD,
            &mut pending as *mut libc::c_int,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pending.max(0) as usize)
}

/// Whether any process of the sandbox waits on the pipe with inode `stdin_inode`.
pub fn waiting_for_input(sandbox: &SandboxContext, stdin_inode: u64) -> bool {
    procfs::group_members(&sandbox.process_groups())
        .iter()
        .filter(|process| process.state == 'S')
        .filter(|process| stdin_of(process.pid) == Some(stdin_inode))
        .any(|process| blocked_in_stdin_read(process.pid))
}

fn stdin_of(pid: i32) -> Option<u64> {
    let target = fs::read_link(format!("/proc/{}/fd/0", pid)).ok()?;
    parse_pipe_inode(target.to_str()?)
}

fn blocked_in_stdin_read(pid: i32) -> bool {
    let Ok(tasks) = fs::read_dir(format!("/proc/{}/task", pid)) else {
        return false;
    };

    tasks.filter_map(Result::ok).any(|task| {
        let dir = task.path();
        match fs::read_to_string(dir.join("syscall")) {
            Ok(content) => parse_syscall(&content).is_some_and(|call| call.is_stdin_read()),
            Err(_) => fs::read_to_string(dir.join("wchan"))
                .is_ok_and(|wchan| PIPE_WAIT_CHANNELS.contains(&wchan.trim())),
        }
    })
}
