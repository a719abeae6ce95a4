//! Minimal procfs reader for the processes of a sandbox.

use std::{fs, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub state: char,
    pub pgrp: i32,
    pub cpu_ticks: u64,
    pub rss_pages: u64,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }

    pub fn memory_bytes(&self) -> u64 {
        self.rss_pages.saturating_mul(page_size())
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_ticks.saturating_mul(1000) / clock_ticks())
    }
}

/// Parses one `/proc/<pid>/stat` line.
pub fn parse_stat(line: &str) -> Option<ProcStat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let pid = line[..open].trim().parse().ok()?;
    let rest: Vec<&str> = line.get(close + 1..)?.split_whitespace().collect();

    let field = |idx: usize| -> Option<u64> { rest.get(idx)?.parse().ok() };
    let cpu_ticks = field(11)? + field(12)? + field(13)? + field(14)?;

    Some(ProcStat {
        pid,
        state: rest.first()?.chars().next()?,
        pgrp: rest.get(2)?.parse().ok()?,
        cpu_ticks,
        rss_pages: field(21)?,
    })
}

pub fn read_stat(pid: i32) -> Option<ProcStat> {
    parse_stat(&fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?)
}

/// Live (non-zombie) processes belonging to any of the given process groups.
pub fn group_members(pgids: &[i32]) -> Vec<ProcStat> {
    if pgids.is_empty() {
        return Vec::new();
    }
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(read_stat)
        .filter(|stat| pgids.contains(&stat.pgrp) && !stat.is_zombie())
        .collect()
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}
