//! Runtime backed by real compilers and interpreters running as sandboxed
//! subprocesses, with resource sampling through procfs and cgroups.

mod bridge;
mod probe;
mod runtime;
pub mod stdin_watch;
pub mod toolchains;

pub use probe::ProcfsProbe;
pub use runtime::CommandRuntime;
