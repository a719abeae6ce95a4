use crate::core::{
    domain::ResourceSample,
    sandbox::{SandboxContext, procfs},
    traits::probe::ResourceProbe,
};

/// Samples a sandbox through its cgroup when it has one, through the
/// `/proc` entries of its process groups otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsProbe;

impl ResourceProbe for ProcfsProbe {
    fn sample(&self, sandbox: &SandboxContext) -> ResourceSample {
        if let Some(cgroup) = sandbox.cgroup() {
            if let Some(memory_bytes) = cgroup.memory_bytes() {
                return ResourceSample {
                    memory_bytes,
                    cpu_time: cgroup.cpu_usage(),
                };
            }
        }

        let members = procfs::group_members(&sandbox.process_groups());
        ResourceSample {
            memory_bytes: members.iter().map(procfs::ProcStat::memory_bytes).sum(),
            cpu_time: Some(members.iter().map(procfs::ProcStat::cpu_time).sum()),
        }
    }
}
