use crate::core::{domain::ResourceSample, sandbox::SandboxContext};

/// Reads the current resource usage of everything running in a sandbox.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: std::fmt::Debug + Send + Sync {
    fn sample(&self, sandbox: &SandboxContext) -> ResourceSample;
}
