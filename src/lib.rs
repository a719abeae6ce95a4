pub mod config;
pub mod constants;
pub mod core;
pub mod native;
pub mod stubs;

#[cfg(test)]
mod integration_test;

pub use crate::config::EngineConfig;
pub use crate::core::domain::{
    Language, LimitKind, ProjectKind, RunOptions, RunOutcome, RunResult, RunStats,
};
pub use crate::core::orchestrator::Engine;
