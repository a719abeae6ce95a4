use crate::core::{
    console::{Console, ConsoleInterrupt},
    domain::{Artifact, Compilation, CompileRequest, ExceptionInfo, LimitKind},
    sandbox::SandboxContext,
};

/// Compiles and runs user code for one language family.
///
/// Both phases run inside the given sandbox. `execute` drives the program to
/// completion against the console it is handed.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Runtime: std::fmt::Debug + Send + Sync {
    async fn compile(
        &self,
        request: &CompileRequest,
        sandbox: &SandboxContext,
    ) -> Result<Compilation, CompileError>;

    async fn execute(
        &self,
        artifact: &Artifact,
        console: &Console,
        sandbox: &SandboxContext,
    ) -> Result<(), ExecuteError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("{msg}")]
    Unsupported { msg: String },
    #[error("internal compiler failure: {msg}")]
    Internal { msg: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
    #[error("user code raised {}", .0.type_name)]
    Exception(ExceptionInfo),
    #[error(transparent)]
    Interrupted(#[from] ConsoleInterrupt),
    #[error("{0}")]
    LimitExceeded(LimitKind),
    #[error("internal execution failure: {msg}")]
    Internal { msg: String },
}
