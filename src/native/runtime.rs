use std::{
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::ExitStatus,
};

use nix::sys::signal::Signal;
use uuid::Uuid;

use super::{
    bridge,
    toolchains::{Toolchain, resolved_binary, toolchain_for},
};
use crate::{
    config::{EngineConfig, ToolchainPaths},
    core::{
        console::Console,
        domain::{
            Artifact, ArtifactKind, Compilation, CompileRequest, Diagnostic, ExceptionInfo,
            Language, LimitKind, ProjectKind,
        },
        sandbox::{SandboxCommand, SandboxContext},
        traits::runtime::{CompileError, ExecuteError, Runtime},
    },
};

const ARTIFACT_FILE: &str = "main";
const EXIT_CODE_TYPE: &str = "NonZeroExitCode";

/// Runs user code as sandboxed subprocesses of real compilers and interpreters.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    toolchains: ToolchainPaths,
    reference_root: Option<PathBuf>,
}

impl CommandRuntime {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            toolchains: config.toolchains.clone(),
            reference_root: config.reference_root.clone(),
        }
    }

    fn toolchain(&self, language: Language) -> Box<dyn Toolchain> {
        toolchain_for(language, &self.toolchains)
    }

    /// Resolves reference names below the reference root. Names that do not
    /// resolve, or resolve outside the root, become compiler errors.
    fn resolve_references(&self, names: &[String]) -> (Vec<PathBuf>, Vec<Diagnostic>) {
        let mut resolved = Vec::new();
        let mut diagnostics = Vec::new();

        for name in names {
            let found = self.reference_root.as_ref().and_then(|root| {
                let root = std::fs::canonicalize(root).ok()?;
                let path = std::fs::canonicalize(root.join(name)).ok()?;
                path.starts_with(&root).then_some(path)
            });
            match found {
                Some(path) => resolved.push(path),
                None => diagnostics.push(Diagnostic::error(format!(
                    "Reference '{}' could not be resolved",
                    name
                ))),
            }
        }

        (resolved, diagnostics)
    }
}

/// Adds what a toolchain needs to read on top of the system paths: its own
/// binary, the configured toolchain root and the resolved references.
fn with_toolchain_paths(
    mut cmd: SandboxCommand,
    sandbox: &SandboxContext,
    toolchain_root: Option<&Path>,
    references: &[PathBuf],
) -> SandboxCommand {
    if !cmd.program().starts_with(sandbox.scratch_dir()) {
        if let Some(binary) = resolved_binary(cmd.program()) {
            cmd = cmd.read_path(binary);
        }
    }
    if let Some(root) = toolchain_root {
        cmd = cmd.read_path(root);
    }
    references
        .iter()
        .fold(cmd, |cmd, reference| cmd.read_path(reference))
}

#[async_trait::async_trait]
impl Runtime for CommandRuntime {
    #[tracing::instrument(skip_all, fields(sandbox_id = %sandbox.id(), language = ?request.language))]
    async fn compile(
        &self,
        request: &CompileRequest,
        sandbox: &SandboxContext,
    ) -> Result<Compilation, CompileError> {
        let toolchain = self.toolchain(request.language);
        let (references, unresolved) = self.resolve_references(&request.references);
        if !unresolved.is_empty() {
            return Ok(Compilation {
                diagnostics: unresolved,
                artifact: None,
            });
        }
        let env = toolchain.reference_env(&references);
        let source = request.joined_source();

        if request.project_kind == ProjectKind::Script {
            if toolchain.inline_command(&source).is_none() {
                return Err(CompileError::Unsupported {
                    msg: format!("{:?} does not support script projects", request.language),
                });
            }
            return Ok(Compilation {
                diagnostics: Vec::new(),
                artifact: Some(Artifact {
                    id: Uuid::new_v4(),
                    language: request.language,
                    kind: ArtifactKind::Inline(source),
                    path: sandbox.scratch_dir().to_path_buf(),
                    env,
                    read_paths: references,
                }),
            });
        }

        let source_path = sandbox.scratch_dir().join(toolchain.source_file());
        let output_path = sandbox.scratch_dir().join(ARTIFACT_FILE);
        tokio::fs::write(&source_path, &source)
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;

        let cmd = with_toolchain_paths(
            toolchain.compile_command(&source_path, &output_path, &references),
            sandbox,
            self.toolchains.root.as_deref(),
            &references,
        );
        tracing::debug!(program = %cmd.program().display(), "Start compilation");
        let output = sandbox
            .spawn(cmd)
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?
            .wait_with_output()
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut diagnostics = toolchain.parse_diagnostics(&stderr);
        if !output.status.success() && !diagnostics.iter().any(Diagnostic::is_error) {
            let first_line = stderr.lines().find(|line| !line.trim().is_empty());
            diagnostics.push(Diagnostic::error(match first_line {
                Some(line) => line.trim().to_string(),
                None => format!("Compilation failed ({})", output.status),
            }));
        }
        tracing::debug!(success = output.status.success(), diagnostics = diagnostics.len(), "compilation done");

        if diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(Compilation {
                diagnostics,
                artifact: None,
            });
        }

        let kind = toolchain.artifact_kind();
        let path = match kind {
            ArtifactKind::Executable => output_path,
            _ => source_path,
        };
        Ok(Compilation {
            diagnostics,
            artifact: Some(Artifact {
                id: Uuid::new_v4(),
                language: request.language,
                kind,
                path,
                env,
                read_paths: references,
            }),
        })
    }

    #[tracing::instrument(skip_all, fields(sandbox_id = %sandbox.id(), artifact_id = %artifact.id))]
    async fn execute(
        &self,
        artifact: &Artifact,
        console: &Console,
        sandbox: &SandboxContext,
    ) -> Result<(), ExecuteError> {
        let toolchain = self.toolchain(artifact.language);
        let cmd = match &artifact.kind {
            ArtifactKind::Inline(code) => {
                toolchain
                    .inline_command(code)
                    .ok_or_else(|| ExecuteError::Internal {
                        msg: format!("{:?} cannot run inline code", artifact.language),
                    })?
            }
            ArtifactKind::Executable | ArtifactKind::Script => toolchain.run_command(artifact),
        };
        let cmd = artifact
            .env
            .iter()
            .fold(
                with_toolchain_paths(
                    cmd,
                    sandbox,
                    self.toolchains.root.as_deref(),
                    &artifact.read_paths,
                ),
                |cmd, (key, value)| cmd.env(key.as_str(), value.as_str()),
            )
            .piped_stdin();

        let child = sandbox
            .spawn(cmd)
            .map_err(|e| ExecuteError::Internal { msg: e.to_string() })?;
        let exit = bridge::drive(child, console, sandbox).await?;

        if exit.status.signal() == Some(libc::SIGKILL) && sandbox.memory_backstop_tripped() {
            return Err(ExecuteError::LimitExceeded(LimitKind::MemoryUsage));
        }
        exit_result(toolchain.as_ref(), exit.status, &exit.stderr)
    }
}

/// Maps how the program ended onto the execution result.
fn exit_result(toolchain: &dyn Toolchain, status: ExitStatus, stderr: &str) -> Result<(), ExecuteError> {
    if status.success() {
        return Ok(());
    }

    let signal = status.signal().and_then(|raw| Signal::try_from(raw).ok());
    match signal {
        Some(Signal::SIGXFSZ) => return Err(ExecuteError::LimitExceeded(LimitKind::DirSize)),
        Some(Signal::SIGXCPU) => return Err(ExecuteError::LimitExceeded(LimitKind::ExecutionTime)),
        _ => {}
    }

    let exception = toolchain
        .parse_exception(stderr)
        .unwrap_or_else(|| exit_exception(status, signal, stderr));
    Err(ExecuteError::Exception(exception))
}

fn exit_exception(status: ExitStatus, signal: Option<Signal>, stderr: &str) -> ExceptionInfo {
    let exception = match (signal, status.code()) {
        (Some(signal), _) => ExceptionInfo::new(
            signal.as_str(),
            format!("Process was terminated by {}", signal.as_str()),
        ),
        (None, Some(code)) => {
            ExceptionInfo::new(EXIT_CODE_TYPE, format!("Process exited with code {}", code))
        }
        (None, None) => ExceptionInfo::new(EXIT_CODE_TYPE, format!("Process ended: {}", status)),
    };
    exception.with_stack_trace(stderr.trim_end(), Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::toolchains::Shell;

    fn exit_with(raw: i32) -> ExitStatus {
        ExitStatus::from_raw(raw)
    }

    #[test]
    fn test_exit_success() {
        let shell = Shell::new(Path::new("/bin/sh"));

        assert!(exit_result(&shell, exit_with(0), "").is_ok());
    }

    #[test]
    fn test_file_size_signal_is_dir_limit() {
        let shell = Shell::new(Path::new("/bin/sh"));

        let result = exit_result(&shell, exit_with(libc::SIGXFSZ), "");

        assert!(matches!(
            result,
            Err(ExecuteError::LimitExceeded(LimitKind::DirSize))
        ));
    }

    #[test]
    fn test_exit_code_without_known_stderr() {
        let shell = Shell::new(Path::new("/bin/sh"));

        let result = exit_result(&shell, exit_with(3 << 8), "oops\n");

        let Err(ExecuteError::Exception(exception)) = result else {
            panic!("expected an exception");
        };
        assert_eq!(exception.type_name, EXIT_CODE_TYPE);
        assert_eq!(exception.message, "Process exited with code 3");
        assert_eq!(exception.stack_trace, "oops");
    }

    #[test]
    fn test_crash_signal_names_the_signal() {
        let shell = Shell::new(Path::new("/bin/sh"));

        let result = exit_result(&shell, exit_with(libc::SIGSEGV), "");

        let Err(ExecuteError::Exception(exception)) = result else {
            panic!("expected an exception");
        };
        assert_eq!(exception.type_name, "SIGSEGV");
    }

    #[test]
    fn test_references_resolve_inside_root_only() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("lib")).unwrap();
        let config = EngineConfig {
            reference_root: Some(root.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let runtime = CommandRuntime::new(&config);

        let (resolved, unresolved) = runtime.resolve_references(&[
            "lib".to_string(),
            "missing".to_string(),
            "../".to_string(),
        ]);

        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].ends_with("lib"));
        assert_eq!(unresolved.len(), 2);
        assert!(unresolved[0].message.contains("missing"));
    }
}
