//! Per-language commands and output parsers for [`CommandRuntime`](super::CommandRuntime).

mod cpp;
mod python;
mod shell;

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

pub use cpp::GnuCpp;
pub use python::Python;
pub use shell::Shell;

use crate::{
    config::ToolchainPaths,
    core::{
        domain::{Artifact, ArtifactKind, Diagnostic, ExceptionInfo, Language},
        sandbox::SandboxCommand,
    },
};

/// How one language is checked, built and started.
pub trait Toolchain: Debug + Send + Sync {
    fn language(&self) -> Language;

    /// File name the joined source is written to inside the scratch directory.
    fn source_file(&self) -> &'static str;

    /// Checks or builds `source`. Executables are written to `output`.
    fn compile_command(&self, source: &Path, output: &Path, references: &[PathBuf]) -> SandboxCommand;

    /// What a successful compile leaves behind.
    fn artifact_kind(&self) -> ArtifactKind;

    fn run_command(&self, artifact: &Artifact) -> SandboxCommand;

    /// Evaluates `code` without a compile step. `None` when the language has no such mode.
    fn inline_command(&self, code: &str) -> Option<SandboxCommand>;

    /// Environment that makes `references` visible to the program.
    fn reference_env(&self, _references: &[PathBuf]) -> Vec<(String, String)> {
        Vec::new()
    }

    fn parse_diagnostics(&self, output: &str) -> Vec<Diagnostic>;

    /// Exception the program died with, recovered from its stderr.
    fn parse_exception(&self, stderr: &str) -> Option<ExceptionInfo>;
}

pub fn toolchain_for(language: Language, paths: &ToolchainPaths) -> Box<dyn Toolchain> {
    match language {
        Language::Python => Box::new(Python::new(&paths.python)),
        Language::Shell => Box::new(Shell::new(&paths.shell)),
        Language::Cpp => Box::new(GnuCpp::new(&paths.gnucpp)),
    }
}

/// The file a toolchain binary path points to, `/usr/bin/python3.11` for
/// `/usr/bin/python3`. Only this file is granted, never its directories.
pub fn resolved_binary(binary: &Path) -> Option<PathBuf> {
    std::fs::canonicalize(binary).ok().filter(|path| path.is_file())
}

/// File name only, scratch paths are not shown to the user.
fn display_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolchain_for_each_language() {
        let paths = ToolchainPaths::default();

        for language in [Language::Python, Language::Shell, Language::Cpp] {
            assert_eq!(toolchain_for(language, &paths).language(), language);
        }
    }

    #[test]
    fn test_resolved_binary_is_the_file_itself() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("sh");
        std::fs::copy("/bin/sh", &binary).unwrap();

        let resolved = resolved_binary(&binary).unwrap();

        assert!(resolved.is_file());
        assert!(resolved.ends_with("sh"));
        assert_eq!(resolved_binary(dir.path()), None);
        assert_eq!(resolved_binary(Path::new("/definitely/not/here")), None);
    }

    #[test]
    fn test_display_name_strips_directories() {
        assert_eq!(display_name("/tmp/Workers/abc/main.py"), "main.py");
        assert_eq!(display_name("<string>"), "<string>");
    }
}
