use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;

use super::{Toolchain, display_name};
use crate::core::{
    domain::{Artifact, ArtifactKind, Diagnostic, ExceptionInfo, Language, Severity, StackFrame},
    sandbox::SandboxCommand,
};

const SHELL_ERROR: &str = "ShellError";

/// dash prints `main.sh: 3: msg`, bash prints `main.sh: line 3: msg`.
static LOCATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^:\n]+): (?:line )?(?P<line>\d+): (?P<msg>.+)$").unwrap()
});

#[derive(Debug, Clone)]
pub struct Shell {
    shell: PathBuf,
}

impl Shell {
    pub fn new(shell: &Path) -> Self {
        Self {
            shell: shell.to_path_buf(),
        }
    }
}

impl Toolchain for Shell {
    fn language(&self) -> Language {
        Language::Shell
    }

    fn source_file(&self) -> &'static str {
        "main.sh"
    }

    fn compile_command(&self, source: &Path, _output: &Path, _references: &[PathBuf]) -> SandboxCommand {
        SandboxCommand::new(&self.shell).arg("-n").arg(source)
    }

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::Script
    }

    fn run_command(&self, artifact: &Artifact) -> SandboxCommand {
        SandboxCommand::new(&self.shell).arg(&artifact.path)
    }

    fn inline_command(&self, code: &str) -> Option<SandboxCommand> {
        Some(SandboxCommand::new(&self.shell).arg("-c").arg(code))
    }

    fn parse_diagnostics(&self, output: &str) -> Vec<Diagnostic> {
        output
            .lines()
            .filter_map(|line| LOCATED.captures(line))
            .map(|caps| Diagnostic {
                message: caps["msg"].trim().to_string(),
                code: None,
                severity: Severity::Error,
                line: caps["line"].parse::<u32>().unwrap_or(1).saturating_sub(1),
                column: 0,
                file: Some(display_name(&caps["file"])),
            })
            .collect()
    }

    fn parse_exception(&self, stderr: &str) -> Option<ExceptionInfo> {
        let caps = stderr.lines().rev().find_map(|line| LOCATED.captures(line))?;
        let frame = StackFrame {
            method: "main".to_string(),
            file: Some(display_name(&caps["file"])),
            line: caps["line"].parse().ok(),
        };

        Some(
            ExceptionInfo::new(SHELL_ERROR, caps["msg"].trim())
                .with_stack_trace(caps[0].to_string(), vec![frame]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> Shell {
        Shell::new(Path::new("/bin/sh"))
    }

    #[test]
    fn test_dash_syntax_error() {
        let diagnostics = shell()
            .parse_diagnostics("/tmp/w/main.sh: 3: Syntax error: end of file unexpected (expecting \"fi\")\n");

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 2);
        assert_eq!(diagnostics[0].file.as_deref(), Some("main.sh"));
        assert!(diagnostics[0].message.starts_with("Syntax error"));
    }

    #[test]
    fn test_bash_syntax_error() {
        let diagnostics =
            shell().parse_diagnostics("main.sh: line 7: syntax error near unexpected token `fi'");

        assert_eq!(diagnostics[0].line, 6);
    }

    #[test]
    fn test_last_located_line_is_the_exception() {
        let exception = shell()
            .parse_exception("main.sh: 2: foo: not found\nmain.sh: 5: bar: not found\n")
            .unwrap();

        assert_eq!(exception.type_name, SHELL_ERROR);
        assert_eq!(exception.message, "bar: not found");
        assert_eq!(exception.frames[0].line, Some(5));
    }

    #[test]
    fn test_unlocated_stderr_is_not_an_exception() {
        assert!(shell().parse_exception("plain failure\n").is_none());
    }
}
