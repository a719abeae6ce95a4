use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;

use super::{Toolchain, display_name};
use crate::core::{
    domain::{Artifact, ArtifactKind, Diagnostic, ExceptionInfo, Language, Severity},
    sandbox::SandboxCommand,
};

static DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^:\n]+):(?P<line>\d+):(?P<col>\d+): (?P<sev>fatal error|error|warning|note): (?P<msg>.*)$",
    )
    .unwrap()
});

static THROWN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"terminate called after throwing an instance of '(?P<type>[^']+)'").unwrap());

static WHAT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*what\(\):\s*(?P<msg>.*)$").unwrap());

const LIBRARY_EXTENSIONS: &[&str] = &["a", "o", "so"];

#[derive(Debug, Clone)]
pub struct GnuCpp {
    compiler: PathBuf,
}

impl GnuCpp {
    pub fn new(compiler: &Path) -> Self {
        Self {
            compiler: compiler.to_path_buf(),
        }
    }
}

impl Toolchain for GnuCpp {
    fn language(&self) -> Language {
        Language::Cpp
    }

    fn source_file(&self) -> &'static str {
        "main.cpp"
    }

    fn compile_command(&self, source: &Path, output: &Path, references: &[PathBuf]) -> SandboxCommand {
        let mut cmd = SandboxCommand::new(&self.compiler)
            .args(["-std=c++17", "-O2", "-pipe", "-fdiagnostics-color=never", "-o"])
            .arg(output)
            .arg(source);

        for reference in references {
            let is_library = reference
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| LIBRARY_EXTENSIONS.contains(&ext));
            cmd = if is_library {
                cmd.arg(reference)
            } else {
                cmd.arg("-I").arg(reference)
            };
        }
        cmd
    }

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::Executable
    }

    fn run_command(&self, artifact: &Artifact) -> SandboxCommand {
        SandboxCommand::new(&artifact.path)
    }

    fn inline_command(&self, _code: &str) -> Option<SandboxCommand> {
        None
    }

    fn parse_diagnostics(&self, output: &str) -> Vec<Diagnostic> {
        output
            .lines()
            .filter_map(|line| DIAGNOSTIC.captures(line))
            .map(|caps| Diagnostic {
                message: caps["msg"].to_string(),
                code: None,
                severity: match &caps["sev"] {
                    "warning" => Severity::Warning,
                    "note" => Severity::Info,
                    _ => Severity::Error,
                },
                line: caps["line"].parse::<u32>().unwrap_or(1).saturating_sub(1),
                column: caps["col"].parse::<u32>().unwrap_or(1).saturating_sub(1),
                file: Some(display_name(&caps["file"])),
            })
            .collect()
    }

    fn parse_exception(&self, stderr: &str) -> Option<ExceptionInfo> {
        let thrown = THROWN.captures(stderr)?;
        let message = WHAT
            .captures(stderr)
            .map(|caps| caps["msg"].trim().to_string())
            .unwrap_or_default();

        Some(ExceptionInfo::new(&thrown["type"], message))
    }
}
