use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use itertools::Itertools;
use regex::Regex;

use super::{Toolchain, display_name};
use crate::core::{
    domain::{Artifact, ArtifactKind, Diagnostic, ExceptionInfo, Language, Severity, StackFrame},
    sandbox::SandboxCommand,
};

static LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)(?:, in (?P<method>.+))?$"#).unwrap()
});

static SORRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Sorry: (?P<kind>\w+): (?P<msg>.*) \((?P<file>[^,]+), line (?P<line>\d+)\)$").unwrap()
});

static CHAINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:During handling of the above exception, another exception occurred:|The above exception was the direct cause of the following exception:)$",
    )
    .unwrap()
});

#[derive(Debug, Clone)]
pub struct Python {
    interpreter: PathBuf,
}

impl Python {
    pub fn new(interpreter: &Path) -> Self {
        Self {
            interpreter: interpreter.to_path_buf(),
        }
    }

    fn interpreter(&self) -> SandboxCommand {
        SandboxCommand::new(&self.interpreter)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
    }
}

impl Toolchain for Python {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file(&self) -> &'static str {
        "main.py"
    }

    fn compile_command(&self, source: &Path, _output: &Path, _references: &[PathBuf]) -> SandboxCommand {
        self.interpreter().args(["-m", "py_compile"]).arg(source)
    }

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::Script
    }

    fn run_command(&self, artifact: &Artifact) -> SandboxCommand {
        self.interpreter().args(["-u", "-B"]).arg(&artifact.path)
    }

    fn inline_command(&self, code: &str) -> Option<SandboxCommand> {
        Some(self.interpreter().args(["-u", "-B", "-c", code]))
    }

    fn reference_env(&self, references: &[PathBuf]) -> Vec<(String, String)> {
        if references.is_empty() {
            return Vec::new();
        }
        let search_path = references.iter().map(|path| path.display()).join(":");
        vec![("PYTHONPATH".to_string(), search_path)]
    }

    fn parse_diagnostics(&self, output: &str) -> Vec<Diagnostic> {
        let lines: Vec<&str> = output.lines().collect();

        if let Some(caps) = lines.iter().find_map(|line| SORRY.captures(line)) {
            return vec![Diagnostic {
                message: caps["msg"].to_string(),
                code: Some(caps["kind"].to_string()),
                severity: Severity::Error,
                line: caps["line"].parse::<u32>().unwrap_or(1).saturating_sub(1),
                column: 0,
                file: Some(display_name(&caps["file"])),
            }];
        }

        let Some((idx, caps)) = lines
            .iter()
            .enumerate()
            .rev()
            .find_map(|(idx, line)| LOCATION.captures(line).map(|caps| (idx, caps)))
        else {
            return Vec::new();
        };
        let Some(summary) = lines.iter().rev().find(|line| !line.trim().is_empty()).copied() else {
            return Vec::new();
        };
        let (kind, message) = summary.split_once(": ").unwrap_or((summary, ""));

        // The caret sits under the offending column, the code line above is indented by four.
        let column = lines
            .get(idx + 2)
            .and_then(|caret| caret.find('^'))
            .map(|pos| pos.saturating_sub(4) as u32)
            .unwrap_or(0);

        vec![Diagnostic {
            message: message.trim().to_string(),
            code: Some(kind.trim().to_string()),
            severity: Severity::Error,
            line: caps["line"].parse::<u32>().unwrap_or(1).saturating_sub(1),
            column,
            file: Some(display_name(&caps["file"])),
        }]
    }

    fn parse_exception(&self, stderr: &str) -> Option<ExceptionInfo> {
        let start = stderr.find("Traceback (most recent call last):")?;

        // Sections run from the innermost cause to the exception that was finally raised.
        CHAINED
            .split(&stderr[start..])
            .filter_map(parse_traceback)
            .fold(None, |cause: Option<ExceptionInfo>, mut exception| {
                exception.cause = cause.map(Box::new);
                Some(exception)
            })
    }
}

fn parse_traceback(section: &str) -> Option<ExceptionInfo> {
    let lines: Vec<&str> = section
        .lines()
        .skip_while(|line| !line.starts_with("Traceback"))
        .skip(1)
        .collect();
    let summary = lines
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty() && !line.starts_with(' '))
        .copied()?;
    let (type_name, message) = summary.split_once(": ").unwrap_or((summary, ""));

    let frames = lines
        .iter()
        .filter_map(|line| LOCATION.captures(line))
        .map(|caps| StackFrame {
            method: caps
                .name("method")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            file: Some(display_name(&caps["file"])),
            line: caps["line"].parse().ok(),
        })
        .collect();
    let stack_trace = lines
        .iter()
        .filter(|line| line.starts_with(' '))
        .join("\n");

    Some(
        ExceptionInfo::new(type_name.trim(), message.trim()).with_stack_trace(stack_trace, frames),
    )
}
