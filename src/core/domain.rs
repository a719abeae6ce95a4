use std::{fmt, path::PathBuf, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Shell,
    Cpp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    /// A program built from source files, with a compile phase.
    #[default]
    Console,
    /// Source evaluated inline by an interpreter, no compile phase.
    Script,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub name: String,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOptions {
    pub language: Language,
    #[serde(default)]
    pub project_kind: ProjectKind,
    pub code_blocks: Vec<CodeBlock>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub console_input: Vec<String>,
}

impl RunOptions {
    /// Options for a single unnamed code block.
    pub fn new(language: Language, project_kind: ProjectKind, code: impl Into<String>) -> Self {
        Self {
            language,
            project_kind,
            code_blocks: vec![CodeBlock {
                name: "main".to_string(),
                text: code.into(),
            }],
            references: Vec::new(),
            console_input: Vec::new(),
        }
    }

    pub fn with_input<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.console_input = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_references<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references = references.into_iter().map(Into::into).collect();
        self
    }

    /// Total size of the submitted code in characters.
    pub fn code_size(&self) -> usize {
        self.code_blocks
            .iter()
            .map(|block| block.text.chars().count())
            .sum()
    }

    pub fn compile_request(&self) -> CompileRequest {
        CompileRequest {
            language: self.language,
            project_kind: self.project_kind,
            code_blocks: self.code_blocks.clone(),
            references: self.references.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    ExecutionTime,
    MemoryUsage,
    CodeSize,
    CodeOutput,
    DirSize,
}

impl LimitKind {
    pub fn message(&self) -> &'static str {
        match self {
            LimitKind::CodeSize => "Code size limit was exceeded",
            LimitKind::CodeOutput => "Code output limit was exceeded",
            LimitKind::MemoryUsage => "Memory usage limit was exceeded",
            LimitKind::ExecutionTime => "Execution time limit was exceeded",
            LimitKind::DirSize => "Directory size limit was exceeded",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A compiler message. Line and column are zero-based.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub code: Option<String>,
    pub severity: Severity,
    pub line: u32,
    pub column: u32,
    pub file: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            severity: Severity::Error,
            line: 0,
            column: 0,
            file: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(
            f,
            "{}({},{}): {}",
            self.file.as_deref().unwrap_or("<source>"),
            self.line + 1,
            self.column + 1,
            severity
        )?;
        if let Some(code) = &self.code {
            write!(f, " {}", code)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub method: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    pub stack_trace: String,
    pub frames: Vec<StackFrame>,
    pub cause: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: String::new(),
            frames: Vec::new(),
            cause: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        self.stack_trace = stack_trace.into();
        self.frames = frames;
        self
    }

    pub fn caused_by(mut self, cause: ExceptionInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Iterates the exception and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &ExceptionInfo> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }

    pub fn root_cause(&self) -> &ExceptionInfo {
        self.chain().last().unwrap_or(self)
    }

    pub fn formatted(&self) -> String {
        self.chain()
            .map(|e| format!("{}: {}", e.type_name, e.message))
            .join("\n ---> ")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_at: chrono::DateTime<chrono::Utc>,
    pub compile_time_ms: u64,
    pub execute_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_usage_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    None,
    CompilerErrors,
    RuntimeException,
    FatalError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RunOutcome {
    Success { input_requested: bool },
    CompilerErrors { diagnostics: Vec<Diagnostic> },
    RuntimeException { exception: ExceptionInfo },
    FatalError {
        message: String,
        limit: Option<LimitKind>,
    },
}

impl RunOutcome {
    pub fn limit(kind: LimitKind) -> Self {
        RunOutcome::FatalError {
            message: kind.message().to_string(),
            limit: Some(kind),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        RunOutcome::FatalError {
            message: message.into(),
            limit: None,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RunOutcome::Success { .. } => FailureKind::None,
            RunOutcome::CompilerErrors { .. } => FailureKind::CompilerErrors,
            RunOutcome::RuntimeException { .. } => FailureKind::RuntimeException,
            RunOutcome::FatalError { .. } => FailureKind::FatalError,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeardownWarning {
    ClearDirFailed,
    CgroupRemoveFailed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub console_output: String,
    pub stats: RunStats,
    pub teardown_warning: Option<TeardownWarning>,
    pub background_processes_alive: bool,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> FailureKind {
        self.outcome.failure_kind()
    }

    pub fn is_console_input_requested(&self) -> bool {
        matches!(
            self.outcome,
            RunOutcome::Success {
                input_requested: true
            }
        )
    }

    pub fn fatal_error_message(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::FatalError { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn limit_exceeded(&self) -> Option<LimitKind> {
        match &self.outcome {
            RunOutcome::FatalError { limit, .. } => *limit,
            _ => None,
        }
    }

    pub fn compiler_errors(&self) -> &[Diagnostic] {
        match &self.outcome {
            RunOutcome::CompilerErrors { diagnostics } => diagnostics,
            _ => &[],
        }
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        match &self.outcome {
            RunOutcome::RuntimeException { exception } => Some(exception),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompileRequest {
    pub language: Language,
    pub project_kind: ProjectKind,
    pub code_blocks: Vec<CodeBlock>,
    pub references: Vec<String>,
}

impl CompileRequest {
    /// All blocks joined in submission order.
    pub fn joined_source(&self) -> String {
        self.code_blocks.iter().map(|block| block.text.as_str()).join("\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Executable,
    Script,
    Inline(String),
}

#[derive(Clone, Debug)]
pub struct Artifact {
    pub id: Uuid,
    pub language: Language,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub env: Vec<(String, String)>,
    /// Resolved references the program may read while running.
    pub read_paths: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct Compilation {
    pub diagnostics: Vec<Diagnostic>,
    pub artifact: Option<Artifact>,
}

impl Compilation {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    pub cpu_time: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_messages() {
        assert_eq!(LimitKind::CodeSize.message(), "Code size limit was exceeded");
        assert_eq!(LimitKind::CodeOutput.message(), "Code output limit was exceeded");
        assert_eq!(LimitKind::MemoryUsage.message(), "Memory usage limit was exceeded");
        assert_eq!(
            LimitKind::ExecutionTime.message(),
            "Execution time limit was exceeded"
        );
        assert_eq!(LimitKind::DirSize.message(), "Directory size limit was exceeded");
    }

    #[test]
    fn test_code_size_counts_chars_over_all_blocks() {
        let mut options = RunOptions::new(Language::Python, ProjectKind::Console, "ab");
        options.code_blocks.push(CodeBlock {
            name: "helpers".to_string(),
            text: "ёж".to_string(),
        });

        assert_eq!(options.code_size(), 4);
    }

    #[test]
    fn test_exception_chain() {
        let exception = ExceptionInfo::new("Outer", "outer failed")
            .caused_by(ExceptionInfo::new("Inner", "inner failed"));

        assert_eq!(exception.chain().count(), 2);
        assert_eq!(exception.root_cause().type_name, "Inner");
        assert_eq!(
            exception.formatted(),
            "Outer: outer failed\n ---> Inner: inner failed"
        );
    }

    #[test]
    fn test_result_accessors_follow_outcome() {
        let result = RunResult {
            run_id: Uuid::new_v4(),
            outcome: RunOutcome::limit(LimitKind::DirSize),
            console_output: String::new(),
            stats: RunStats::default(),
            teardown_warning: None,
            background_processes_alive: false,
        };

        assert!(!result.is_success());
        assert_eq!(result.failure_kind(), FailureKind::FatalError);
        assert_eq!(
            result.fatal_error_message(),
            Some("Directory size limit was exceeded")
        );
        assert_eq!(result.limit_exceeded(), Some(LimitKind::DirSize));
        assert!(result.compiler_errors().is_empty());
        assert!(result.exception().is_none());
        assert!(!result.is_console_input_requested());
    }

    #[test]
    fn test_diagnostic_display_is_one_based() {
        let diagnostic = Diagnostic {
            message: "expected ';'".to_string(),
            code: None,
            severity: Severity::Error,
            line: 2,
            column: 4,
            file: Some("main.cpp".to_string()),
        };

        assert_eq!(diagnostic.to_string(), "main.cpp(3,5): error: expected ';'");
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: RunOptions = serde_json::from_str(
            r#"{"language": "shell", "code_blocks": [{"name": "main", "text": "echo hi"}]}"#,
        )
        .unwrap();

        assert_eq!(options.project_kind, ProjectKind::Console);
        assert!(options.console_input.is_empty());
        assert!(options.references.is_empty());
    }
}
