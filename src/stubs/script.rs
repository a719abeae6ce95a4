use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use uuid::Uuid;

use crate::core::{
    console::Console,
    domain::{
        Artifact, ArtifactKind, Compilation, CompileRequest, Diagnostic, ExceptionInfo,
        ResourceSample, Severity, StackFrame,
    },
    sandbox::SandboxContext,
    traits::{
        probe::ResourceProbe,
        runtime::{CompileError, ExecuteError, Runtime},
    },
};

const PROGRAM_FILE: &str = "program.script";
const UNKNOWN_INSTRUCTION: &str = "SCRIPT001";
const BAD_ARGUMENT: &str = "SCRIPT002";

/// In-process runtime for a tiny line-oriented language.
///
/// One instruction per line, `#` starts a comment:
///
/// ```text
/// print Who are you?      write a line, `{name}` expands a variable
/// write text              write without newline
/// read name               read a console line into `name`
/// readkey                 read a single character
/// sleep 100               sleep milliseconds
/// repeat 3 ab             write `ab` three times
/// concat 1000 ab          grow a string by `ab` 1000 times, every copy counts as allocated
/// alloc 4096              count bytes as allocated
/// file out.bin 2048       write a file of that many bytes into the scratch dir
/// throw Type: message     raise an exception
/// cause Type: message     attach a cause to the preceding throw
/// !error 3 message        emit a compiler error for line 3
/// !warning 3 message      emit a compiler warning
/// !compile-delay 500      make compilation take that long
/// ```
#[derive(Debug, Default, Clone)]
pub struct ScriptRuntime {
    programs: Arc<DashMap<Uuid, Program>>,
    allocations: Arc<DashMap<Uuid, u64>>,
}

/// Reports the memory a [`ScriptRuntime`] program has allocated.
#[derive(Debug, Clone)]
pub struct ScriptProbe {
    allocations: Arc<DashMap<Uuid, u64>>,
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> ScriptProbe {
        ScriptProbe {
            allocations: self.allocations.clone(),
        }
    }

    fn allocate(&self, sandbox: &SandboxContext, bytes: u64) {
        *self.allocations.entry(sandbox.id()).or_insert(0) += bytes;
    }
}

/// Forgets a sandbox's allocations once its program stops, however it stops.
struct AllocationScope<'a> {
    allocations: &'a DashMap<Uuid, u64>,
    sandbox_id: Uuid,
}

impl Drop for AllocationScope<'_> {
    fn drop(&mut self) {
        self.allocations.remove(&self.sandbox_id);
    }
}

impl ResourceProbe for ScriptProbe {
    fn sample(&self, sandbox: &SandboxContext) -> ResourceSample {
        ResourceSample {
            memory_bytes: self
                .allocations
                .get(&sandbox.id())
                .map(|bytes| *bytes)
                .unwrap_or(0),
            cpu_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Instruction {
    Print(String),
    Write(String),
    Read(Option<String>),
    ReadKey,
    Sleep(Duration),
    Repeat(usize, String),
    Concat(usize, String),
    Alloc(u64),
    File(String, usize),
    Throw(ExceptionInfo),
}

#[derive(Debug, Clone, Default)]
struct Program {
    instructions: Vec<(u32, Instruction)>,
    compile_delay: Duration,
    diagnostics: Vec<Diagnostic>,
}

fn diagnostic(severity: Severity, line: u32, code: Option<&str>, message: impl Into<String>) -> Diagnostic {
    Diagnostic {
        message: message.into(),
        code: code.map(str::to_string),
        severity,
        line,
        column: 0,
        file: Some(PROGRAM_FILE.to_string()),
    }
}

fn split_exception(text: &str) -> ExceptionInfo {
    match text.split_once(": ") {
        Some((type_name, message)) => ExceptionInfo::new(type_name.trim(), message.trim()),
        None => ExceptionInfo::new(text.trim(), ""),
    }
}

fn parse(source: &str) -> Program {
    let mut program = Program::default();

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx as u32;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
        let bad_argument = |what: &str| {
            diagnostic(
                Severity::Error,
                line_no,
                Some(BAD_ARGUMENT),
                format!("'{}' expects {}", op, what),
            )
        };

        let instruction = match op {
            "!error" | "!warning" => {
                let severity = if op == "!error" {
                    Severity::Error
                } else {
                    Severity::Warning
                };
                let (target, message) = rest.split_once(' ').unwrap_or((rest, ""));
                match target.parse::<u32>() {
                    Ok(target) => program.diagnostics.push(diagnostic(
                        severity,
                        target.saturating_sub(1),
                        None,
                        message,
                    )),
                    Err(_) => program.diagnostics.push(bad_argument("a line number")),
                }
                continue;
            }
            "!compile-delay" => {
                match rest.parse() {
                    Ok(ms) => program.compile_delay = Duration::from_millis(ms),
                    Err(_) => program.diagnostics.push(bad_argument("milliseconds")),
                }
                continue;
            }
            "cause" => {
                let Some((_, Instruction::Throw(exception))) = program.instructions.last_mut() else {
                    program.diagnostics.push(bad_argument("a preceding throw"));
                    continue;
                };
                let mut slot = &mut exception.cause;
                while let Some(next) = slot {
                    slot = &mut next.cause;
                }
                *slot = Some(Box::new(split_exception(rest)));
                continue;
            }
            "print" => Instruction::Print(rest.to_string()),
            "write" => Instruction::Write(rest.to_string()),
            "read" => Instruction::Read((!rest.is_empty()).then(|| rest.to_string())),
            "readkey" => Instruction::ReadKey,
            "sleep" => match rest.parse() {
                Ok(ms) => Instruction::Sleep(Duration::from_millis(ms)),
                Err(_) => {
                    program.diagnostics.push(bad_argument("milliseconds"));
                    continue;
                }
            },
            "repeat" | "concat" => {
                let (count, text) = rest.split_once(' ').unwrap_or((rest, ""));
                match count.parse() {
                    Ok(count) if op == "repeat" => Instruction::Repeat(count, text.to_string()),
                    Ok(count) => Instruction::Concat(count, text.to_string()),
                    Err(_) => {
                        program.diagnostics.push(bad_argument("a count and a text"));
                        continue;
                    }
                }
            }
            "alloc" => match rest.parse() {
                Ok(bytes) => Instruction::Alloc(bytes),
                Err(_) => {
                    program.diagnostics.push(bad_argument("a byte count"));
                    continue;
                }
            },
            "file" => {
                let (name, size) = rest.split_once(' ').unwrap_or((rest, ""));
                match size.parse() {
                    Ok(size) if !name.is_empty() && !name.contains('/') && name != ".." => {
                        Instruction::File(name.to_string(), size)
                    }
                    _ => {
                        program.diagnostics.push(bad_argument("a plain file name and a size"));
                        continue;
                    }
                }
            }
            "throw" => {
                let frame = StackFrame {
                    method: "main".to_string(),
                    file: Some(PROGRAM_FILE.to_string()),
                    line: Some(line_no + 1),
                };
                Instruction::Throw(split_exception(rest).with_stack_trace(
                    format!("at main in {}:line {}", PROGRAM_FILE, line_no + 1),
                    vec![frame],
                ))
            }
            _ => {
                program.diagnostics.push(diagnostic(
                    Severity::Error,
                    line_no,
                    Some(UNKNOWN_INSTRUCTION),
                    format!("Unknown instruction '{}'", op),
                ));
                continue;
            }
        };
        program.instructions.push((line_no, instruction));
    }

    program
}

fn interpolate(text: &str, vars: &HashMap<String, String>) -> String {
    vars.iter().fold(text.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

#[async_trait::async_trait]
impl Runtime for ScriptRuntime {
    #[tracing::instrument(skip_all, fields(sandbox_id = %sandbox.id()))]
    async fn compile(
        &self,
        request: &CompileRequest,
        sandbox: &SandboxContext,
    ) -> Result<Compilation, CompileError> {
        let source = request.joined_source();
        tracing::debug!("Start compilation: {} bytes", source.len());

        let path = sandbox.scratch_dir().join(PROGRAM_FILE);
        tokio::fs::write(&path, &source)
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;

        let program = parse(&source);
        tokio::time::sleep(program.compile_delay).await;

        let diagnostics = program.diagnostics.clone();
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(Compilation {
                diagnostics,
                artifact: None,
            });
        }

        let artifact = Artifact {
            id: Uuid::new_v4(),
            language: request.language,
            kind: ArtifactKind::Script,
            path,
            env: Vec::new(),
            read_paths: Vec::new(),
        };
        self.programs.insert(artifact.id, program);

        Ok(Compilation {
            diagnostics,
            artifact: Some(artifact),
        })
    }

    #[tracing::instrument(skip_all, fields(sandbox_id = %sandbox.id()))]
    async fn execute(
        &self,
        artifact: &Artifact,
        console: &Console,
        sandbox: &SandboxContext,
    ) -> Result<(), ExecuteError> {
        let Some((_, program)) = self.programs.remove(&artifact.id) else {
            return Err(ExecuteError::Internal {
                msg: format!("unknown artifact {}", artifact.id),
            });
        };
        let _scope = AllocationScope {
            allocations: &self.allocations,
            sandbox_id: sandbox.id(),
        };
        let mut vars = HashMap::new();

        for (line_no, instruction) in program.instructions {
            tracing::trace!(line = line_no + 1, ?instruction, "executing");
            match instruction {
                Instruction::Print(text) => console.write_line(&interpolate(&text, &vars))?,
                Instruction::Write(text) => console.write(&interpolate(&text, &vars))?,
                Instruction::Read(var) => {
                    let line = console.read_line()?;
                    if let Some(var) = var {
                        vars.insert(var, line);
                    }
                }
                Instruction::ReadKey => {
                    console.read_char()?;
                }
                Instruction::Sleep(duration) => tokio::time::sleep(duration).await,
                Instruction::Repeat(count, text) => {
                    for i in 0..count {
                        console.write(&text)?;
                        if i % 1000 == 999 {
                            tokio::task::yield_now().await;
                        }
                    }
                }
                Instruction::Concat(count, chunk) => {
                    let mut text = String::new();
                    for i in 0..count {
                        text = format!("{}{}", text, chunk);
                        self.allocate(sandbox, text.len() as u64);
                        if i % 100 == 99 {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    }
                    vars.insert("length".to_string(), text.len().to_string());
                }
                Instruction::Alloc(bytes) => self.allocate(sandbox, bytes),
                Instruction::File(name, size) => {
                    tokio::fs::write(sandbox.scratch_dir().join(&name), vec![b'x'; size])
                        .await
                        .map_err(|e| ExecuteError::Internal { msg: e.to_string() })?;
                }
                Instruction::Throw(exception) => return Err(ExecuteError::Exception(exception)),
            }
            tokio::task::yield_now().await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        core::{
            domain::{Language, LimitKind, ProjectKind, RunOptions},
            orchestrator::Engine,
        },
    };

    fn engine_for(runtime: &ScriptRuntime, root: &std::path::Path) -> Engine {
        let config = EngineConfig {
            memory_limit_bytes: 1024 * 1024,
            scratch_root: root.to_path_buf(),
            cgroup_root: None,
            ..EngineConfig::default()
        };
        let usage = ScriptProbe {
            allocations: runtime.allocations.clone(),
        };
        Engine::new(config, Arc::new(runtime.clone()), Arc::new(usage))
    }

    #[tokio::test]
    async fn test_allocations_are_forgotten_after_a_run() {
        let root = tempfile::tempdir().unwrap();
        let runtime = ScriptRuntime::new();
        let engine = engine_for(&runtime, root.path());

        let result = engine
            .run(RunOptions::new(
                Language::Shell,
                ProjectKind::Script,
                "alloc 4096\nprint done",
            ))
            .await;

        assert!(result.is_success());
        assert!(runtime.allocations.is_empty());
    }

    #[tokio::test]
    async fn test_allocations_are_forgotten_after_a_limit_breach() {
        let root = tempfile::tempdir().unwrap();
        let runtime = ScriptRuntime::new();
        let engine = engine_for(&runtime, root.path());

        let result = engine
            .run(RunOptions::new(
                Language::Shell,
                ProjectKind::Script,
                "alloc 2097152\nsleep 5000",
            ))
            .await;

        assert_eq!(result.limit_exceeded(), Some(LimitKind::MemoryUsage));
        assert!(runtime.allocations.is_empty());
    }

    #[test]
    fn test_parse_reports_unknown_instructions_with_line() {
        let program = parse("print ok\n\nfrobnicate now\n");

        assert_eq!(program.instructions.len(), 1);
        assert_eq!(program.diagnostics.len(), 1);
        assert_eq!(program.diagnostics[0].line, 2);
        assert_eq!(
            program.diagnostics[0].code.as_deref(),
            Some(UNKNOWN_INSTRUCTION)
        );
    }

    #[test]
    fn test_parse_directives() {
        let program = parse("!warning 1 unused variable\n!compile-delay 250\nprint hi");

        assert_eq!(program.compile_delay, Duration::from_millis(250));
        assert_eq!(program.diagnostics.len(), 1);
        assert_eq!(program.diagnostics[0].severity, Severity::Warning);
        assert_eq!(program.diagnostics[0].line, 0);
        assert_eq!(program.diagnostics[0].message, "unused variable");
    }

    #[test]
    fn test_parse_nested_causes() {
        let program = parse(
            "throw InvalidOperation: outer\ncause Io: middle\ncause Permission: inner",
        );

        let Some((0, Instruction::Throw(exception))) = program.instructions.first() else {
            panic!("expected a throw on the first line");
        };
        let types: Vec<&str> = exception.chain().map(|e| e.type_name.as_str()).collect();
        assert_eq!(types, vec!["InvalidOperation", "Io", "Permission"]);
        assert_eq!(exception.frames[0].line, Some(1));
    }

    #[test]
    fn test_parse_rejects_file_names_outside_scratch() {
        let program = parse("file ../escape.txt 10\nfile ok.txt 10");

        assert_eq!(program.instructions.len(), 1);
        assert_eq!(program.diagnostics[0].code.as_deref(), Some(BAD_ARGUMENT));
    }

    #[test]
    fn test_interpolate() {
        let vars = HashMap::from([("name".to_string(), "Mike".to_string())]);

        assert_eq!(interpolate("Hello {name}!", &vars), "Hello Mike!");
        assert_eq!(interpolate("{missing}", &vars), "{missing}");
    }
}
