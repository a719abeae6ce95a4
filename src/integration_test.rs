use std::{path::Path, sync::Arc, time::Duration};

use crate::{
    config::EngineConfig,
    core::{
        domain::{Language, LimitKind, ProjectKind, RunOptions},
        orchestrator::Engine,
        sandbox::filesystem_rules_enforced,
    },
    native::{CommandRuntime, ProcfsProbe},
};

fn engine_config(root: &Path) -> EngineConfig {
    EngineConfig {
        execution_time_limit: Duration::from_millis(1500),
        compile_timeout: Duration::from_millis(3000),
        memory_limit_bytes: 64 * 1024 * 1024,
        output_limit_chars: 1000,
        scratch_root: root.to_path_buf(),
        ..EngineConfig::default()
    }
}

fn engine_with(config: EngineConfig) -> Engine {
    let runtime = CommandRuntime::new(&config);
    Engine::new(config, Arc::new(runtime), Arc::new(ProcfsProbe))
}

fn native_engine(root: &Path) -> Engine {
    engine_with(engine_config(root))
}

fn secret_file(dir: &Path) -> std::path::PathBuf {
    let secret = dir.join("secret.txt");
    std::fs::write(&secret, "top secret").expect("Failed to write secret");
    secret
}

fn toolchain_available(language: Language) -> bool {
    let paths = EngineConfig::default().toolchains;
    match language {
        Language::Python => paths.python.exists(),
        Language::Shell => paths.shell.exists(),
        Language::Cpp => paths.gnucpp.exists(),
    }
}

fn shell(code: &str) -> RunOptions {
    RunOptions::new(Language::Shell, ProjectKind::Console, code)
}

const SHELL_GREETER: &str = r#"
echo "Who are you?"
read name
echo "Hello, $name!"
"#;

#[tokio::test]
async fn test_shell_hello_world() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine.run(shell("echo Hello, Integration Test!")).await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(result.console_output, "Hello, Integration Test!");
    assert!(!result.background_processes_alive);
    assert!(result.teardown_warning.is_none());
}

#[tokio::test]
async fn test_shell_requests_missing_input() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine.run(shell(SHELL_GREETER)).await;

    assert!(result.is_console_input_requested(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(result.console_output, "Who are you?");
}

#[tokio::test]
async fn test_shell_replays_input() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine.run(shell(SHELL_GREETER).with_input(["Mike"])).await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert!(!result.is_console_input_requested());
    assert_eq!(
        result.console_output,
        "Who are you?\n[ConsoleInputLine_0]\nHello, Mike!"
    );
}

#[tokio::test]
async fn test_shell_syntax_error_is_a_compiler_error() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine.run(shell("if true; then\necho x\n")).await;

    let errors = result.compiler_errors();
    assert!(!errors.is_empty(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(errors[0].file.as_deref(), Some("main.sh"));
    assert_eq!(result.stats.execute_time_ms, 0);
}

#[tokio::test]
async fn test_shell_failure_is_a_runtime_exception() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine
        .run(shell("echo before\nnot_a_command_anywhere\nexit 3"))
        .await;

    let exception = result.exception().expect("Run should raise an exception");
    assert_eq!(exception.type_name, "ShellError");
    assert!(exception.message.contains("not_a_command_anywhere"));
    assert_eq!(exception.frames[0].line, Some(2));
    assert_eq!(result.console_output, "before");
}

#[tokio::test]
async fn test_shell_time_limit() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine.run(shell("echo started\nsleep 30")).await;

    assert_eq!(result.limit_exceeded(), Some(LimitKind::ExecutionTime));
    assert_eq!(result.console_output, "started");
    assert!(result.stats.execute_time_ms < 10_000);
}

#[tokio::test]
async fn test_shell_output_limit() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine
        .run(shell("while true; do echo xxxxxxxxx; done"))
        .await;

    assert_eq!(result.limit_exceeded(), Some(LimitKind::CodeOutput));
    assert!(result.console_output.len() <= 1000);
    assert!(result.console_output.starts_with("xxxxxxxxx\nxxxxxxxxx"));
}

#[tokio::test]
async fn test_shell_scratch_dir_limit() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine
        .run(shell("head -c 1500000 /dev/zero > big.bin\nsleep 5"))
        .await;

    assert_eq!(result.limit_exceeded(), Some(LimitKind::DirSize));
}

#[tokio::test]
async fn test_shell_background_process_is_reported_and_killed() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine.run(shell("sleep 30 &\necho started")).await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(result.console_output, "started");
    assert!(result.background_processes_alive);
}

#[tokio::test]
async fn test_shell_script_project_runs_inline() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine
        .run(RunOptions::new(Language::Shell, ProjectKind::Script, "echo inline"))
        .await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(result.console_output, "inline");
}

#[tokio::test]
async fn test_unresolved_reference_is_a_compiler_error() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine
        .run(shell("echo unreachable").with_references(["no-such-library"]))
        .await;

    assert_eq!(result.compiler_errors().len(), 1);
    assert!(result.compiler_errors()[0].message.contains("no-such-library"));
}

#[tokio::test]
async fn test_reading_outside_the_sandbox_is_denied() {
    if !filesystem_rules_enforced() {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let secrets = tempfile::tempdir().expect("Failed to create secrets dir");
    let secret = secret_file(secrets.path());
    let engine = native_engine(root.path());

    let result = engine
        .run(shell(&format!("cat {} 2>/dev/null || echo DENIED", secret.display())))
        .await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(result.console_output, "DENIED");
}

#[tokio::test]
async fn test_relocated_shell_cannot_read_its_neighbours() {
    if !filesystem_rules_enforced() || !toolchain_available(Language::Shell) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let install = tempfile::tempdir().expect("Failed to create install dir");
    let secrets = tempfile::tempdir().expect("Failed to create secrets dir");
    let secret = secret_file(secrets.path());
    let relocated = install.path().join("_x_sh");
    std::fs::copy(&EngineConfig::default().toolchains.shell, &relocated)
        .expect("Failed to copy the shell");

    let mut config = engine_config(root.path());
    config.toolchains.shell = relocated;
    let engine = engine_with(config);

    let result = engine
        .run(shell(&format!("cat {} 2>/dev/null || echo DENIED", secret.display())))
        .await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(result.console_output, "DENIED");
}

#[tokio::test]
async fn test_python_cannot_listen() {
    if !toolchain_available(Language::Python) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let source_code = r#"
import socket
server = socket.socket()
server.bind(("127.0.0.1", 0))
server.listen()
print("listening")
"#;

    let result = engine
        .run(RunOptions::new(Language::Python, ProjectKind::Console, source_code))
        .await;

    let exception = result.exception().expect("Run should raise an exception");
    assert_eq!(exception.type_name, "PermissionError");
    assert!(!result.console_output.contains("listening"));
}

#[tokio::test]
async fn test_python_traceback_becomes_exception() {
    if !toolchain_available(Language::Python) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let source_code = r#"
def divide(a, b):
    return a / b

print("dividing")
try:
    divide(1, 0)
except ZeroDivisionError as e:
    raise ValueError("bad input") from e
"#;

    let result = engine
        .run(RunOptions::new(Language::Python, ProjectKind::Console, source_code))
        .await;

    let exception = result.exception().expect("Run should raise an exception");
    assert_eq!(exception.type_name, "ValueError");
    assert_eq!(exception.message, "bad input");
    assert_eq!(exception.root_cause().type_name, "ZeroDivisionError");
    assert_eq!(result.console_output, "dividing");
}

#[tokio::test]
async fn test_python_input() {
    if !toolchain_available(Language::Python) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let source_code = r#"
name = input("Who are you? ")
age = input()
print(f"{name} is {age}")
"#;

    let result = engine
        .run(
            RunOptions::new(Language::Python, ProjectKind::Console, source_code)
                .with_input(["Mike", "42"]),
        )
        .await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(
        result.console_output,
        "Who are you? [ConsoleInputLine_0]\n[ConsoleInputLine_1]\nMike is 42"
    );
}

#[tokio::test]
async fn test_python_syntax_error() {
    if !toolchain_available(Language::Python) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine
        .run(RunOptions::new(Language::Python, ProjectKind::Console, "x = 1\nprint(\"a\"\n"))
        .await;

    let errors = result.compiler_errors();
    assert_eq!(errors.len(), 1, "unexpected outcome: {:?}", result.outcome);
    assert_eq!(errors[0].code.as_deref(), Some("SyntaxError"));
}

#[tokio::test]
async fn test_python_memory_limit() {
    if !toolchain_available(Language::Python) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let source_code = r#"
import time
block = b"x" * (200 * 1024 * 1024)
time.sleep(5)
"#;

    let result = engine
        .run(RunOptions::new(Language::Python, ProjectKind::Console, source_code))
        .await;

    assert_eq!(result.limit_exceeded(), Some(LimitKind::MemoryUsage));
}

#[tokio::test]
async fn test_cpp_hello_world() {
    if !toolchain_available(Language::Cpp) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let source_code = r#"
#include <iostream>
#include <string>
using namespace std;

int main() {
    string name;
    cout << "Who are you?" << endl;
    getline(cin, name);
    cout << "Hello, " << name << "!" << endl;
    return 0;
}
"#;

    let result = engine
        .run(
            RunOptions::new(Language::Cpp, ProjectKind::Console, source_code).with_input(["Mike"]),
        )
        .await;

    assert!(result.is_success(), "unexpected outcome: {:?}", result.outcome);
    assert_eq!(
        result.console_output,
        "Who are you?\n[ConsoleInputLine_0]\nHello, Mike!"
    );
    assert!(result.stats.compile_time_ms > 0);
    assert!(
        result.stats.cpu_time_ms <= result.stats.execute_time_ms + 50,
        "compiler cpu time leaked into the run: {:?}",
        result.stats
    );
}

#[tokio::test]
async fn test_cpp_compile_error() {
    if !toolchain_available(Language::Cpp) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let source_code = r#"
#include <iostream>
int main() {
    std::cout << "Hello, World!" << std::endl
    return 0;
}
"#;

    let result = engine
        .run(RunOptions::new(Language::Cpp, ProjectKind::Console, source_code))
        .await;

    let errors = result.compiler_errors();
    assert!(!errors.is_empty(), "unexpected outcome: {:?}", result.outcome);
    assert!(errors.iter().all(|error| error.file.as_deref() == Some("main.cpp")));
}

#[tokio::test]
async fn test_cpp_uncaught_exception() {
    if !toolchain_available(Language::Cpp) {
        return;
    }
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let source_code = r#"
#include <stdexcept>
int main() { throw std::runtime_error("boom"); }
"#;

    let result = engine
        .run(RunOptions::new(Language::Cpp, ProjectKind::Console, source_code))
        .await;

    let exception = result.exception().expect("Run should raise an exception");
    assert_eq!(exception.type_name, "std::runtime_error");
    assert_eq!(exception.message, "boom");
}

#[tokio::test]
async fn test_cpp_has_no_script_projects() {
    let root = tempfile::tempdir().expect("Failed to create scratch root");
    let engine = native_engine(root.path());

    let result = engine
        .run(RunOptions::new(Language::Cpp, ProjectKind::Script, "int main() {}"))
        .await;

    assert_eq!(
        result.fatal_error_message(),
        Some("Cpp does not support script projects")
    );
    assert_eq!(result.limit_exceeded(), None);
}
