//! Connects a sandboxed child process to a run's [`Console`].

use std::process::ExitStatus;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin},
    time::MissedTickBehavior,
};

use super::stdin_watch;
use crate::{
    constants::{OUTPUT_DRAIN_GRACE, STDIN_POLL_INTERVAL},
    core::{
        console::{Console, ConsoleInterrupt},
        sandbox::SandboxContext,
        traits::runtime::ExecuteError,
    },
};

const READ_CHUNK: usize = 8192;
/// Enough stderr to recover an exception, the rest is discarded.
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
pub struct ProcessExit {
    pub status: ExitStatus,
    pub stderr: String,
}

/// Incremental UTF-8 decoding of the program's stdout into the console.
#[derive(Debug)]
struct OutputPump<'a> {
    console: &'a Console,
    pending: Vec<u8>,
}

impl<'a> OutputPump<'a> {
    fn new(console: &'a Console) -> Self {
        Self {
            console,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), ConsoleInterrupt> {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let (valid, rest) = self.pending.split_at(e.valid_up_to());
                    // Valid by construction.
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        // Incomplete sequence at the end, wait for more bytes.
                        None => {
                            self.pending = rest.to_vec();
                            break;
                        }
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending = rest[invalid..].to_vec();
                        }
                    }
                }
            }
        }

        if text.is_empty() {
            return Ok(());
        }
        self.console.write(&text)
    }

    fn finish(&mut self) -> Result<(), ConsoleInterrupt> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        self.console.write(&tail)
    }
}

/// Feeds replayed input lines to the child when it blocks on an empty stdin.
#[derive(Debug)]
struct InputFeed {
    pipe: ChildStdin,
    inode: u64,
}

impl InputFeed {
    fn new(pipe: ChildStdin) -> Option<Self> {
        let inode = stdin_watch::pipe_inode(&pipe)?;
        Some(Self { pipe, inode })
    }

    fn child_is_waiting(&self, sandbox: &SandboxContext) -> bool {
        stdin_watch::pending_bytes(&self.pipe).is_ok_and(|pending| pending == 0)
            && stdin_watch::waiting_for_input(sandbox, self.inode)
    }

    /// False once the child closed its end.
    async fn send(&mut self, line: &str) -> bool {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        match self.pipe.write_all(&bytes).await {
            Ok(()) => self.pipe.flush().await.is_ok(),
            Err(e) => {
                tracing::debug!("stdin closed by the program: {}", e);
                false
            }
        }
    }
}

/// Runs `child` to completion, pumping its stdout into `console` and answering
/// its reads from the console's replayed input.
///
/// Dropping the future kills the child.
#[tracing::instrument(skip_all, fields(pid = ?child.id()))]
pub async fn drive(
    mut child: Child,
    console: &Console,
    sandbox: &SandboxContext,
) -> Result<ProcessExit, ExecuteError> {
    let mut stdout = child.stdout.take().ok_or_else(|| internal("stdout is not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| internal("stderr is not piped"))?;
    let mut input = child.stdin.take().and_then(InputFeed::new);
    let mut stderr_task = tokio::spawn(capture_bounded(stderr, STDERR_CAPTURE_LIMIT));

    let mut pump = OutputPump::new(console);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut ticker = tokio::time::interval(STDIN_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let status = loop {
        tokio::select! {
            read = stdout.read(&mut buf), if stdout_open => {
                let n = read.map_err(|e| internal(e.to_string()))?;
                if n == 0 {
                    stdout_open = false;
                } else {
                    pump.push(&buf[..n])?;
                }
            }
            status = child.wait() => break status.map_err(|e| internal(e.to_string()))?,
            _ = ticker.tick(), if input.is_some() => {
                let Some(feed) = input.as_mut() else { continue };
                if !feed.child_is_waiting(sandbox) {
                    continue;
                }
                // Everything printed before the read must precede the input marker.
                while stdin_watch::pending_bytes(&stdout).is_ok_and(|pending| pending > 0) {
                    let n = stdout.read(&mut buf).await.map_err(|e| internal(e.to_string()))?;
                    if n == 0 {
                        stdout_open = false;
                        break;
                    }
                    pump.push(&buf[..n])?;
                }
                let line = console.read_line()?;
                tracing::debug!(consumed = console.reader().consumed(), "fed input line");
                if !feed.send(&line).await {
                    input = None;
                }
            }
        }
    };

    if stdout_open {
        let drain = async {
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => return Ok::<(), ConsoleInterrupt>(()),
                    Ok(n) => pump.push(&buf[..n])?,
                }
            }
        };
        match tokio::time::timeout(OUTPUT_DRAIN_GRACE, drain).await {
            Ok(drained) => drained?,
            Err(_) => tracing::debug!("stdout still held open after exit"),
        }
    }
    pump.finish()?;

    let stderr = match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut stderr_task).await {
        Ok(Ok(stderr)) => stderr,
        Ok(Err(e)) => {
            tracing::warn!("stderr capture failed: {}", e);
            String::new()
        }
        Err(_) => {
            stderr_task.abort();
            String::new()
        }
    };

    tracing::debug!(?status, "process exited");
    Ok(ProcessExit { status, stderr })
}

async fn capture_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut captured = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep reading past the limit so the child never blocks on a full pipe.
                let room = limit.saturating_sub(captured.len()).min(n);
                captured.extend_from_slice(&buf[..room]);
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

fn internal(msg: impl Into<String>) -> ExecuteError {
    ExecuteError::Internal { msg: msg.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pump_joins_split_utf8_sequences() {
        let console = Console::new(100, Vec::new());
        let mut pump = OutputPump::new(&console);
        let bytes = "héllo".as_bytes();

        pump.push(&bytes[..2]).unwrap();
        assert_eq!(console.output(), "h");
        pump.push(&bytes[2..]).unwrap();

        assert_eq!(console.output(), "héllo");
    }

    #[test]
    fn test_pump_replaces_invalid_bytes() {
        let console = Console::new(100, Vec::new());
        let mut pump = OutputPump::new(&console);

        pump.push(b"a\xffb").unwrap();
        pump.push(b"\xe2\x82").unwrap();
        pump.finish().unwrap();

        assert_eq!(console.output(), "a\u{fffd}b\u{fffd}");
    }

    #[test]
    fn test_pump_reports_output_limit() {
        let console = Console::new(3, Vec::new());
        let mut pump = OutputPump::new(&console);

        assert!(matches!(
            pump.push(b"abcd"),
            Err(ConsoleInterrupt::LimitExceeded(_))
        ));
        assert_eq!(console.output(), "abc");
    }

    #[tokio::test]
    async fn test_capture_is_bounded() {
        let data = vec![b'e'; 10_000];

        let captured = capture_bounded(&data[..], 100).await;

        assert_eq!(captured.len(), 100);
    }
}
