use std::time::Duration;

pub const CONSOLE_INPUT_LINE_START: &str = "[ConsoleInputLine_";
pub const CONSOLE_INPUT_LINE_END: &str = "]";

pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const DIR_CHECK_INTERVAL: Duration = Duration::from_millis(200);
pub const STDIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to keep draining pipes after the main process has exited.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

pub const EXECUTION_BACKSTOP_FACTOR: u32 = 2;
pub const EVENTS_CHANNEL_CAPACITY: usize = 128;

pub const SCRATCH_ROOT_DIR_NAME: &str = "Workers";
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub const READ_CHAR_UNSUPPORTED_TYPE: &str = "UnsupportedOperation";
pub const READ_CHAR_UNSUPPORTED_MSG: &str = "Reading single characters from the console is not supported";
pub const CANCELLED_MSG: &str = "Run was cancelled";
pub const INTERNAL_FAILURE_MSG: &str = "Sandbox could not produce a result";
pub const MISSING_ARTIFACT_MSG: &str = "Compilation finished without producing an artifact";
