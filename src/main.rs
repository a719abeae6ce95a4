use std::panic;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use snippet_sandbox::{
    Engine, EngineConfig, RunOptions,
    native::{CommandRuntime, ProcfsProbe},
    stubs::script::ScriptRuntime,
};

/// Reads one `RunOptions` JSON document from stdin and writes the `RunResult`
/// JSON to stdout. Logs go to stderr.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let config = EngineConfig::from_env()?;
    tracing::info!(worker_id = %config.worker_id, scratch_root = %config.scratch_root.display(), "worker starting");
    let engine = build_engine(config);

    let mut request = String::new();
    tokio::io::stdin().read_to_string(&mut request).await?;
    let options: RunOptions = serde_json::from_str(&request)?;

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(?event, "lifecycle event");
        }
    });

    let run_id = Uuid::new_v4();
    let run = engine.run_with_id(run_id, options);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            engine.abandon(run_id);
            run.await
        }
    };

    let mut response = serde_json::to_vec_pretty(&result)?;
    response.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&response).await?;
    stdout.flush().await?;

    Ok(())
}

fn build_engine(config: EngineConfig) -> Engine {
    match std::env::var("SANDBOX_RUNTIME").as_deref() {
        Ok("script") => {
            tracing::info!("using the in-process script runtime");
            let runtime = ScriptRuntime::new();
            let probe = runtime.probe();
            Engine::new(config, Arc::new(runtime), Arc::new(probe))
        }
        _ => {
            let runtime = CommandRuntime::new(&config);
            Engine::new(config, Arc::new(runtime), Arc::new(ProcfsProbe))
        }
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
