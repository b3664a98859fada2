use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use swayambhu::lifecycle::{Swayambhu, WakeOutcome};
use swayambhu::llm::BuiltinProvider;
use swayambhu::sandbox::ProcessSandbox;
use swayambhu::store::{FileKvStore, Store};

/// One wake tick of the engine. Run it from cron or a systemd timer; the
/// engine itself decides whether it is due.
#[derive(Debug, Parser)]
#[command(name = "swayambhu", version)]
struct Cli {
    /// Directory holding the durable key-value store.
    #[arg(long, env = "SWAYAMBHU_STATE_DIR", default_value = ".swayambhu")]
    state_dir: PathBuf,

    /// Interpreter argv for sandboxed capabilities without their own
    /// runtime declaration (the code string is appended).
    #[arg(long, env = "SWAYAMBHU_INTERPRETER", value_delimiter = ' ', default_values_t = [String::from("python3"), String::from("-c")])]
    interpreter: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let backend = FileKvStore::new(&cli.state_dir)
        .with_context(|| format!("opening store at {}", cli.state_dir.display()))?;
    let store = Store::new(Arc::new(backend));
    let sandbox = Arc::new(ProcessSandbox::new(cli.interpreter));
    let builtin = Arc::new(BuiltinProvider::new().context("building built-in provider")?);

    let engine = Swayambhu::new(store, sandbox, builtin);
    match engine.wake().await {
        Ok(WakeOutcome::Asleep { until }) => {
            tracing::info!(%until, "asleep");
            Ok(())
        }
        Ok(WakeOutcome::Completed {
            session_id,
            deep_review,
        }) => {
            tracing::info!(session_id, deep_review, "wake completed");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e).context("wake failed; breadcrumb left for recovery")),
    }
}
