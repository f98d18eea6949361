use carryover_cli::{output, pipeline, pipeline::Outcome};
use carryover_core::config::Config;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    // Single error boundary: any failure reports output `false` and a
    // non-zero exit; expected divergences report `false` but exit cleanly.
    match run().await {
        Ok(Outcome::Reused { run_id, artifacts }) => {
            report(true);
            tracing::info!("{} artifacts successfully copied from run {}", artifacts, run_id);
        }
        Ok(Outcome::Skipped(skip)) => {
            report(false);
            tracing::info!("Artifacts not reused: {}", skip);
        }
        Err(e) => {
            report(false);
            tracing::error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<Outcome> {
    let config = Config::from_env()?;
    pipeline::run(&config).await
}

fn report(reused: bool) {
    if let Err(e) = output::set_artifacts_reused(reused) {
        tracing::warn!("Failed to write step output: {:?}", e);
    }
}
