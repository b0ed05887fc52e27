use clap::Parser;
use mirage_core::logging::init_tracing;
use mirage_core::{AppState, Cli, Config, ProxyEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from(Cli::parse());
    let _guard = init_tracing(config.log_format, config.log_dir.as_deref());

    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(limit) => tracing::debug!(limit, "raised open file limit"),
        Err(e) => tracing::warn!(error = %e, "could not raise open file limit"),
    }

    tracing::info!(?config, "starting mirage");
    let state = AppState::from_config(config)?;
    let engine = ProxyEngine::bind(state).await?;

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}
