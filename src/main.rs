use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use mentorbook::clock::SystemClock;
use mentorbook::config::Config;
use mentorbook::notify::{LogMailer, StaticDirectory};
use mentorbook::runtime::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal outside development.
    let _ = dotenvy::dotenv();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    mentorbook::observability::init_logging(&config.logging)
        .context("installing tracing subscriber")?;
    mentorbook::observability::init(config.metrics.port);

    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!("creating data dir {}", config.storage.data_dir.display())
    })?;

    let runtime = Runtime::start(
        &config,
        Arc::new(SystemClock),
        Arc::new(LogMailer),
        Arc::new(StaticDirectory::new()),
    )?;
    info!("  data_dir: {}", config.storage.data_dir.display());
    info!(
        "  metrics: {}",
        config
            .metrics
            .port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    wait_for_signal().await?;
    info!("shutdown signal received, draining background tasks");
    runtime.shutdown(Duration::from_secs(10)).await;
    info!("mentorbook stopped");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("registering SIGTERM handler")?;
        tokio::select! {
            r = ctrl_c => r.context("listening for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.context("listening for ctrl-c")?;
    }
    Ok(())
}
