use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};

use notisync::app::App;
use notisync::config::Config;
use notisync::logging;

fn main() -> Result<()> {
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(async {
        dotenv::dotenv().ok();

        logging::setup_logging();

        info!("Starting notification sync service");

        let config = Config::from_env()?;
        let mut app = App::build(config.clone()).await?;
        app.start_jobs();

        let router = app.router();
        let listener = tokio::net::TcpListener::bind(&config.api_bind_address)
            .await
            .with_context(|| format!("Failed to bind {}", config.api_bind_address))?;
        info!("Starting API server on {}", config.api_bind_address);

        let mut server_shutdown = app.shutdown_signal();
        let api_handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                error!("API server error: {}", e);
            }
        });

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal, shutting down gracefully");
            }
        }

        app.shutdown().await;
        let _ = api_handle.await;

        info!("Shutdown complete");
        Ok(())
    })
}
