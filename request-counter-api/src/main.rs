use std::{error::Error, time::Duration};

use figment::{Figment, providers::Env};
use log::info;
use tokio::signal::unix::{SignalKind, signal};

use request_counter_api::{
    config::AppConfig,
    counter::{CounterConfig, CounterService},
    routes,
    store::FileStore,
};

async fn run() -> Result<(), Box<dyn Error>> {
    let config: AppConfig = match Figment::new().merge(Env::prefixed("APP_")).extract() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("Error while parsing config: {e}");

            return Err(Box::new(e));
        }
    };

    config.validate().map_err(Box::new)?;

    info!("Using configuation: {config}");

    let store = FileStore::open(&config.counter_file).map_err(Box::new)?;

    let counter = CounterService::new(
        Box::new(store),
        CounterConfig {
            window: Duration::from_secs(config.window_seconds),
            flush_interval: Duration::from_secs(config.flush_interval_seconds),
            ..CounterConfig::default()
        },
    );
    counter.start();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .map_err(Box::new)?;

    info!("Serving requests at: 0.0.0.0:{}", config.port);

    let app = routes::router(counter.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select!(
      _ = sigint.recv() => {
        info!("Recieved SIGINT, shutting down...")
      },
      _ = sigterm.recv() => {
        info!("Recieved SIGTERM, shutting down...")
      },
    );

    let _ = shutdown_tx.send(());

    // In-flight requests get a bounded grace period to drain.
    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(()))) => (),
        Ok(Ok(Err(e))) => log::error!("Error while serving requests: {e}"),
        Ok(Err(e)) => log::error!("Server task failed: {e}"),
        Err(_) => log::warn!("Grace period expired before all requests completed"),
    }

    counter.stop().await;

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        log::error!("Encountered fatal error: {e}");
        std::process::exit(1);
    }
}
