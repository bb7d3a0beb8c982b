//! drender driver service binary.
//!
//! Wires configuration, providers, the driver event loop, and the HTTP shell.
//! Cloud and storage providers are selected here; the development default runs
//! against the in-process mocks so the control plane can be exercised without
//! an account.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use drender_driver::api;
use drender_driver::config::Config;
use drender_driver::driver::Driver;
use drender_driver::frames::ChannelFeedConnector;
use drender_driver::providers::{
    HealthProbe, HttpHealthProbe, MockJobDispatcher, MockMachineProvider, MockStorageProvider,
    ScriptedHealthProbe,
};
use drender_driver::resources::ResourceManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting drender driver");

    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    // Provider wiring. Real cloud/storage/broker integrations implement the
    // traits in `providers` and `frames` and plug in here; the mocks keep the
    // control plane runnable on a laptop.
    let machines = Arc::new(MockMachineProvider::new());
    let storage = Arc::new(MockStorageProvider::new());
    let probe: Arc<dyn HealthProbe> = if config.dev_mode {
        Arc::new(ScriptedHealthProbe::new())
    } else {
        Arc::new(HttpHealthProbe::new(config.driver.probe_timeout))
    };
    let dispatcher = Arc::new(MockJobDispatcher::new());
    let (connector, feed_tx) = ChannelFeedConnector::pair(config.driver.event_capacity);

    let resources = Arc::new(ResourceManager::new(
        &config.driver,
        machines,
        storage,
        Arc::clone(&probe),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (driver, handle) = Driver::new(
        config.driver.clone(),
        config.broker.clone(),
        config.images.clone(),
        resources,
        probe,
        dispatcher,
        Arc::new(connector),
        shutdown_rx,
    );
    let driver_task = tokio::spawn(driver.run());

    let app = api::create_router(handle);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    drop(feed_tx);
    driver_task.await?;

    Ok(())
}
