use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod broadcast;
mod camera;
mod config;
mod storage;

use analytics::{ModelRegistry, OnnxLoader, Pipeline};
use api::AppState;
use camera::OpenCvOpener;
use config::Config;
use storage::HttpEventSink;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("zonewatch=debug".parse()?))
        .init();

    let config = Config::load()?;
    tracing::info!(
        port = config.http.port,
        raw_mode = config.pipeline.raw_mode,
        target_fps = config.pipeline.target_fps,
        "configuration loaded"
    );

    let registry = Arc::new(ModelRegistry::new(
        config.models.default_conf,
        config.models.default_iou,
    ));
    let registered = registry.auto_register(&config.models.root, &config.models.auto_register);
    tracing::info!(
        "registered {} model(s) from {}",
        registered.len(),
        config.models.root.display()
    );

    let events = Arc::new(HttpEventSink::spawn(&config.events)?);
    let pipeline = Arc::new(Pipeline::new(
        &config,
        registry,
        Arc::new(OnnxLoader::default()),
        Arc::new(OpenCvOpener),
        events,
    ));

    api::start_server(
        AppState::new(Arc::clone(&pipeline)),
        &config.http.host,
        config.http.port,
    )
    .await?;

    pipeline.stop().await;
    tracing::info!("shutdown complete");

    Ok(())
}
