//! Segmentation server binary.
//!
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use env_logger::TimestampPrecision;
use seg_server::{
    config::ServerConfig,
    data_socket::spawn_data_socket,
    endpoints::{router, HttpSettings},
    loader::ModelLoader,
    meter::spawn_meter_logger,
    pubsub::NamedPubSub,
    shell::ShellStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let store = Arc::new(ShellStore::from_config(&config)?);
    let loader = ModelLoader::new(config.model_source())
        .with_cache_dir(config.cache_dir())
        .with_input_shape(config.input_shape())
        .with_retries(config.load_retries);
    store.init(loader);

    // Create socket to receive image streams via network
    let pubsub = Arc::new(NamedPubSub::new());
    spawn_data_socket(pubsub.clone(), &config.socket_address).await?;

    spawn_meter_logger();

    // Build HTTP server with endpoints
    let settings = HttpSettings {
        jpeg_quality: config.jpeg_quality,
    };
    let app = router(store.clone(), pubsub, settings);

    // Serve HTTP server
    let addr: SocketAddr = config.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutting down");
        })
        .await?;

    store.teardown();

    Ok(())
}
