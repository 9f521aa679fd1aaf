use publisher::{PublisherPipeline, SharedSessions};
use share_bus::Bus;
use share_storage::{Migration, Storage};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MIGRATIONS: &[Migration] = &[];

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let storage_root = env::var("SHARE_STORAGE_ROOT").expect("SHARE_STORAGE_ROOT must be set");
    let coordinator_url = env::var("SHARE_COORDINATOR_URL").ok();

    let bus = Bus::new();
    let storage =
        Storage::open(&storage_root, bus.clone(), MIGRATIONS).expect("failed to open storage");
    let shared = Arc::new(SharedSessions::new());
    let client = reqwest::Client::new();

    let pipeline = PublisherPipeline::new(&bus, shared, client, coordinator_url);
    info!(root = %storage_root, "publisher pipeline running");

    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    info!("received Ctrl+C, draining pending writes");
    pipeline.shutdown(Duration::from_secs(5)).await;
    drop(storage);
}
