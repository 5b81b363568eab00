use std::time::Duration;

use anyhow::Context;
use mock_device::MockOptions;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_device=debug,tower_http=debug")
        .init();

    let addr = std::env::var("MOCK_DEVICE_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let mut options = MockOptions::default();
    if let Ok(ms) = std::env::var("MOCK_REBOOT_MS") {
        let ms: u64 = ms.parse().context("MOCK_REBOOT_MS must be a number of milliseconds")?;
        options.reboot_duration = Duration::from_millis(ms);
    }

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Could not bind {}", addr))?;

    info!("Mock device listening on http://{}", addr);
    mock_device::serve(listener, options).await
}
