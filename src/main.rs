use skin_sensorhub::{init_tracing, run_skin_hub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG=debug for verbose, RUST_LOG=trace for register traffic
    init_tracing();

    // Load configuration from CONFIG_PATH or default
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    tracing::info!("[SkinSensorHub] configuration path: {}", config_path);

    run_skin_hub(&config_path).await
}
