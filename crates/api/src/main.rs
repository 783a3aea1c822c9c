//! Machine-vision camera server - Main Entry Point
//!
//! Usage: `mvcam-server [config.toml]`

use std::path::Path;

use camera_api::{init_logging, run_server, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let config = AppConfig::load(config_path.as_deref().map(Path::new))?;
    init_logging(&config.server.log_level, config.server.log_json)?;

    info!("=== Camera Server v{} ===", env!("CARGO_PKG_VERSION"));

    #[cfg(feature = "ffi")]
    let driver = camera_driver::MvSdkDriver::new();
    #[cfg(not(feature = "ffi"))]
    let driver = {
        tracing::warn!("Built without the camera SDK, serving the mock camera");
        camera_driver::MockDriver::default()
    };

    run_server(config, driver).await?;

    Ok(())
}
