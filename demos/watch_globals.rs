use kenai_client::{display::Display, readiness::AsyncDisplayFd};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let display = Display::connect()?;
    let registry = display.get_registry()?;
    registry.set_global_handler(|global| {
        info!(name = global.name, interface = global.interface, version = global.version, "global added");
    });
    registry.set_global_remove_handler(|name| {
        info!(name, "global removed");
    });

    let fd = AsyncDisplayFd::new(&display)?;
    loop {
        fd.dispatch(&display).await?;
    }
}
