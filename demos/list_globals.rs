use std::process::ExitCode;

use kenai_client::display::Display;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let display = match Display::connect() {
        Ok(display) => display,
        Err(err) => {
            eprintln!("Failed to connect to the compositor: {err}");
            return ExitCode::FAILURE;
        }
    };

    let registry = match display.get_registry() {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("Failed to get the registry: {err}");
            return ExitCode::FAILURE;
        }
    };
    registry.set_global_handler(|global| {
        println!("{:>4}  {} v{}", global.name, global.interface, global.version);
    });

    if let Err(err) = display.roundtrip() {
        eprintln!("Roundtrip failed: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
