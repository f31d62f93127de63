//! Heartbeat example
//!
//! Prints device identity and a few seconds of heartbeat events.
//!
//! Usage:
//!   cargo run --example heartbeat -- /dev/ttyACM0
//!   cargo run --example heartbeat            (virtual device)

use harpcom_core::{DeviceSession, SerialConfig, SessionConfig, VirtualDevice, VirtualDeviceConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let session = match std::env::args().nth(1) {
        Some(port) => {
            println!("Connecting to {port}...");
            DeviceSession::open_serial(SerialConfig::new(&port, 1_000_000), SessionConfig::default())?
        }
        None => {
            println!("No port given, using the virtual device");
            let (transport, _device) = VirtualDevice::connect(VirtualDeviceConfig::default());
            DeviceSession::open(transport, SessionConfig::default())?
        }
    };

    println!("{}\n", session.device_info().await?);

    session.enable_heartbeat().await?;
    for _ in 0..3 {
        match session.poll_event(Duration::from_secs(2)).await {
            Some(event) => println!("{event}"),
            None => println!("no heartbeat"),
        }
    }
    session.disable_heartbeat().await?;

    println!("\n{:#?}", session.stats());
    session.close().await;
    Ok(())
}
