//! Synthetic device fleet CLI: one
//! binary that can drive a single device or a swarm of them against a real
//! or local MQTT broker, publishing metadata + chunk bursts, honoring NACKs,
//! and reacting to capture/sleep commands — useful for exercising
//! `ingest-backend` end to end without real hardware.

mod device;
mod image;

use clap::Parser;
use tracing::info;

/// Drive one or more simulated camera/sensor devices against an MQTT broker.
#[derive(Parser, Debug)]
#[command(name = "device-simulator")]
struct Args {
    /// MQTT broker host.
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Hardware ids to simulate, 12 uppercase hex chars each. Repeatable.
    #[arg(long = "device", required = true)]
    devices: Vec<String>,

    /// Declared JPEG size in bytes for each synthetic capture.
    #[arg(long, default_value_t = 8192)]
    image_size: usize,

    /// Max chunk size in bytes before base64 encoding.
    #[arg(long, default_value_t = 512)]
    max_chunk_size: usize,

    /// Seconds between status messages.
    #[arg(long, default_value_t = 10)]
    status_interval_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_simulator=info".into()),
        )
        .init();

    let args = Args::parse();

    for hw_id in &args.devices {
        if hw_id.len() != 12 || !hw_id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase()) {
            eprintln!("invalid device id {hw_id:?}: expected 12 uppercase hex characters");
            std::process::exit(1);
        }
    }

    info!("simulating {} device(s) against {}:{}", args.devices.len(), args.mqtt_host, args.mqtt_port);

    let mut handles = Vec::new();
    for hw_id in args.devices {
        let profile = device::DeviceProfile {
            hw_id,
            image_size: args.image_size,
            max_chunk_size: args.max_chunk_size,
            status_interval: std::time::Duration::from_secs(args.status_interval_secs),
        };
        let host = args.mqtt_host.clone();
        let port = args.mqtt_port;
        handles.push(tokio::spawn(device::run(profile, host, port)));
    }

    for handle in handles {
        let _ = handle.await;
    }
}
