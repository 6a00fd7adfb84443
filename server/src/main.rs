use clap::Parser;
use log::info;
use servolink_server::mcu::{McuRegistry, McuSpec};
use servolink_server::network::{SimConfig, SimServer};
use servolink_shared::DEFAULT_PORT;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Simulated MCU as name:servo_count, may be repeated
    #[arg(short, long = "mcu", default_value = "smartMCU:4")]
    mcus: Vec<McuSpec>,

    /// Name of an MCU that starts offline, may be repeated
    #[arg(long)]
    offline: Vec<String>,

    /// Delay between server ACK and device ACK, in milliseconds
    #[arg(short, long, default_value = "50")]
    device_latency_ms: u64,

    /// Random extra device delay, up to this many milliseconds
    #[arg(short, long, default_value = "0")]
    jitter_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut registry = McuRegistry::from_specs(&args.mcus);
    for name in &args.offline {
        if !registry.set_online(name, false) {
            return Err(format!("--offline names unknown MCU '{}'", name).into());
        }
    }

    let config = SimConfig {
        device_latency: Duration::from_millis(args.device_latency_ms),
        device_jitter: Duration::from_millis(args.jitter_ms),
    };

    for spec in &args.mcus {
        info!("MCU '{}' with {} servos", spec.name, spec.servo_count);
    }

    let address = format!("{}:{}", args.host, args.port);
    let server = SimServer::bind(&address, registry, config).await?;

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
