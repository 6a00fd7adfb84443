use clap::{Parser, Subcommand};
use log::{info, warn};
use servolink_client::{ClientConfig, ClientStatus, RemoteClient, StatusSnapshot};
use servolink_shared::{ServoCommand, DEFAULT_HOST, DEFAULT_MCU_NAME, DEFAULT_PORT};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// MCU selected after login
    #[arg(short, long, default_value = DEFAULT_MCU_NAME)]
    mcu: String,

    /// Skip MCU selection after login
    #[arg(long, conflicts_with = "mcu")]
    no_mcu: bool,

    /// How long to wait for each step, in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    /// Maximum bytes read per server reply
    #[arg(long, default_value = "256")]
    recv_buffer: usize,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print the servo table reported by the MCU
    Positions,

    /// Move servos, given as `id:position` pairs
    Move {
        #[arg(required = true, value_parser = parse_servo_command)]
        commands: Vec<ServoCommand>,
    },

    /// Sweep one servo through a range as fast as commands can be queued
    Sweep {
        #[arg(short, long)]
        servo: u8,
        #[arg(long, default_value = "0")]
        from: u8,
        #[arg(long, default_value = "179")]
        to: u8,
        #[arg(long, default_value = "1")]
        step: u8,
    },
}

fn parse_servo_command(value: &str) -> Result<ServoCommand, String> {
    let (id, position) = value
        .split_once(':')
        .ok_or_else(|| format!("expected id:position, got '{}'", value))?;
    let id = id
        .trim()
        .parse()
        .map_err(|e| format!("invalid servo id '{}': {}", id, e))?;
    let position = position
        .trim()
        .parse()
        .map_err(|e| format!("invalid position '{}': {}", position, e))?;
    Ok(ServoCommand::new(id, position))
}

async fn wait_settled(client: &RemoteClient, timeout: Duration) -> Option<StatusSnapshot> {
    client
        .wait_for(|s| s.status == ClientStatus::Idle || s.errored, timeout)
        .await
}

fn print_positions(client: &RemoteClient) {
    for cmd in client.get_current_positions() {
        println!("servo {:>2}: {:>3}", cmd.servo_id, cmd.servo_position);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);
    let mcu = (!args.no_mcu).then(|| args.mcu.clone());

    let config = ClientConfig::new(args.host.clone(), args.port)
        .with_default_mcu(mcu.clone())
        .with_recv_buffer_size(args.recv_buffer)
        .with_connect_timeout(timeout)
        .with_drain_timeout(timeout);
    let client = RemoteClient::new(config)?;

    info!("Connecting to {}:{}", args.host, args.port);
    client.start();

    let snapshot = wait_settled(&client, timeout)
        .await
        .ok_or("timed out waiting for the server")?;
    if snapshot.errored {
        client.shutdown().await;
        return Err(format!("connection failed: {}", snapshot.last_error).into());
    }

    match args.action {
        Action::Positions => {
            if mcu.is_none() {
                warn!("No MCU selected, servo table is empty");
            }
            print_positions(&client);
        }
        Action::Move { commands } => {
            client.send_movement(&commands)?;
            let snapshot = wait_settled(&client, timeout)
                .await
                .ok_or("timed out waiting for the movement")?;
            if snapshot.errored {
                eprintln!("Movement failed: {}", snapshot.last_error);
            }
            print_positions(&client);
        }
        Action::Sweep {
            servo,
            from,
            to,
            step,
        } => {
            let step = step.max(1) as usize;
            let mut queued = 0;
            for position in (from.min(to)..=from.max(to)).step_by(step) {
                client.send_movement(&[ServoCommand::new(servo, position)])?;
                queued += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            info!("Queued {} positions for servo {}", queued, servo);

            wait_settled(&client, timeout)
                .await
                .ok_or("timed out waiting for the sweep")?;
            print_positions(&client);
        }
    }

    client.shutdown().await;
    Ok(())
}
