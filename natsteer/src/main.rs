use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};

use natsteer_common::{DEFAULT_SERVICE_PORT, FLOW_MAP_MAX_ENTRIES};

mod ebpf_loader;
mod flowmap;
mod pipeline;
mod usermode;

#[derive(Parser)]
#[command(name = "natsteer")]
#[command(about = "In-path UDP service steering agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the in-kernel steering program to an interface
    Attach(AttachCommand),
    /// Manage tracked destinations in the pinned flow map
    Flow(FlowCommand),
    /// Run the AF_PACKET fallback pipeline instead of the in-kernel program
    Usermode(UsermodeCommand),
}

#[derive(Args)]
struct AttachCommand {
    /// Network interface to steer traffic on
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// UDP destination port that selects steering candidates
    #[arg(long, default_value_t = DEFAULT_SERVICE_PORT)]
    service_port: u16,
    /// Interface redirected frames leave through (defaults to hairpin)
    #[arg(long, value_name = "IFACE")]
    egress_iface: Option<String>,
    /// Capacity of the tracked destination map
    #[arg(long, default_value_t = FLOW_MAP_MAX_ENTRIES)]
    flow_map_entries: u32,
    /// Pin path for the flow map
    #[arg(long, value_name = "PATH", default_value = ebpf_loader::DEFAULT_FLOW_MAP_PIN)]
    flow_pin: PathBuf,
    /// Pin path for the runtime config map
    #[arg(long, value_name = "PATH", default_value = ebpf_loader::DEFAULT_CONFIG_MAP_PIN)]
    config_pin: PathBuf,
    /// Destination address to track from the start (repeatable)
    #[arg(long = "track", value_name = "ADDR")]
    track: Vec<Ipv4Addr>,
}

#[derive(Args)]
struct FlowCommand {
    /// Pin path for the flow map
    #[arg(long, value_name = "PATH", default_value = ebpf_loader::DEFAULT_FLOW_MAP_PIN)]
    pin: PathBuf,
    #[command(subcommand)]
    action: FlowAction,
}

#[derive(Subcommand)]
enum FlowAction {
    /// Install or overwrite a tracked destination
    Update {
        addr: Ipv4Addr,
        /// Initial hit counter value
        #[arg(long, default_value_t = 0)]
        count: u16,
    },
    /// Remove a tracked destination
    Delete { addr: Ipv4Addr },
    /// Print the hit counter for one destination
    Get { addr: Ipv4Addr },
    /// Print every tracked destination as JSON
    Dump,
}

#[derive(Args)]
struct UsermodeCommand {
    /// Network interface to join via AF_PACKET
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Number of worker threads pulling frames from the fanout group
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Optional PACKET_FANOUT group id
    #[arg(long, value_name = "GROUP")]
    fanout_group: Option<u16>,
    /// UDP destination port that selects steering candidates
    #[arg(long, default_value_t = DEFAULT_SERVICE_PORT)]
    service_port: u16,
    /// Capacity of the tracked destination table
    #[arg(long, default_value_t = FLOW_MAP_MAX_ENTRIES as usize)]
    flow_capacity: usize,
    /// Destination address to track from the start (repeatable)
    #[arg(long = "track", value_name = "ADDR")]
    track: Vec<Ipv4Addr>,
    /// File of additional destinations to track, one per line
    #[arg(long, value_name = "PATH")]
    track_file: Option<PathBuf>,
    /// Seconds between stat snapshots printed to stdout
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
    /// Size of each tpacket block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = usermode::DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    /// Number of blocks provisioned for the RX ring
    #[arg(long, value_name = "COUNT", default_value_t = usermode::DEFAULT_BLOCK_COUNT)]
    block_count: u32,
    /// Size of each frame within a block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = usermode::DEFAULT_FRAME_SIZE)]
    frame_size: u32,
    /// Milliseconds before an idle block is recycled
    #[arg(long, value_name = "MILLIS", default_value_t = usermode::DEFAULT_BLOCK_TIMEOUT_MS)]
    block_timeout_ms: u32,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("natsteer error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = ebpf_loader::AttachOptions {
                iface: cmd.iface,
                service_port: cmd.service_port,
                egress_iface: cmd.egress_iface,
                flow_map_entries: cmd.flow_map_entries,
                flow_pin_path: cmd.flow_pin,
                config_pin_path: cmd.config_pin,
                track: cmd.track,
            };
            ebpf_loader::attach_program(opts).await?;
        }
        Some(Commands::Flow(cmd)) => run_flow(cmd)?,
        Some(Commands::Usermode(cmd)) => {
            let opts = usermode::UsermodeOptions {
                iface: cmd.iface,
                workers: cmd.workers,
                fanout_group: cmd.fanout_group,
                service_port: cmd.service_port,
                flow_capacity: cmd.flow_capacity,
                track: cmd.track,
                track_file: cmd.track_file,
                report_interval: Duration::from_secs(cmd.report_interval_secs.max(1)),
                ring: usermode::RingConfig {
                    block_size: cmd.block_size,
                    block_count: cmd.block_count,
                    frame_size: cmd.frame_size,
                    block_timeout_ms: cmd.block_timeout_ms,
                },
            };
            usermode::run_usermode_pipeline(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn run_flow(cmd: FlowCommand) -> Result<()> {
    match cmd.action {
        FlowAction::Update { addr, count } => {
            flowmap::update(&cmd.pin, addr, count)?;
            println!("tracking {addr}");
        }
        FlowAction::Delete { addr } => {
            flowmap::delete(&cmd.pin, addr)?;
            println!("removed {addr}");
        }
        FlowAction::Get { addr } => {
            let count = flowmap::get(&cmd.pin, addr)?;
            println!("{addr}: {count}");
        }
        FlowAction::Dump => {
            let value = flowmap::dump(&cmd.pin)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}
