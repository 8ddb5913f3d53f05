use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use analog_input_rs::logging;
use analog_input_rs::{AnalogInput, ModuleConfig, SerialSettings};
use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "analog-input-demo",
    about = "Connect to an analog input module and print streamed samples"
)]
struct Args {
    /// Serial port (e.g., /dev/ttyACM0 or COM3); overrides [serial] in the config
    port: Option<String>,
    /// TOML configuration applied after connecting
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of stream frames to print
    #[arg(short = 'n', long, default_value_t = 20)]
    frames: usize,
    /// Sampling rate in Hz; overrides the config
    #[arg(short, long)]
    rate: Option<u32>,
    /// Read timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ModuleConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ModuleConfig::default(),
    };
    let mut settings = config.serial.clone().unwrap_or_default();
    if let Some(port) = args.port {
        settings.port = port;
    }
    if settings.port.is_empty() {
        anyhow::bail!("No serial port given (argument or [serial] port in the config)");
    }
    settings.timeout = Duration::from_millis(args.timeout_ms);

    println!("Connecting to {}...", settings.port);
    let mut device = connect(&settings)?;
    println!(
        "Connected! Firmware v{}",
        device.firmware_version().unwrap_or_default()
    );

    device
        .apply_config(&config)
        .context("Failed to apply configuration")?;
    if let Some(rate) = args.rate {
        device.set_sampling_rate(rate)?;
    }
    let state = device.state();
    println!(
        "{} channels at {} Hz, ranges {:?}",
        state.n_active_channels,
        state.sampling_rate_hz,
        state.ranges().map(|r| r.name())
    );

    device.start_usb_stream()?;
    println!("Reading {} frames...", args.frames);
    for i in 0..args.frames {
        match device.read_stream_frame() {
            Ok(frame) => {
                let volts: Vec<String> = device
                    .frame_volts(&frame)
                    .iter()
                    .map(|v| format!("{v:+.3}"))
                    .collect();
                println!(
                    "[{:4}] prefix=({:3}, {:3}) | V: {}",
                    i,
                    frame.prefix,
                    frame.sync,
                    volts.join(" ")
                );
            }
            Err(e) => {
                eprintln!("Read error: {e}");
                break;
            }
        }
    }

    println!("Stopping...");
    device.stop_usb_stream()?;
    device.close()?;
    println!("Done.");
    Ok(())
}

fn connect(settings: &SerialSettings) -> Result<AnalogInput> {
    AnalogInput::open_serial(settings)
        .with_context(|| format!("Failed to connect on {}", settings.port))
}
