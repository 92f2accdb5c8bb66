use std::io::{self, Write};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spm_rotator::calibration::Calibrator;
use spm_rotator::config::{self, RuntimeConfig};
use spm_rotator::messages::{Arm, Orientation};
use spm_rotator::motor::{Actuators, Geometry};
use spm_rotator::runtime::{self, BoxError, PlatformServos};

#[derive(Parser, Debug)]
#[command(version, about = "Antenna rotator on a four-arm spherical parallel manipulator")]
struct Cli {
    /// Serial device of the servo bus
    #[arg(long, default_value = config::SERIAL_PORT)]
    serial_port: String,

    #[arg(long, default_value_t = config::BAUD_RATE)]
    baud_rate: u32,

    /// Motion loop rate, Hz
    #[arg(long, default_value_t = config::LOOP_HZ)]
    loop_hz: u64,

    /// Maximum slew rate, degrees per second
    #[arg(long, default_value_t = config::MAX_VELOCITY_DEG_S)]
    max_velocity: f64,

    /// Drive a simulated servo bus instead of hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve the rotctl protocol (default)
    Rotctl {
        #[arg(long, default_value = config::LISTEN_HOST)]
        host: String,

        #[arg(long, default_value_t = config::LISTEN_PORT)]
        port: u16,

        /// Publish status snapshots over Zenoh
        #[arg(long)]
        telemetry: bool,
    },
    /// Set each arm's servo offset by hand
    Calibrate,
    /// Move to one orientation and exit
    Position {
        #[arg(allow_hyphen_values = true)]
        azimuth: f64,
        elevation: f64,
    },
    /// Sweep the whole workspace
    Demo,
}

// One worker thread: tasks share it cooperatively, and Zenoh needs the multi-thread flavor
#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    let mut config = RuntimeConfig {
        serial_port: cli.serial_port,
        baud_rate: cli.baud_rate,
        loop_hz: cli.loop_hz,
        max_velocity_deg_s: cli.max_velocity,
        simulate: cli.simulate,
        ..RuntimeConfig::default()
    };

    let result = match cli.mode {
        None => runtime::run(config).await,
        Some(Mode::Rotctl {
            host,
            port,
            telemetry,
        }) => {
            config.host = host;
            config.port = port;
            config.telemetry = telemetry;
            runtime::run(config).await
        }
        Some(Mode::Calibrate) => calibrate(config).await,
        Some(Mode::Position { azimuth, elevation }) => {
            runtime::position(config, Orientation::new(azimuth, elevation)).await
        }
        Some(Mode::Demo) => runtime::demo(config).await,
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn calibrate(config: RuntimeConfig) -> Result<(), BoxError> {
    // Serial I/O and stdin both block; keep them off the async worker
    let offsets = tokio::task::spawn_blocking(move || -> Result<[f64; 4], BoxError> {
        let mut servos = PlatformServos::open(&config)?;
        servos.engage_all()?;

        let calibrator = Calibrator::new(Geometry::default());
        let offsets = calibrator.run(&mut servos, |arm, _| {
            print!("Adjust the {} arm to be fully extended and press ENTER...", arm);
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            Ok(())
        })?;
        Ok(offsets)
    })
    .await??;

    for arm in Arm::ALL {
        println!("{}: {:+.2}°", arm, offsets[arm.index()]);
    }
    Ok(())
}
