// Servo diagnostic: READ-ONLY check of the four arm servos
//
// Nothing is written to the servos, torque is left as it is.
//
// Usage: cargo run --example servo_diagnostic -- [port]
// Example: cargo run --example servo_diagnostic -- /dev/ttyUSB0

use spm_rotator::config::SERIAL_PORT;
use spm_rotator::messages::Arm;
use spm_rotator::motor::{ArmAngles, Geometry, Lx16aBus};
use std::io::{self, Write};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warn".parse().unwrap()),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| SERIAL_PORT.to_string());

    println!("SPM rotator servo diagnostic (read-only)");
    println!("Serial port: {}", port);
    println!();

    println!("Step 1: Opening serial port...");
    let mut bus = match Lx16aBus::open(&port) {
        Ok(bus) => {
            println!("  ✓ Serial port opened");
            bus
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - On a Raspberry Pi, enable the UART and disable the serial console");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Pinging servos...");
    let mut all_found = true;
    for arm in Arm::ALL {
        print!("  Arm {} (ID {}): ", arm, arm.servo_id());
        io::stdout().flush()?;

        match bus.ping(arm.servo_id()) {
            Ok(true) => println!("✓ RESPONDING"),
            Ok(false) => {
                println!("✗ NO RESPONSE");
                all_found = false;
            }
            Err(e) => {
                println!("✗ ERROR: {}", e);
                all_found = false;
            }
        }
    }
    println!();
    if !all_found {
        println!("⚠ Not all servos responded: check power, wiring and that IDs are 1-4");
        println!();
    }

    println!("Step 3: Reading servo state...");
    let mut angles = [None; 4];
    for arm in Arm::ALL {
        let id = arm.servo_id();
        println!("  === Arm {} (ID {}) ===", arm, id);

        match bus.read_position(id) {
            Ok(angle) => {
                println!("    Position:    {:.2}°", angle);
                angles[arm.index()] = Some(angle);
            }
            Err(e) => println!("    Position:    ERROR - {}", e),
        }
        match bus.read_angle_offset(id) {
            Ok(offset) => println!("    Offset:      {:+.2}°", offset),
            Err(e) => println!("    Offset:      ERROR - {}", e),
        }
        match bus.read_angle_limits(id) {
            Ok((min, max)) => println!("    Limits:      {:.1}° - {:.1}°", min, max),
            Err(e) => println!("    Limits:      ERROR - {}", e),
        }
        match bus.torque_enabled(id) {
            Ok(on) => println!("    Torque:      {}", if on { "ENABLED" } else { "disabled" }),
            Err(e) => println!("    Torque:      ERROR - {}", e),
        }
        match bus.read_vin(id) {
            Ok(mv) => println!("    Supply:      {:.2} V", mv as f64 / 1000.0),
            Err(e) => println!("    Supply:      ERROR - {}", e),
        }
        match bus.read_temperature(id) {
            Ok(t) => println!("    Temperature: {} °C", t),
            Err(e) => println!("    Temperature: ERROR - {}", e),
        }
        println!();
    }

    if let [Some(n), Some(e), Some(s), Some(w)] = angles {
        println!("Step 4: Estimating plate orientation...");
        match Geometry::default().forward(&ArmAngles::new(n, e, s, w)) {
            Ok(pose) => println!(
                "  {} (fit error {:.2}°)",
                pose.orientation, pose.rms_error_deg
            ),
            Err(e) => println!("  ✗ {}", e),
        }
        println!();
    }

    println!("Diagnostic complete.");
    println!("A level plate reads about 120° on every servo; run 'calibrate' if not.");
    Ok(())
}
