// Loop timing, motion limits, ports and topics
use std::time::Duration;

// Motion loop frequency (one tick = one synchronized move of all four arms)
pub const LOOP_HZ: u64 = 20;

// Maximum angular rate of the commanded orientation, degrees per second
pub const MAX_VELOCITY_DEG_S: f64 = 100.0;

// Below this remaining distance (degrees) the controller snaps onto the target
pub const CONVERGENCE_EPSILON_DEG: f64 = 0.01;

// Largest servo change per tick is this times the square root of the plate step
// (degrees). Near full extension an arm moves with the square root of the plate motion.
pub const SERVO_STEP_GAIN: f64 = 15.0;

// Duration of the slow homing move issued during bring-up
pub const HOMING_DURATION: Duration = Duration::from_millis(1500);

// Servo bus
pub const SERIAL_PORT: &str = "/dev/serial0";
pub const BAUD_RATE: u32 = 115_200;

// rotctl listener
pub const LISTEN_HOST: &str = "0.0.0.0";
pub const LISTEN_PORT: u16 = 4533;

// Zenoh topics
pub const TOPIC_STATUS: &str = "spm/state/status"; // controller status snapshots

/// Runtime settings, defaults above, overridable from the command line
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    pub host: String,
    pub port: u16,
    pub loop_hz: u64,
    pub max_velocity_deg_s: f64,
    /// Drive the simulated bus instead of real servos
    pub simulate: bool,
    /// Publish status snapshots over Zenoh
    pub telemetry: bool,
}

impl RuntimeConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(1000 / self.loop_hz.max(1))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            serial_port: SERIAL_PORT.to_string(),
            baud_rate: BAUD_RATE,
            host: LISTEN_HOST.to_string(),
            port: LISTEN_PORT,
            loop_hz: LOOP_HZ,
            max_velocity_deg_s: MAX_VELOCITY_DEG_S,
            simulate: false,
            telemetry: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tick_is_50ms() {
        let config = RuntimeConfig::default();
        assert_eq!(config.tick_period(), Duration::from_millis(50));
        assert_eq!(config.listen_addr(), "0.0.0.0:4533");
    }
}
