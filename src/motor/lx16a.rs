// LewanSoul / Hiwonder LX-16A bus servo protocol
//
// Packet format: [0x55, 0x55, ID, Length, Command, Params..., Checksum]
// Length = params + 3 (length byte, command, checksum).
// Writes are never acknowledged; reads answer with a packet of the same shape.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

/// Default serial configuration for LX-16A servos
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Retries after the first attempt when a reply is lost or garbled
pub const MAX_RETRIES: usize = 2;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Packet header bytes
pub const HEADER: [u8; 2] = [0x55, 0x55];

/// Every servo obeys packets sent to this id
pub const BROADCAST_ID: u8 = 0xFE;

/// Position units per degree: 1000 units span 240°
pub const UNITS_PER_DEG: f64 = 25.0 / 6.0;

/// Servo travel, degrees
pub const MAX_ANGLE_DEG: f64 = 240.0;

/// Longest timed move the servo accepts
pub const MAX_MOVE_TIME_MS: u64 = 30_000;

/// Persistent angle offset range, degrees
pub const MAX_OFFSET_DEG: f64 = 30.0;

// Bytes skipped while hunting for a header before giving up
const MAX_HEADER_SCAN: usize = 32;

/// Command set (the subset this crate uses)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MoveTimeWrite = 1,
    MoveTimeWaitWrite = 7,
    MoveTimeWaitRead = 8,
    MoveStart = 11,
    MoveStop = 12,
    IdRead = 14,
    AngleOffsetAdjust = 17,
    AngleOffsetWrite = 18,
    AngleOffsetRead = 19,
    AngleLimitRead = 21,
    TempRead = 26,
    VinRead = 27,
    PosRead = 28,
    LoadOrUnloadWrite = 31,
    LoadOrUnloadRead = 32,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Command> {
        use Command::*;
        [
            MoveTimeWrite,
            MoveTimeWaitWrite,
            MoveTimeWaitRead,
            MoveStart,
            MoveStop,
            IdRead,
            AngleOffsetAdjust,
            AngleOffsetWrite,
            AngleOffsetRead,
            AngleLimitRead,
            TempRead,
            VinRead,
            PosRead,
            LoadOrUnloadWrite,
            LoadOrUnloadRead,
        ]
        .into_iter()
        .find(|c| *c as u8 == code)
    }

    /// Parameter bytes in the servo's reply to a read command
    pub fn response_len(self) -> usize {
        match self {
            Command::MoveTimeWaitRead | Command::AngleLimitRead => 4,
            Command::VinRead | Command::PosRead => 2,
            Command::IdRead
            | Command::AngleOffsetRead
            | Command::TempRead
            | Command::LoadOrUnloadRead => 1,
            _ => 0,
        }
    }
}

/// Error types for servo bus communication
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },

    #[error("Servo {id}: angle {angle:.2}° outside 0-240°")]
    AngleOutOfRange { id: u8, angle: f64 },

    #[error("Servo {id}: offset {offset:.2}° outside ±30°")]
    OffsetOutOfRange { id: u8, offset: f64 },

    #[error("Servo {id}: wrote {expected}, read back {actual}")]
    VerifyFailed { id: u8, expected: String, actual: String },
}

impl DriverError {
    /// Lost or garbled replies are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::InvalidResponse { .. }
                | DriverError::ChecksumMismatch { .. }
                | DriverError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Byte transport under the bus: a serial port, or a simulator in tests
pub trait BusPort: Read + Write + Send {
    /// Drop unread input, used after a garbled reply
    fn discard_input(&mut self) -> io::Result<()>;
}

impl BusPort for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Checksum over id, length, command and params: inverted byte sum
pub fn checksum(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().map(|&b| b as u32).sum();
    !(sum as u8)
}

/// Build a packet with header and checksum
pub fn encode_frame(id: u8, command: Command, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 3) as u8;
    let mut packet = Vec::with_capacity(6 + params.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(command as u8);
    packet.extend_from_slice(params);

    let sum = checksum(&packet[2..]);
    packet.push(sum);
    packet
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub command: u8,
    pub params: Vec<u8>,
}

/// Decode one complete packet
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let id = bytes.get(2).copied().unwrap_or(0);
    if bytes.len() < 6 || bytes[..2] != HEADER {
        return Err(DriverError::InvalidResponse {
            id,
            reason: format!("Malformed packet: {:02X?}", bytes),
        });
    }
    let length = bytes[3] as usize;
    if length < 3 || bytes.len() != length + 3 {
        return Err(DriverError::InvalidResponse {
            id,
            reason: format!("Length byte {} does not match {} bytes", length, bytes.len()),
        });
    }
    let last = bytes.len() - 1;
    if checksum(&bytes[2..last]) != bytes[last] {
        return Err(DriverError::ChecksumMismatch { id });
    }
    Ok(Frame {
        id,
        command: bytes[4],
        params: bytes[5..last].to_vec(),
    })
}

/// Degrees to servo position units
pub fn angle_to_position(angle: f64) -> u16 {
    (angle * UNITS_PER_DEG).round().clamp(0.0, u16::MAX as f64) as u16
}

/// Servo position units (may be negative past the end stop) to degrees
pub fn position_to_angle(position: i16) -> f64 {
    position as f64 / UNITS_PER_DEG
}

/// Servo bus - handles serial communication with the LX-16A servos
pub struct Lx16aBus<P = Box<dyn SerialPort>> {
    port: P,
    max_retries: usize,
    backoff: Duration,
}

impl Lx16aBus {
    /// Open a new connection to the servo bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self::new(port))
    }
}

impl<P: BusPort> Lx16aBus<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            max_retries: MAX_RETRIES,
            backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_retries(mut self, max_retries: usize, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    fn send_packet(&mut self, id: u8, packet: &[u8]) -> Result<()> {
        let result = self.port.write_all(packet).and_then(|_| self.port.flush());
        result.map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => DriverError::Timeout { id },
            _ => DriverError::Io(e),
        })
    }

    fn read_exact_or_timeout(&mut self, id: u8, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => DriverError::Timeout { id },
            _ => DriverError::Io(e),
        })
    }

    /// Run `attempt` until it succeeds, fails for good, or retries run out
    fn with_retry<T>(
        &mut self,
        id: u8,
        command: Command,
        mut attempt: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut tries = 0;
        loop {
            match attempt(self) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && tries < self.max_retries => {
                    tries += 1;
                    warn!(
                        "Servo {} {:?}: {} (retry {}/{})",
                        id, command, e, tries, self.max_retries
                    );
                    self.port.discard_input()?;
                    sleep(self.backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a command that has no reply
    pub fn write(&mut self, id: u8, command: Command, params: &[u8]) -> Result<()> {
        let packet = encode_frame(id, command, params);
        debug!("Write to servo {}: {:?} {:02X?}", id, command, params);
        self.with_retry(id, command, |bus| bus.send_packet(id, &packet))
    }

    /// Send a read command and return the parameter bytes of the reply
    pub fn query(&mut self, id: u8, command: Command) -> Result<Vec<u8>> {
        let packet = encode_frame(id, command, &[]);
        self.with_retry(id, command, |bus| {
            bus.send_packet(id, &packet)?;
            bus.read_response(id, command, &packet)
        })
    }

    /// Read a response packet, skipping the loopback copy of our own request
    fn read_response(&mut self, id: u8, command: Command, request: &[u8]) -> Result<Vec<u8>> {
        for _ in 0..2 {
            let packet = self.read_packet(id)?;
            if packet == request {
                continue;
            }
            let frame = decode_frame(&packet)?;
            if frame.id != id || frame.command != command as u8 {
                return Err(DriverError::InvalidResponse {
                    id,
                    reason: format!(
                        "Expected servo {} command {}, got servo {} command {}",
                        id, command as u8, frame.id, frame.command
                    ),
                });
            }
            if frame.params.len() != command.response_len() {
                return Err(DriverError::InvalidResponse {
                    id,
                    reason: format!(
                        "Expected {} bytes, got {}",
                        command.response_len(),
                        frame.params.len()
                    ),
                });
            }
            return Ok(frame.params);
        }
        Err(DriverError::InvalidResponse {
            id,
            reason: "Only echoed request received".to_string(),
        })
    }

    // Raw bytes of the next packet on the wire
    fn read_packet(&mut self, id: u8) -> Result<Vec<u8>> {
        let mut byte = [0u8; 1];
        let mut previous = 0u8;
        let mut found = false;
        for _ in 0..MAX_HEADER_SCAN {
            self.read_exact_or_timeout(id, &mut byte)?;
            if previous == HEADER[0] && byte[0] == HEADER[1] {
                found = true;
                break;
            }
            previous = byte[0];
        }
        if !found {
            return Err(DriverError::InvalidResponse {
                id,
                reason: "No packet header".to_string(),
            });
        }

        let mut id_length = [0u8; 2];
        self.read_exact_or_timeout(id, &mut id_length)?;
        let length = id_length[1] as usize;
        if length < 3 {
            return Err(DriverError::InvalidResponse {
                id,
                reason: format!("Length byte {} too short", length),
            });
        }

        // command + params + checksum
        let mut remaining = vec![0u8; length - 1];
        self.read_exact_or_timeout(id, &mut remaining)?;

        let mut packet = Vec::with_capacity(length + 3);
        packet.extend_from_slice(&HEADER);
        packet.extend_from_slice(&id_length);
        packet.extend_from_slice(&remaining);
        Ok(packet)
    }

    // === High-level convenience methods ===

    /// Check a servo answers on the bus
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.query(id, Command::IdRead) {
            Ok(params) => Ok(params[0] == id),
            Err(DriverError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn move_params(id: u8, angle: f64, duration: Duration) -> Result<[u8; 4]> {
        if !(0.0..=MAX_ANGLE_DEG).contains(&angle) {
            return Err(DriverError::AngleOutOfRange { id, angle });
        }
        let position = angle_to_position(angle);
        let time = (duration.as_millis() as u64).min(MAX_MOVE_TIME_MS) as u16;
        let [p_lo, p_hi] = position.to_le_bytes();
        let [t_lo, t_hi] = time.to_le_bytes();
        Ok([p_lo, p_hi, t_lo, t_hi])
    }

    /// Stage a timed move; it starts on the next `move_start`.
    /// The staged value is read back so a silent or confused servo is caught here.
    pub fn stage_move(&mut self, id: u8, angle: f64, duration: Duration) -> Result<()> {
        let params = Self::move_params(id, angle, duration)?;
        self.write(id, Command::MoveTimeWaitWrite, &params)?;
        let staged = self.query(id, Command::MoveTimeWaitRead)?;
        if staged[..] != params[..] {
            return Err(DriverError::VerifyFailed {
                id,
                expected: format!("{:02X?}", params),
                actual: format!("{:02X?}", staged),
            });
        }
        Ok(())
    }

    /// Release staged moves (use `BROADCAST_ID` for all servos at once)
    pub fn move_start(&mut self, id: u8) -> Result<()> {
        self.write(id, Command::MoveStart, &[])
    }

    /// Read present position in degrees
    pub fn read_position(&mut self, id: u8) -> Result<f64> {
        let params = self.query(id, Command::PosRead)?;
        Ok(position_to_angle(i16::from_le_bytes([params[0], params[1]])))
    }

    /// Enable (load) or disable (unload) the motor
    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write(id, Command::LoadOrUnloadWrite, &[enabled as u8])
    }

    pub fn torque_enabled(&mut self, id: u8) -> Result<bool> {
        let params = self.query(id, Command::LoadOrUnloadRead)?;
        Ok(params[0] == 1)
    }

    /// Set the angle offset in RAM; lost on power cycle unless persisted
    pub fn adjust_angle_offset(&mut self, id: u8, offset: f64) -> Result<()> {
        if !(-MAX_OFFSET_DEG..=MAX_OFFSET_DEG).contains(&offset) {
            return Err(DriverError::OffsetOutOfRange { id, offset });
        }
        let units = (offset * UNITS_PER_DEG).round() as i8;
        self.write(id, Command::AngleOffsetAdjust, &[units as u8])
    }

    /// Save the current angle offset to the servo's EEPROM
    pub fn persist_angle_offset(&mut self, id: u8) -> Result<()> {
        self.write(id, Command::AngleOffsetWrite, &[])
    }

    pub fn read_angle_offset(&mut self, id: u8) -> Result<f64> {
        let params = self.query(id, Command::AngleOffsetRead)?;
        Ok(position_to_angle(params[0] as i8 as i16))
    }

    /// Configured (min, max) travel limits, degrees
    pub fn read_angle_limits(&mut self, id: u8) -> Result<(f64, f64)> {
        let params = self.query(id, Command::AngleLimitRead)?;
        let min = u16::from_le_bytes([params[0], params[1]]);
        let max = u16::from_le_bytes([params[2], params[3]]);
        Ok((
            position_to_angle(min as i16),
            position_to_angle(max as i16),
        ))
    }

    /// Supply voltage in millivolts
    pub fn read_vin(&mut self, id: u8) -> Result<u16> {
        let params = self.query(id, Command::VinRead)?;
        Ok(u16::from_le_bytes([params[0], params[1]]))
    }

    /// Temperature in °C
    pub fn read_temperature(&mut self, id: u8) -> Result<u8> {
        let params = self.query(id, Command::TempRead)?;
        Ok(params[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Serial port stand-in: each written packet pops one scripted reply
    #[derive(Default)]
    struct FakePort {
        replies: VecDeque<Vec<u8>>,
        rx: VecDeque<u8>,
        tx: Vec<Vec<u8>>,
        echo: bool,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.push(buf.to_vec());
            if self.echo {
                self.rx.extend(buf.iter().copied());
            }
            if let Some(reply) = self.replies.pop_front() {
                self.rx.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl BusPort for FakePort {
        fn discard_input(&mut self) -> io::Result<()> {
            self.rx.clear();
            Ok(())
        }
    }

    fn bus(replies: Vec<Vec<u8>>) -> Lx16aBus<FakePort> {
        let port = FakePort {
            replies: replies.into(),
            ..Default::default()
        };
        Lx16aBus::new(port).with_retries(MAX_RETRIES, Duration::ZERO)
    }

    #[test]
    fn test_checksum() {
        // Servo 1, move to 500 in 1000 ms: 55 55 01 07 01 F4 01 E8 03 16
        let body = [0x01, 0x07, 0x01, 0xF4, 0x01, 0xE8, 0x03];
        assert_eq!(checksum(&body), 0x16);
    }

    #[test]
    fn test_encode_move_frame() {
        let packet = encode_frame(1, Command::MoveTimeWrite, &[0xF4, 0x01, 0xE8, 0x03]);
        assert_eq!(
            packet,
            vec![0x55, 0x55, 0x01, 0x07, 0x01, 0xF4, 0x01, 0xE8, 0x03, 0x16]
        );
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut packet = encode_frame(2, Command::PosRead, &[0xF4, 0x01]);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(matches!(
            decode_frame(&packet),
            Err(DriverError::ChecksumMismatch { id: 2 })
        ));
        assert!(matches!(
            decode_frame(&[0x55, 0x55, 0x01]),
            Err(DriverError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_angle_conversion() {
        assert_eq!(angle_to_position(120.0), 500);
        assert_eq!(angle_to_position(240.0), 1000);
        assert!((position_to_angle(500) - 120.0).abs() < 1e-12);
        assert!((position_to_angle(-25) + 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_read_position() {
        let reply = encode_frame(1, Command::PosRead, &[0xF4, 0x01]);
        let mut bus = bus(vec![reply]);
        let angle = bus.read_position(1).unwrap();
        assert!((angle - 120.0).abs() < 1e-9);
        assert_eq!(bus.port().tx, vec![encode_frame(1, Command::PosRead, &[])]);
    }

    #[test]
    fn test_garbled_reply_is_retried() {
        let mut garbled = encode_frame(3, Command::PosRead, &[0xF4, 0x01]);
        garbled[6] ^= 0x01;
        let good = encode_frame(3, Command::PosRead, &[0x2C, 0x01]);
        let mut bus = bus(vec![garbled, good]);
        let angle = bus.read_position(3).unwrap();
        assert!((angle - 72.0).abs() < 1e-9);
        assert_eq!(bus.port().tx.len(), 2);
    }

    #[test]
    fn test_silent_servo_times_out_after_retries() {
        let mut bus = bus(vec![]);
        let result = bus.read_position(4);
        assert!(matches!(result, Err(DriverError::Timeout { id: 4 })));
        assert_eq!(bus.port().tx.len(), 1 + MAX_RETRIES);
    }

    #[test]
    fn test_wrong_servo_reply_is_invalid() {
        let reply = encode_frame(2, Command::PosRead, &[0xF4, 0x01]);
        let mut bus = bus(vec![reply.clone(), reply.clone(), reply]);
        assert!(matches!(
            bus.read_position(1),
            Err(DriverError::InvalidResponse { id: 1, .. })
        ));
    }

    #[test]
    fn test_echo_is_skipped() {
        let reply = encode_frame(1, Command::IdRead, &[1]);
        let mut bus = bus(vec![reply]);
        bus.port_mut().echo = true;
        assert!(bus.ping(1).unwrap());
    }

    #[test]
    fn test_move_out_of_range_writes_nothing() {
        let mut bus = bus(vec![]);
        let result = bus.stage_move(1, 250.0, Duration::from_millis(50));
        assert!(matches!(result, Err(DriverError::AngleOutOfRange { id: 1, .. })));
        assert!(bus.port().tx.is_empty());
    }

    #[test]
    fn test_stage_move_verifies_read_back() {
        // Staged 120° / 50 ms reads back as the same four bytes
        let staged = encode_frame(2, Command::MoveTimeWaitRead, &[0xF4, 0x01, 0x32, 0x00]);
        let mut bus = bus(vec![vec![], staged]);
        bus.stage_move(2, 120.0, Duration::from_millis(50)).unwrap();
        assert_eq!(
            bus.port().tx[0],
            encode_frame(2, Command::MoveTimeWaitWrite, &[0xF4, 0x01, 0x32, 0x00])
        );

        let wrong = encode_frame(2, Command::MoveTimeWaitRead, &[0x00, 0x00, 0x32, 0x00]);
        let mut bus = self::bus(vec![vec![], wrong]);
        assert!(matches!(
            bus.stage_move(2, 120.0, Duration::from_millis(50)),
            Err(DriverError::VerifyFailed { id: 2, .. })
        ));
    }

    #[test]
    fn test_offset_encoding() {
        let mut bus = bus(vec![]);
        bus.adjust_angle_offset(1, -10.0).unwrap();
        // -10° = -42 units = 0xD6
        assert_eq!(bus.port().tx[0], encode_frame(1, Command::AngleOffsetAdjust, &[0xD6]));
        assert!(matches!(
            bus.adjust_angle_offset(1, 31.0),
            Err(DriverError::OffsetOutOfRange { .. })
        ));
    }
}
