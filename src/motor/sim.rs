// Simulated LX-16A bus
//
// Answers packets the way four servos on a real bus would, so the full driver
// stack runs without hardware. Staged moves land instantly on MoveStart.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::lx16a::{
    BROADCAST_ID, BusPort, Command, UNITS_PER_DEG, angle_to_position, decode_frame, encode_frame,
};
use crate::messages::Arm;

/// Neutral servo position (120°) in position units
const NEUTRAL_UNITS: i32 = 500;

#[derive(Debug, Clone, Copy)]
struct SimServo {
    // Physical position, position units
    position: i32,
    staged: Option<(u16, u16)>,
    offset: i8,
    saved_offset: i8,
    torque: bool,
}

impl Default for SimServo {
    fn default() -> Self {
        Self {
            position: NEUTRAL_UNITS,
            staged: None,
            offset: 0,
            saved_offset: 0,
            torque: false,
        }
    }
}

impl SimServo {
    fn reading(&self) -> i16 {
        (self.position - self.offset as i32) as i16
    }

    fn start_staged(&mut self) {
        if let Some((position, _)) = self.staged.take() {
            self.position = position as i32 + self.offset as i32;
        }
    }
}

/// Four servos behind a fake serial port
pub struct SimulatedBus {
    servos: [SimServo; 4],
    rx: VecDeque<u8>,
    silent: Vec<u8>,
    garble: usize,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// All servos at neutral, torque off, no offsets
    pub fn new() -> Self {
        Self {
            servos: [SimServo::default(); 4],
            rx: VecDeque::new(),
            silent: Vec::new(),
            garble: 0,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The servo of `arm` never answers
    pub fn with_silent(mut self, arm: Arm) -> Self {
        self.silent.push(arm.servo_id());
        self
    }

    /// Corrupt the checksum of the next `count` replies
    pub fn with_garbled_replies(mut self, count: usize) -> Self {
        self.garble = count;
        self
    }

    /// Start with the servos at these physical angles
    pub fn with_positions(mut self, degrees: [f64; 4]) -> Self {
        for (servo, angle) in self.servos.iter_mut().zip(degrees) {
            servo.position = (angle * UNITS_PER_DEG).round() as i32;
        }
        self
    }

    /// Move the servo of `arm` as a hand would with torque off
    pub fn push_by_hand(&mut self, arm: Arm, degrees: f64) {
        let servo = &mut self.servos[arm.index()];
        if !servo.torque {
            servo.position = (degrees * UNITS_PER_DEG).round() as i32;
        }
    }

    /// Physical angle of the servo of `arm`, degrees
    pub fn position(&self, arm: Arm) -> f64 {
        self.servos[arm.index()].position as f64 / UNITS_PER_DEG
    }

    pub fn torque(&self, arm: Arm) -> bool {
        self.servos[arm.index()].torque
    }

    /// Offset saved to EEPROM, degrees
    pub fn saved_offset(&self, arm: Arm) -> f64 {
        self.servos[arm.index()].saved_offset as f64 / UNITS_PER_DEG
    }

    /// Every packet written to the bus, shared so it outlives the driver
    pub fn request_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.log)
    }

    fn reply(&mut self, id: u8, command: Command, params: &[u8]) {
        let mut packet = encode_frame(id, command, params);
        if self.garble > 0 {
            self.garble -= 1;
            let last = packet.len() - 1;
            packet[last] ^= 0xFF;
        }
        self.rx.extend(packet);
    }

    fn handle(&mut self, id: u8, command: Command, params: &[u8]) {
        if id == BROADCAST_ID {
            match command {
                Command::MoveStart => self.servos.iter_mut().for_each(SimServo::start_staged),
                Command::LoadOrUnloadWrite => {
                    let enabled = params.first() == Some(&1);
                    self.servos.iter_mut().for_each(|s| s.torque = enabled);
                }
                _ => {}
            }
            return;
        }

        let Some(arm) = Arm::from_servo_id(id) else {
            return;
        };
        if self.silent.contains(&id) {
            return;
        }
        let servo = &mut self.servos[arm.index()];

        match command {
            Command::MoveTimeWaitWrite if params.len() == 4 => {
                servo.staged = Some((
                    u16::from_le_bytes([params[0], params[1]]),
                    u16::from_le_bytes([params[2], params[3]]),
                ));
            }
            Command::MoveTimeWaitRead => {
                let (position, time) = servo.staged.unwrap_or((0, 0));
                let [p_lo, p_hi] = position.to_le_bytes();
                let [t_lo, t_hi] = time.to_le_bytes();
                self.reply(id, command, &[p_lo, p_hi, t_lo, t_hi]);
            }
            Command::MoveStart => servo.start_staged(),
            Command::IdRead => self.reply(id, command, &[id]),
            Command::AngleOffsetAdjust if params.len() == 1 => servo.offset = params[0] as i8,
            Command::AngleOffsetWrite => servo.saved_offset = servo.offset,
            Command::AngleOffsetRead => {
                let offset = servo.offset as u8;
                self.reply(id, command, &[offset]);
            }
            Command::AngleLimitRead => {
                let [max_lo, max_hi] = angle_to_position(240.0).to_le_bytes();
                self.reply(id, command, &[0, 0, max_lo, max_hi]);
            }
            Command::TempRead => self.reply(id, command, &[35]),
            Command::VinRead => self.reply(id, command, &7400u16.to_le_bytes()),
            Command::PosRead => {
                let reading = servo.reading().to_le_bytes();
                self.reply(id, command, &reading);
            }
            Command::LoadOrUnloadWrite if params.len() == 1 => servo.torque = params[0] == 1,
            Command::LoadOrUnloadRead => {
                let torque = servo.torque as u8;
                self.reply(id, command, &[torque]);
            }
            _ => {}
        }
    }
}

impl Read for SimulatedBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedBus {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut log) = self.log.lock() {
            log.push(buf.to_vec());
        }
        match decode_frame(buf) {
            Ok(frame) => match Command::from_code(frame.command) {
                Some(command) => {
                    trace!("sim servo {} <- {:?} {:02X?}", frame.id, command, frame.params);
                    self.handle(frame.id, command, &frame.params);
                }
                None => trace!("sim ignoring command {}", frame.command),
            },
            Err(e) => trace!("sim ignoring bad packet: {}", e),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BusPort for SimulatedBus {
    fn discard_input(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }
}
