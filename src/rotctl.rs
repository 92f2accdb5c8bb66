// rotctl command server
//
// Line-oriented ASCII protocol compatible with the subset of hamlib's rotctld that
// rotator clients use. Every connection may set the target; the last write wins.

use std::io;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::messages::Orientation;
use crate::motor::WorkspaceError;
use crate::runtime::PlatformHandle;

/// Longest accepted line, newline excluded
pub const MAX_LINE: usize = 256;

// hamlib return codes
const RIG_OK: i32 = 0;
const RIG_EINVAL: i32 = -1;
const RIG_ENIMPL: i32 = -4;
const RIG_ERJCTED: i32 = -9;
const RIG_EDOM: i32 = -17;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetPosition { azimuth: f64, elevation: f64 },
    GetPosition,
    Stop,
    Reset,
    GetInfo,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("{command} takes {expected} argument(s), got {got}")]
    ArgumentCount {
        command: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("azimuth {azimuth} / elevation {elevation} outside 0-360 / 0-90")]
    OutOfDomain { azimuth: f64, elevation: f64 },

    #[error("line longer than {MAX_LINE} bytes")]
    LineTooLong,

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("rejected: {0}")]
    Rejected(#[from] WorkspaceError),
}

impl ProtocolError {
    /// hamlib error code reported as `RPRT <code>`
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::UnknownCommand(_) => RIG_ENIMPL,
            ProtocolError::OutOfDomain { .. } => RIG_EDOM,
            ProtocolError::Rejected(_) => RIG_ERJCTED,
            ProtocolError::Empty
            | ProtocolError::ArgumentCount { .. }
            | ProtocolError::InvalidNumber(_)
            | ProtocolError::LineTooLong
            | ProtocolError::InvalidUtf8 => RIG_EINVAL,
        }
    }
}

fn parse_number(arg: &str) -> Result<f64, ProtocolError> {
    match arg.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ProtocolError::InvalidNumber(arg.to_string())),
    }
}

fn expect_args(
    command: &'static str,
    expected: &'static str,
    args: &[&str],
    allowed: std::ops::RangeInclusive<usize>,
) -> Result<(), ProtocolError> {
    if allowed.contains(&args.len()) {
        Ok(())
    } else {
        Err(ProtocolError::ArgumentCount {
            command,
            expected,
            got: args.len(),
        })
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(ProtocolError::Empty)?;
        let args: Vec<&str> = words.collect();

        match name {
            "P" | "\\set_pos" => {
                expect_args("P", "2", &args, 2..=2)?;
                let azimuth = parse_number(args[0])?;
                let elevation = parse_number(args[1])?;
                if !(0.0..360.0).contains(&azimuth) || !(0.0..=90.0).contains(&elevation) {
                    return Err(ProtocolError::OutOfDomain { azimuth, elevation });
                }
                Ok(Command::SetPosition { azimuth, elevation })
            }
            "p" | "\\get_pos" => {
                expect_args("p", "0", &args, 0..=0)?;
                Ok(Command::GetPosition)
            }
            "S" | "\\stop" => {
                expect_args("S", "0", &args, 0..=0)?;
                Ok(Command::Stop)
            }
            "R" | "\\reset" => {
                // Clients send a reset type; every type levels the plate
                expect_args("R", "0 or 1", &args, 0..=1)?;
                if let Some(kind) = args.first() {
                    kind.parse::<u32>()
                        .map_err(|_| ProtocolError::InvalidNumber(kind.to_string()))?;
                }
                Ok(Command::Reset)
            }
            "_" | "\\get_info" => {
                expect_args("_", "0", &args, 0..=0)?;
                Ok(Command::GetInfo)
            }
            "q" | "Q" | "\\quit" => Ok(Command::Quit),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// What to do after one line
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Send(String),
    Ignore,
    Close,
}

fn report(code: i32) -> String {
    format!("RPRT {}\n", code)
}

/// Run one command line against the platform
pub fn respond(handle: &PlatformHandle, line: &[u8]) -> Reply {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(_) => return Reply::Send(report(ProtocolError::InvalidUtf8.code())),
    };
    if text.is_empty() {
        return Reply::Ignore;
    }

    let command = match text.parse::<Command>() {
        Ok(command) => command,
        Err(e) => {
            debug!("Rejected {:?}: {}", text, e);
            return Reply::Send(report(e.code()));
        }
    };

    match command {
        Command::SetPosition { azimuth, elevation } => {
            match handle.request(Orientation::new(azimuth, elevation)) {
                Ok(()) => {
                    info!("Target set to az={} el={}", azimuth, elevation);
                    Reply::Send(report(RIG_OK))
                }
                Err(e) => {
                    let e = ProtocolError::from(e);
                    warn!("Rejected {:?}: {}", text, e);
                    Reply::Send(report(e.code()))
                }
            }
        }
        Command::GetPosition => {
            let current = handle.snapshot().current;
            Reply::Send(format!("{:.6}\n{:.6}\n", current.azimuth, current.elevation))
        }
        Command::Stop => {
            handle.stop();
            info!("Stop: holding {}", handle.target());
            Reply::Send(report(RIG_OK))
        }
        Command::Reset => {
            handle.reset();
            info!("Reset to {}", Orientation::NEUTRAL);
            Reply::Send(report(RIG_OK))
        }
        Command::GetInfo => Reply::Send(format!(
            "{} {} SPM rotator\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )),
        Command::Quit => Reply::Close,
    }
}

/// Read one line into `line` without the newline, keeping at most `MAX_LINE` bytes.
/// Returns `None` at end of stream, otherwise whether the line was too long.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
) -> io::Result<Option<bool>> {
    line.clear();
    let mut too_long = false;
    let mut seen_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(seen_any.then_some(too_long));
        }
        seen_any = true;

        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..end], true),
            None => (available, false),
        };
        let used = chunk.len() + done as usize;
        if !too_long {
            if line.len() + chunk.len() > MAX_LINE {
                too_long = true;
                line.clear();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if done {
            return Ok(Some(too_long));
        }
    }
}

/// Serve one client until it quits or disconnects
pub async fn handle_connection<S>(stream: S, handle: PlatformHandle) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(MAX_LINE);

    while let Some(too_long) = read_line_bounded(&mut reader, &mut line).await? {
        let reply = if too_long {
            Reply::Send(report(ProtocolError::LineTooLong.code()))
        } else {
            respond(&handle, &line)
        };

        match reply {
            Reply::Send(text) => writer.write_all(text.as_bytes()).await?,
            Reply::Ignore => {}
            Reply::Close => break,
        }
    }
    writer.shutdown().await
}

/// Accept clients forever, one task per connection
pub async fn serve(listener: TcpListener, handle: PlatformHandle) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("rotctl connected: {}", peer);
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handle).await {
                warn!("rotctl connection {} failed: {}", peer, e);
            }
            info!("rotctl disconnected: {}", peer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{MotionController, MotionLimits};
    use crate::messages::ControllerStatus;
    use crate::motor::{Geometry, Lx16aBus, ServoDriver, SimulatedBus};
    use crate::runtime::{MotionTask, spawn_motion};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpStream;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    fn platform() -> (PlatformHandle, MotionTask) {
        let driver = ServoDriver::from_bus(Lx16aBus::new(SimulatedBus::new()));
        let limits = MotionLimits {
            max_velocity_deg_s: 2000.0,
            tick: Duration::from_millis(5),
            epsilon_deg: 0.01,
        };
        let controller = MotionController::new(driver, Geometry::default(), limits);
        spawn_motion(controller, Geometry::default(), limits.tick)
    }

    async fn server(handle: PlatformHandle) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, handle));
        addr
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: std::net::SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_line(&mut self) -> String {
            let mut reply = String::new();
            self.reader.read_line(&mut reply).await.unwrap();
            reply
        }

        async fn command(&mut self, line: &str) -> String {
            self.send(line).await;
            self.read_line().await
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "P 180 50".parse::<Command>(),
            Ok(Command::SetPosition {
                azimuth: 180.0,
                elevation: 50.0
            })
        );
        assert_eq!(
            "\\set_pos 12.5 88".parse::<Command>(),
            Ok(Command::SetPosition {
                azimuth: 12.5,
                elevation: 88.0
            })
        );
        assert_eq!("p".parse::<Command>(), Ok(Command::GetPosition));
        assert_eq!("\\get_pos".parse::<Command>(), Ok(Command::GetPosition));
        assert_eq!("S".parse::<Command>(), Ok(Command::Stop));
        assert_eq!("R".parse::<Command>(), Ok(Command::Reset));
        assert_eq!("R 1".parse::<Command>(), Ok(Command::Reset));
        assert_eq!("_".parse::<Command>(), Ok(Command::GetInfo));
        assert_eq!("q".parse::<Command>(), Ok(Command::Quit));
        assert_eq!("Q".parse::<Command>(), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_errors_map_to_codes() {
        let code = |line: &str| line.parse::<Command>().unwrap_err().code();
        assert_eq!(code("P 180"), -1);
        assert_eq!(code("P 1 2 3"), -1);
        assert_eq!(code("P abc 50"), -1);
        assert_eq!(code("P nan 50"), -1);
        assert_eq!(code("P 999 999"), -17);
        assert_eq!(code("P 360 50"), -17);
        assert_eq!(code("P -1 50"), -17);
        assert_eq!(code("P 10 90.5"), -17);
        assert_eq!(code("p 1"), -1);
        assert_eq!(code("R x"), -1);
        assert_eq!(code("X"), -4);
        assert_eq!(code("\\set_conf"), -4);
    }

    #[tokio::test]
    async fn test_set_position_updates_target() {
        let (handle, motion) = platform();
        let mut client = Client::connect(server(handle.clone()).await).await;

        assert_eq!(client.command("P 180 50\n").await, "RPRT 0\n");
        assert_eq!(handle.target(), Orientation::new(180.0, 50.0));

        let settled = handle.wait_settled().await;
        assert_eq!(settled.status, ControllerStatus::Idle);
        assert_eq!(client.command("p\n").await, "180.000000\n");
        assert_eq!(client.read_line().await, "50.000000\n");
        motion.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_position_leaves_target() {
        let (handle, motion) = platform();
        let mut client = Client::connect(server(handle.clone()).await).await;
        let before = handle.target();

        assert_eq!(client.command("P 999 999\n").await, "RPRT -17\n");
        // Inside the protocol range but outside the workspace cone
        assert_eq!(client.command("P 0 20\n").await, "RPRT -9\n");
        assert_eq!(handle.target(), before);
        motion.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_survives_bad_input() {
        let (handle, motion) = platform();
        let mut client = Client::connect(server(handle.clone()).await).await;

        assert_eq!(client.command("X\n").await, "RPRT -4\n");
        assert_eq!(client.command("P abc 1\n").await, "RPRT -1\n");
        client.send("\n   \n").await;
        client.writer.write_all(&[0xFF, 0xFE, b'\n']).await.unwrap();
        assert_eq!(client.read_line().await, "RPRT -1\n");
        let long = format!("P {}\n", "1".repeat(MAX_LINE + 10));
        assert_eq!(client.command(&long).await, "RPRT -1\n");

        assert_eq!(client.command("P 90 60\n").await, "RPRT 0\n");
        assert!(client.command("_\n").await.contains(env!("CARGO_PKG_NAME")));
        motion.shutdown().await;
    }

    #[tokio::test]
    async fn test_last_write_wins_across_connections() {
        let (handle, motion) = platform();
        let addr = server(handle.clone()).await;
        let mut first = Client::connect(addr).await;
        let mut second = Client::connect(addr).await;

        assert_eq!(first.command("P 90 60\n").await, "RPRT 0\n");
        assert_eq!(second.command("P 270 55\n").await, "RPRT 0\n");

        let settled = handle.wait_settled().await;
        assert_eq!(settled.current, Orientation::new(270.0, 55.0));
        assert_eq!(first.command("p\n").await, "270.000000\n");
        motion.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_and_reset() {
        let (handle, motion) = platform();
        let mut client = Client::connect(server(handle.clone()).await).await;

        assert_eq!(client.command("P 45 55\n").await, "RPRT 0\n");
        handle.wait_settled().await;
        assert_eq!(client.command("S\n").await, "RPRT 0\n");
        assert_eq!(handle.target(), Orientation::new(45.0, 55.0));

        assert_eq!(client.command("\\reset 1\n").await, "RPRT 0\n");
        assert_eq!(handle.target(), Orientation::NEUTRAL);
        motion.shutdown().await;
    }

    #[tokio::test]
    async fn test_quit_closes_only_that_connection() {
        let (handle, motion) = platform();
        let addr = server(handle.clone()).await;
        let mut leaving = Client::connect(addr).await;
        let mut staying = Client::connect(addr).await;

        leaving.send("q\n").await;
        let mut rest = Vec::new();
        leaving.reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        assert_eq!(staying.command("P 10 70\n").await, "RPRT 0\n");
        motion.shutdown().await;
    }
}
