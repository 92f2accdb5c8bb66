// Keyboard jog over rotctl: arrows/WASD move, R/F step size, C center, Q quit
//
// Usage: cargo run --example jog -- [host:port]
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use spm_rotator::messages::Orientation;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{info, warn};

const STEPS: [f64; 3] = [1.0, 5.0, 15.0]; // degrees of pitch/roll per key press

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Rotctl {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Rotctl {
    async fn connect(addr: &str) -> Result<Self, BoxError> {
        let (reader, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn line(&mut self) -> Result<String, BoxError> {
        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        Ok(line.trim().to_string())
    }

    async fn get_position(&mut self) -> Result<Orientation, BoxError> {
        self.writer.write_all(b"p\n").await?;
        let azimuth = self.line().await?.parse()?;
        let elevation = self.line().await?.parse()?;
        Ok(Orientation::new(azimuth, elevation))
    }

    async fn set_position(&mut self, target: Orientation) -> Result<String, BoxError> {
        let command = format!("P {:.2} {:.2}\n", target.azimuth, target.elevation);
        self.writer.write_all(command.as_bytes()).await?;
        self.line().await
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4533".to_string());
    info!("Connecting to rotctl at {}...", addr);
    let mut rotctl = Rotctl::connect(&addr).await?;

    info!("Controls: W/S or Up/Down = pitch, A/D or Left/Right = roll, R/F = step, C = center, Q = quit");
    print_step(0);

    enable_raw_mode()?;
    let result = run_jog(&mut rotctl).await;
    disable_raw_mode()?;

    result
}

async fn run_jog(rotctl: &mut Rotctl) -> Result<(), BoxError> {
    let mut step_idx: usize = 0;
    let (mut pitch, mut roll) = rotctl.get_position().await?.to_pitch_roll();

    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
            continue;
        }

        let step = STEPS[step_idx];
        match code {
            KeyCode::Char('w') | KeyCode::Up => pitch += step,
            KeyCode::Char('s') | KeyCode::Down => pitch -= step,
            KeyCode::Char('d') | KeyCode::Right => roll += step,
            KeyCode::Char('a') | KeyCode::Left => roll -= step,
            KeyCode::Char('c') => (pitch, roll) = (0.0, 0.0),

            KeyCode::Char('r') => {
                step_idx = (step_idx + 1).min(STEPS.len() - 1);
                print_step(step_idx);
                continue;
            }
            KeyCode::Char('f') => {
                step_idx = step_idx.saturating_sub(1);
                print_step(step_idx);
                continue;
            }

            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        }

        let target = Orientation::from_pitch_roll(pitch, roll);
        let reply = rotctl.set_position(target).await?;
        if reply == "RPRT 0" {
            info!("Target {}\r", target);
        } else {
            // Outside the workspace: fall back to where the plate is
            warn!("{} rejected ({})\r", target, reply);
            (pitch, roll) = rotctl.get_position().await?.to_pitch_roll();
        }
    }

    Ok(())
}

fn print_step(idx: usize) {
    info!("Step: {}°", STEPS[idx]);
}
