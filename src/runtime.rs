// Motion loop, shared platform state, bring-up and shutdown
//
// The motion task owns the controller and the servo bus. Everything else talks to
// it through two watch channels: targets in, status snapshots out. A target is
// always replaced as a whole value and copied out once per tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::config::{HOMING_DURATION, RuntimeConfig, TOPIC_STATUS};
use crate::controller::{MotionController, MotionLimits};
use crate::messages::{Arm, ControllerStatus, Orientation, StatusSnapshot, TargetState};
use crate::motor::{
    Actuators, ArmAngles, DriverError, Geometry, Lx16aBus, ServoDriver, SimulatedBus,
    WorkspaceError,
};
use crate::rotctl;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Real or simulated servos, picked at startup
pub enum PlatformServos {
    Serial(ServoDriver),
    Simulated(ServoDriver<SimulatedBus>),
}

impl PlatformServos {
    pub fn open(config: &RuntimeConfig) -> Result<Self, DriverError> {
        if config.simulate {
            info!("Using simulated servo bus");
            Ok(Self::Simulated(ServoDriver::from_bus(Lx16aBus::new(
                SimulatedBus::new(),
            ))))
        } else {
            let mut driver = ServoDriver::new(&config.serial_port, config.baud_rate)?;
            driver.ping_all()?;
            Ok(Self::Serial(driver))
        }
    }
}

impl Actuators for PlatformServos {
    fn move_to(&mut self, arm: Arm, angle: f64, duration: Duration) -> Result<(), DriverError> {
        match self {
            Self::Serial(d) => d.move_to(arm, angle, duration),
            Self::Simulated(d) => d.move_to(arm, angle, duration),
        }
    }

    fn commit_moves(&mut self) -> Result<(), DriverError> {
        match self {
            Self::Serial(d) => d.commit_moves(),
            Self::Simulated(d) => d.commit_moves(),
        }
    }

    fn read_position(&mut self, arm: Arm) -> Result<f64, DriverError> {
        match self {
            Self::Serial(d) => d.read_position(arm),
            Self::Simulated(d) => d.read_position(arm),
        }
    }

    fn write_calibration_offset(&mut self, arm: Arm, offset: f64) -> Result<(), DriverError> {
        match self {
            Self::Serial(d) => d.write_calibration_offset(arm, offset),
            Self::Simulated(d) => d.write_calibration_offset(arm, offset),
        }
    }

    fn set_torque(&mut self, arm: Arm, enabled: bool) -> Result<(), DriverError> {
        match self {
            Self::Serial(d) => d.set_torque(arm, enabled),
            Self::Simulated(d) => d.set_torque(arm, enabled),
        }
    }
}

/// Shared access to the platform for command handlers.
/// Cheap to clone; every clone sees the same target and status.
#[derive(Clone)]
pub struct PlatformHandle {
    target: Arc<watch::Sender<TargetState>>,
    status: watch::Receiver<StatusSnapshot>,
    geometry: Arc<Geometry>,
}

impl PlatformHandle {
    /// Replace the target after checking the solver can reach it
    pub fn request(&self, orientation: Orientation) -> Result<(), WorkspaceError> {
        self.geometry.solve(&orientation, None)?;
        self.target.send_replace(TargetState::new(orientation));
        Ok(())
    }

    /// Hold where the plate is now
    pub fn stop(&self) {
        let current = self.status.borrow().current;
        self.target.send_replace(TargetState::new(current));
    }

    /// Return to the level pose
    pub fn reset(&self) {
        self.target.send_replace(TargetState::new(Orientation::NEUTRAL));
    }

    pub fn target(&self) -> Orientation {
        self.target.borrow().orientation
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Wait until the motion task has taken the current target and stopped moving
    pub async fn wait_settled(&self) -> StatusSnapshot {
        let wanted = *self.target.borrow();
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| {
                s.target == wanted.orientation
                    && s.target_set_at == Some(wanted.set_at)
                    && s.status != ControllerStatus::Moving
            })
            .await
            .map(|s| s.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }
}

/// The running motion task
pub struct MotionTask {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl MotionTask {
    /// Stop the loop and wait for it to release the servos
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            warn!("Motion task ended abnormally: {}", e);
        }
    }
}

/// Start the periodic motion task
pub fn spawn_motion<A>(
    mut controller: MotionController<A>,
    geometry: Geometry,
    period: Duration,
) -> (PlatformHandle, MotionTask)
where
    A: Actuators + Send + 'static,
{
    let (target_tx, mut target_rx) = watch::channel(controller.target());
    let (status_tx, status_rx) = watch::channel(controller.snapshot());
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tick.tick() => {
                    let target = *target_rx.borrow_and_update();
                    controller.step(target);

                    let snapshot = controller.snapshot();
                    status_tx.send_if_modified(|published| {
                        if *published == snapshot {
                            return false;
                        }
                        *published = snapshot;
                        true
                    });
                }
            }
        }

        info!("Motion loop stopped, releasing servos");
        if let Err(e) = controller.actuators_mut().release_all() {
            warn!("Failed to release servos: {}", e);
        }
    });

    let handle = PlatformHandle {
        target: Arc::new(target_tx),
        status: status_rx,
        geometry: Arc::new(geometry),
    };
    (handle, MotionTask { shutdown: shutdown_tx, join })
}

/// Engage the servos, report where they are and move slowly to level
pub fn bring_up<A: Actuators>(
    mut actuators: A,
    geometry: Geometry,
    limits: MotionLimits,
) -> Result<MotionController<A>, BoxError> {
    let angles: ArmAngles = actuators.engage_all()?;
    match geometry.forward(&angles) {
        Ok(pose) => info!(
            "Servos report {} (fit error {:.2}°)",
            pose.orientation, pose.rms_error_deg
        ),
        Err(e) => warn!("Servo angles {:?} match no pose: {}", angles.as_array(), e),
    }

    let mut controller = MotionController::new(actuators, geometry, limits);
    controller.home(HOMING_DURATION)?;
    Ok(controller)
}

/// Open the servos, home, and start the motion task
pub async fn start(config: &RuntimeConfig) -> Result<(PlatformHandle, MotionTask), BoxError> {
    let servos = PlatformServos::open(config)?;
    let geometry = Geometry::default();
    let controller = bring_up(servos, geometry.clone(), MotionLimits::from_config(config))?;

    // Let the homing move finish before the first rate-limited tick
    tokio::time::sleep(HOMING_DURATION).await;

    info!(
        "Motion loop started: {}Hz, {:.0}°/s max",
        config.loop_hz, config.max_velocity_deg_s
    );
    Ok(spawn_motion(controller, geometry, config.tick_period()))
}

/// Publish every status change over Zenoh
pub async fn publish_status(mut status: watch::Receiver<StatusSnapshot>) -> Result<(), BoxError> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_STATUS).await?;
    info!("Publishing to: {}", TOPIC_STATUS);

    loop {
        let json = serde_json::to_string(&*status.borrow_and_update())?;
        publisher.put(json).await?;
        if status.changed().await.is_err() {
            return Ok(());
        }
    }
}

async fn telemetry(config: &RuntimeConfig, handle: &PlatformHandle) -> Result<(), BoxError> {
    if config.telemetry {
        publish_status(handle.subscribe()).await
    } else {
        std::future::pending().await
    }
}

/// Serve rotctl until Ctrl-C
pub async fn run(config: RuntimeConfig) -> Result<(), BoxError> {
    let (handle, motion) = start(&config).await?;

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!("rotctl running on {}", listener.local_addr()?);

    let result: Result<(), BoxError> = tokio::select! {
        r = rotctl::serve(listener, handle.clone()) => r.map_err(BoxError::from),
        r = telemetry(&config, &handle) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    motion.shutdown().await;
    result
}

/// Move to one orientation, wait for it, then release
pub async fn position(config: RuntimeConfig, orientation: Orientation) -> Result<(), BoxError> {
    let (handle, motion) = start(&config).await?;
    handle.request(orientation)?;

    let result = tokio::select! {
        settled = handle.wait_settled() => settled_or_fault(settled),
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    motion.shutdown().await;
    result
}

/// Sweep the whole workspace: every 5° of azimuth on rings 5° of elevation apart
pub async fn demo(config: RuntimeConfig) -> Result<(), BoxError> {
    let (handle, motion) = start(&config).await?;

    let sweep = async {
        for elevation in (50..=90).step_by(5) {
            info!("Sweeping elevation {}°", elevation);
            for azimuth in (0..360).step_by(5) {
                handle.request(Orientation::new(azimuth as f64, elevation as f64))?;
                settled_or_fault(handle.wait_settled().await)?;
            }
        }
        Ok::<(), BoxError>(())
    };

    let result = tokio::select! {
        r = sweep => r,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    motion.shutdown().await;
    result
}

fn settled_or_fault(snapshot: StatusSnapshot) -> Result<(), BoxError> {
    match snapshot.status {
        ControllerStatus::Fault(reason) => Err(format!("controller fault: {}", reason).into()),
        _ => {
            info!("At {}", snapshot.current);
            Ok(())
        }
    }
}
