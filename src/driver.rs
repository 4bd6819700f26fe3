//! # Cycle Driver
//!
//! Owns the poll loop. Each cycle gets a freshly built `Coordinator`, which
//! is ticked until its restart cool-down is due and then dropped, so no state
//! survives from one cycle to the next.
//!
//! ## Key Components
//! - `Driver`: Runs cycles on a dedicated thread until told to stop
//! - `DriverCommand`: Commands sent from `main` to the driver thread
//! - `run_cycle`: One cycle, observing commands at every poll boundary
//!
//! The loop never blocks on a collaborator for longer than one `tick()`, so a
//! `Shutdown` is seen within one poll interval (or after an in-flight PUT).

use crate::broker::MqttBroker;
use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorState, RestartPolicy};
use crate::error::ConfigError;
use crate::link::ReachabilityLink;
use crate::recorder::{CaptureController, CaptureSettings};
use crate::sampling::SampleEncoder;
use crate::sensor::{Absent, Accelerometer, EcgFrontEnd, SyntheticEcg, SyntheticImu};
use crate::transfer::HttpObjectStore;
use crate::upload::{HandoffSettings, UploadHandoff};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

/// Poll cadence while samples are due every few milliseconds
const CAPTURE_POLL: Duration = Duration::from_millis(1);
/// Poll cadence for network stages and cool-downs
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Complete,
    Error,
    Shutdown,
}

/// Builds the components for one cycle
pub type CoordinatorFactory = Box<dyn FnMut() -> Result<Coordinator, ConfigError> + Send>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    pub completed: u32,
    pub failed: u32,
    pub interrupted: bool,
}

const SYNTHETIC_HEART_RATE_BPM: f32 = 72.0;
const LINK_CHECK_TIMEOUT: Duration = Duration::from_millis(300);

/// Build every component of one cycle against the real collaborators
pub fn build_coordinator(config: &Config) -> Result<Coordinator, ConfigError> {
    let clock = MonotonicClock::shared();

    let ecg: Box<dyn EcgFrontEnd> = if config.capture.simulate_ecg {
        Box::new(SyntheticEcg::new(clock.clone(), SYNTHETIC_HEART_RATE_BPM))
    } else {
        Box::new(Absent)
    };
    let imu: Box<dyn Accelerometer> = if config.capture.simulate_imu {
        Box::new(SyntheticImu::new(clock.clone()))
    } else {
        Box::new(Absent)
    };
    let capture = CaptureController::new(
        CaptureSettings::from_config(config),
        clock.clone(),
        SampleEncoder::new(ecg, imu),
    );

    let link = ReachabilityLink::new(
        config.broker.endpoint.clone(),
        config.broker.port,
        LINK_CHECK_TIMEOUT,
    );
    let broker = MqttBroker::from_config(config)?;
    let store = HttpObjectStore::new(Duration::from_secs(config.transfer.timeout_secs));
    let upload = UploadHandoff::new(
        HandoffSettings::from_config(config),
        clock.clone(),
        Box::new(link),
        Box::new(broker),
        Box::new(store),
    );

    Ok(Coordinator::new(clock, capture, upload, RestartPolicy::from_config(config)))
}

/// Tick `coordinator` until its restart is due or a shutdown arrives
pub fn run_cycle(coordinator: &mut Coordinator, commands: &Receiver<DriverCommand>) -> CycleOutcome {
    let mut last_state = coordinator.state();

    loop {
        match commands.try_recv() {
            Ok(DriverCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                log::info!("Driver: shutdown requested in {:?}", coordinator.state());
                coordinator.shutdown();
                return CycleOutcome::Shutdown;
            }
            Err(TryRecvError::Empty) => {}
        }

        coordinator.tick();

        let state = coordinator.state();
        if state != last_state {
            log::info!(
                "Driver: {:?} -> {:?} ({:.0}%) | {}",
                last_state,
                state,
                coordinator.progress() * 100.0,
                coordinator.status_line()
            );
            if let Some(wait) = coordinator.restart_in() {
                log::info!("Driver: next cycle in {:.1}s", wait.as_secs_f32());
            }
            last_state = state;
        }

        if state.is_terminal() && coordinator.restart_due() {
            return match state {
                CoordinatorState::Complete => CycleOutcome::Complete,
                _ => CycleOutcome::Error,
            };
        }

        thread::sleep(if state == CoordinatorState::Capturing {
            CAPTURE_POLL
        } else {
            IDLE_POLL
        });
    }
}

pub struct Driver {
    factory: CoordinatorFactory,
    commands: Receiver<DriverCommand>,
    max_cycles: Option<u32>,
}

impl Driver {
    /// Creates a driver and the sender used to command it from another thread.
    pub fn new(factory: CoordinatorFactory, max_cycles: Option<u32>) -> (Self, Sender<DriverCommand>) {
        let (command_sender, commands) = unbounded();
        let driver = Driver {
            factory,
            commands,
            max_cycles,
        };
        (driver, command_sender)
    }

    /// Creates a driver whose cycles are built from `config`
    pub fn from_config(config: Config, max_cycles: Option<u32>) -> (Self, Sender<DriverCommand>) {
        Self::new(Box::new(move || build_coordinator(&config)), max_cycles)
    }

    /// Run cycles until `max_cycles` is reached or a shutdown arrives.
    ///
    /// Blocks; meant for a dedicated thread.
    pub fn run(mut self) -> DriverReport {
        let mut report = DriverReport::default();
        let mut cycle = 0u32;

        loop {
            if self.max_cycles.is_some_and(|max| cycle >= max) {
                log::info!("Driver: {} cycle(s) done, stopping", cycle);
                break;
            }
            cycle += 1;

            let mut coordinator = match (self.factory)() {
                Ok(coordinator) => coordinator,
                Err(e) => {
                    log::error!("Driver: cannot build cycle {}: {}", cycle, e);
                    report.interrupted = true;
                    break;
                }
            };

            log::info!("Driver: starting cycle {}", cycle);
            match run_cycle(&mut coordinator, &self.commands) {
                CycleOutcome::Complete => report.completed += 1,
                CycleOutcome::Error => report.failed += 1,
                CycleOutcome::Shutdown => {
                    report.interrupted = true;
                    break;
                }
            }
            // Restart: every component of this cycle is dropped here
        }

        log::info!(
            "Driver: stopped ({} complete, {} failed)",
            report.completed,
            report.failed
        );
        report
    }
}
