//! # Session Coordinator
//!
//! Runs one device cycle: capture a session, hand the finished container to
//! the upload hand-off, then schedule a restart.
//!
//! ```text
//! Init → Capturing → Uploading → Complete
//!   └────────┴───────────┴─────→ Error
//! ```
//!
//! Nothing is retried in-process. `Complete` and `Error` only set a restart
//! deadline (short after success, longer after a failure); the driver drops
//! the whole coordinator once it is due and builds a fresh one.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::container::read_header;
use crate::recorder::{CaptureController, CaptureOutput, CaptureState};
use crate::upload::{UploadHandoff, UploadState};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Init,
    Capturing,
    Uploading,
    Complete,
    Error,
}

impl CoordinatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Complete | CoordinatorState::Error)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub success_cooldown: Duration,
    pub error_cooldown: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            success_cooldown: Duration::from_secs(config.restart.success_cooldown_secs),
            error_cooldown: Duration::from_secs(config.restart.error_cooldown_secs),
        }
    }
}

pub struct Coordinator {
    clock: SharedClock,
    capture: CaptureController,
    upload: UploadHandoff,
    policy: RestartPolicy,
    state: CoordinatorState,
    restart_at: Option<Duration>,
    failure: Option<String>,
}

impl Coordinator {
    pub fn new(
        clock: SharedClock,
        capture: CaptureController,
        upload: UploadHandoff,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            clock,
            capture,
            upload,
            policy,
            state: CoordinatorState::Init,
            restart_at: None,
            failure: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Message of whatever ended the cycle in `Error`
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn tick(&mut self) {
        match self.state {
            CoordinatorState::Init => match self.capture.start() {
                Ok(()) => self.state = CoordinatorState::Capturing,
                Err(e) => self.enter_error(e.to_string()),
            },
            CoordinatorState::Capturing => {
                self.capture.tick();
                if self.capture.state() == CaptureState::Stopped {
                    self.begin_upload();
                }
            }
            CoordinatorState::Uploading => {
                self.upload.tick();
                match self.upload.state() {
                    UploadState::Done => self.enter_complete(),
                    UploadState::Failed => self.enter_error(self.upload.last_error_message()),
                    _ => {}
                }
            }
            CoordinatorState::Complete | CoordinatorState::Error => {}
        }
    }

    fn begin_upload(&mut self) {
        let Some(summary) = self.capture.summary() else {
            let reason = self
                .capture
                .last_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "capture stopped without a session".to_string());
            self.enter_error(reason);
            return;
        };

        if let CaptureOutput::Container(container) = &summary.output {
            match &container.integrity {
                Ok(()) => log::info!("Container verified: {} bytes", container.size_on_disk),
                Err(e) => log::warn!("{} - uploading anyway", e),
            }
            match read_header(&container.path) {
                Ok(header) if header == container.header => log::info!(
                    "Header on storage: ECG {} @ {} Hz, IMU {} @ {} Hz",
                    header.ecg_samples,
                    header.ecg_rate_hz,
                    header.imu_samples,
                    header.imu_rate_hz
                ),
                Ok(header) => log::warn!(
                    "Header on storage differs from the one written ({:?} vs {:?}) - uploading anyway",
                    header,
                    container.header
                ),
                Err(e) => log::warn!("{} - uploading anyway", e),
            }
        }

        let target = summary.upload_target();
        match self.upload.start(target) {
            Ok(()) => self.state = CoordinatorState::Uploading,
            Err(e) => self.enter_error(e.to_string()),
        }
    }

    fn enter_complete(&mut self) {
        self.upload.release_link();
        let cooldown = self.policy.success_cooldown;
        log::info!("Cycle complete, restarting in {}s", cooldown.as_secs());
        self.restart_at = Some(self.clock.now() + cooldown);
        self.state = CoordinatorState::Complete;
    }

    fn enter_error(&mut self, reason: String) {
        let cooldown = self.policy.error_cooldown;
        log::error!("Cycle failed: {} (restarting in {}s)", reason, cooldown.as_secs());
        self.upload.release_link();
        self.failure = Some(reason);
        self.restart_at = Some(self.clock.now() + cooldown);
        self.state = CoordinatorState::Error;
    }

    /// The cool-down after a terminal state has elapsed
    pub fn restart_due(&self) -> bool {
        self.restart_at
            .map(|at| self.clock.now() >= at)
            .unwrap_or(false)
    }

    pub fn restart_in(&self) -> Option<Duration> {
        self.restart_at
            .map(|at| at.saturating_sub(self.clock.now()))
    }

    /// Finalize a running capture or abandon a running upload
    pub fn shutdown(&mut self) {
        match self.state {
            CoordinatorState::Capturing => self.capture.stop(),
            CoordinatorState::Uploading => self.upload.cancel(),
            _ => {}
        }
    }

    pub fn progress(&self) -> f32 {
        match self.state {
            CoordinatorState::Init => 0.0,
            CoordinatorState::Capturing => self.capture.progress(),
            CoordinatorState::Uploading => self.upload.progress(),
            CoordinatorState::Complete => 1.0,
            CoordinatorState::Error => 0.0,
        }
    }

    /// One-line status for an attached display
    pub fn status_line(&self) -> String {
        match self.state {
            CoordinatorState::Init => "Initializing...".to_string(),
            CoordinatorState::Capturing => {
                let (ecg, imu) = self.capture.counts();
                let file = self
                    .capture
                    .current_file()
                    .and_then(|path| path.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "no storage".to_string());
                format!(
                    "Recording {} {}s | ECG {} | IMU {}",
                    file,
                    self.capture.elapsed_seconds(),
                    ecg,
                    imu
                )
            }
            CoordinatorState::Uploading => self.upload.status_line(),
            CoordinatorState::Complete => "Complete, restarting".to_string(),
            CoordinatorState::Error => {
                format!("Error: {}", self.failure().unwrap_or("unknown"))
            }
        }
    }
}
