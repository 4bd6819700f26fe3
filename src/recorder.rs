//! # Capture Session Controller
//!
//! Owns the sample clock, the encoder and the container writer for the one
//! active session and moves it through `Idle → Capturing → Stopped`.
//!
//! ## Lifecycle
//! 1. `start()` opens a new session file and resets the counters
//! 2. `tick()` fires every due sample, appends it, and stops on its own once
//!    the configured wall-clock duration has elapsed
//! 3. `stop()` (automatic or external) flushes, rewrites the header with the
//!    final counts and verifies the file size
//!
//! ## Reduced fidelity
//! If the storage directory cannot be prepared at init the controller still
//! runs the schedule and counts samples but writes nothing. The summary then
//! carries a simulated container size so the upload hand-off can proceed.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::container::{
    create_file, expected_size, ContainerHeader, ContainerWriter, FileOpener, FinalizedContainer,
};
use crate::error::{CaptureError, StorageError};
use crate::sampling::{SampleClock, SampleEncoder, SampleRecord};
use crate::upload::UploadTarget;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROGRESS_LOG_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Stopped,
}

/// The one active recording
#[derive(Debug, Clone)]
pub struct CaptureSession {
    /// `session_<start_timestamp>`, also the container's file stem
    pub name: String,
    /// `None` when running without storage
    pub path: Option<PathBuf>,
    pub start_timestamp: u32,
    pub started_at: Duration,
    pub ecg_samples: u32,
    pub imu_samples: u32,
}

#[derive(Debug, Clone)]
pub enum CaptureOutput {
    Container(FinalizedContainer),
    /// No storage: size the container would have had
    Simulated { size: u64 },
}

/// Frozen result of a stopped session
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub session: CaptureSession,
    pub output: CaptureOutput,
}

impl CaptureSummary {
    pub fn upload_target(&self) -> UploadTarget {
        match &self.output {
            CaptureOutput::Container(container) => {
                UploadTarget::file(container.path.clone(), self.session.start_timestamp)
            }
            CaptureOutput::Simulated { size } => UploadTarget::simulated(
                self.session.name.clone(),
                self.session.start_timestamp,
                *size,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device_id: u16,
    pub duration: Duration,
    pub storage_dir: PathBuf,
    pub buffer_capacity: usize,
    pub rates: (u16, u16),
}

impl CaptureSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_id: config.device.numeric_id,
            duration: config.capture.duration(),
            storage_dir: config.capture.storage_dir.clone(),
            buffer_capacity: config.capture.write_buffer_bytes,
            rates: (config.capture.ecg_rate_hz, config.capture.imu_rate_hz),
        }
    }
}

/// Make sure the storage directory exists and is writable
pub fn check_storage(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir).map_err(|source| StorageError::Unavailable {
        path: dir.to_path_buf(),
        source,
    })?;
    let metadata = fs::metadata(dir).map_err(|source| StorageError::Unavailable {
        path: dir.to_path_buf(),
        source,
    })?;
    if metadata.permissions().readonly() {
        return Err(StorageError::Unavailable {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        });
    }
    Ok(())
}

pub struct CaptureController {
    clock: SharedClock,
    settings: CaptureSettings,
    storage_available: bool,
    file_opener: FileOpener,
    sample_clock: SampleClock,
    encoder: SampleEncoder,
    state: CaptureState,
    session: Option<CaptureSession>,
    writer: Option<ContainerWriter>,
    stopped_at: Option<Duration>,
    summary: Option<CaptureSummary>,
    last_error: Option<CaptureError>,
    last_progress_log: u64,
}

impl CaptureController {
    pub fn new(settings: CaptureSettings, clock: SharedClock, encoder: SampleEncoder) -> Self {
        let storage_available = match check_storage(&settings.storage_dir) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{} - capturing without a file", e);
                false
            }
        };

        Self {
            clock,
            sample_clock: SampleClock::new(settings.rates.0, settings.rates.1),
            settings,
            storage_available,
            file_opener: create_file,
            encoder,
            state: CaptureState::Idle,
            session: None,
            writer: None,
            stopped_at: None,
            summary: None,
            last_error: None,
            last_progress_log: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Route container files somewhere other than the filesystem
    #[cfg(test)]
    pub(crate) fn set_file_opener(&mut self, opener: FileOpener) {
        self.file_opener = opener;
    }

    /// Open a new session. Rejected while another session is capturing.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.state == CaptureState::Capturing {
            return Err(CaptureError::Busy);
        }

        let now = self.clock.now();
        // Wall-clock seconds: the monotonic clock restarts with every cycle,
        // so it cannot name session files uniquely.
        let start_timestamp = self.clock.unix_seconds();
        let session_id = start_timestamp;
        let name = format!("session_{}", session_id);

        self.summary = None;
        self.last_error = None;
        self.stopped_at = None;
        self.last_progress_log = 0;

        let path = if self.storage_available {
            let path = self.settings.storage_dir.join(format!("{}.bin", name));
            let header = ContainerHeader::new(
                self.settings.device_id,
                session_id,
                start_timestamp,
                self.sample_clock.rates(),
            );
            let writer = ContainerWriter::open(
                &path,
                header,
                self.settings.buffer_capacity,
                self.file_opener,
            )
                .map_err(|e| {
                    log::error!("{}", e);
                    CaptureError::Storage(e)
                })?;
            self.writer = Some(writer);
            Some(path)
        } else {
            None
        };

        log::info!(
            "Starting capture {} for {}s (ECG {} Hz, IMU {} Hz)",
            name,
            self.settings.duration.as_secs(),
            self.settings.rates.0,
            self.settings.rates.1
        );

        self.sample_clock.start(now);
        self.session = Some(CaptureSession {
            name,
            path,
            start_timestamp,
            started_at: now,
            ecg_samples: 0,
            imu_samples: 0,
        });
        self.state = CaptureState::Capturing;
        Ok(())
    }

    /// Fire every due sample; stop once the session duration has elapsed
    pub fn tick(&mut self) {
        if self.state != CaptureState::Capturing {
            return;
        }
        let Some(started_at) = self.session.as_ref().map(|s| s.started_at) else {
            return;
        };

        let now = self.clock.now();
        let end = started_at + self.settings.duration;

        while let Some(channel) = self.sample_clock.next_firing(now, end) {
            let record = self.encoder.sample(channel);
            if let Err(e) = self.record(&record) {
                self.abort(e);
                return;
            }
        }

        self.log_progress(now.saturating_sub(started_at));

        if now >= end {
            self.stop();
        }
    }

    fn record(&mut self, record: &SampleRecord) -> Result<(), StorageError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.append(record)?;
        }
        if let Some(session) = self.session.as_mut() {
            match record {
                SampleRecord::Ecg(_) => session.ecg_samples += 1,
                SampleRecord::Imu(_) => session.imu_samples += 1,
            }
        }
        Ok(())
    }

    fn abort(&mut self, error: StorageError) {
        log::error!("Capture aborted: {}", error);
        // Partial file stays on storage; the session produces no summary
        self.writer = None;
        self.stopped_at = Some(self.clock.now());
        self.state = CaptureState::Stopped;
        self.last_error = Some(CaptureError::Storage(error));
    }

    /// Finalize the session. Calling it again, or when not capturing, does nothing.
    pub fn stop(&mut self) {
        if self.state != CaptureState::Capturing {
            return;
        }
        self.state = CaptureState::Stopped;
        self.stopped_at = Some(self.clock.now());

        let Some(session) = self.session.clone() else {
            return;
        };
        log::info!("Finalizing capture {}", session.name);

        let output = match self.writer.take() {
            Some(writer) => match writer.finalize(session.ecg_samples, session.imu_samples) {
                Ok(container) => CaptureOutput::Container(container),
                Err(e) => {
                    log::error!("Capture finalize failed: {}", e);
                    self.last_error = Some(CaptureError::Storage(e));
                    return;
                }
            },
            None => CaptureOutput::Simulated {
                size: expected_size(session.ecg_samples as u64, session.imu_samples as u64),
            },
        };

        let size = match &output {
            CaptureOutput::Container(c) => c.size_on_disk,
            CaptureOutput::Simulated { size } => *size,
        };
        log::info!(
            "Capture complete: ECG {} samples, IMU {} samples, {:.2} KB{}",
            session.ecg_samples,
            session.imu_samples,
            size as f64 / 1024.0,
            if matches!(output, CaptureOutput::Simulated { .. }) {
                " (simulated)"
            } else {
                ""
            }
        );

        self.summary = Some(CaptureSummary { session, output });
    }

    fn log_progress(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs();
        if secs > 0 && secs % PROGRESS_LOG_INTERVAL_SECS == 0 && secs != self.last_progress_log {
            self.last_progress_log = secs;
            let (ecg, imu) = self.counts();
            log::info!(
                "Capture {}s/{}s ({:.1}%) | ECG: {} | IMU: {}",
                secs,
                self.settings.duration.as_secs(),
                self.progress() * 100.0,
                ecg,
                imu
            );
        }
    }

    /// Elapsed over configured duration, clamped to [0, 1]
    pub fn progress(&self) -> f32 {
        let duration = self.settings.duration.as_secs_f32();
        if duration <= 0.0 {
            return 1.0;
        }
        (self.elapsed().as_secs_f32() / duration).clamp(0.0, 1.0)
    }

    pub fn elapsed(&self) -> Duration {
        let Some(session) = &self.session else {
            return Duration::ZERO;
        };
        let until = self.stopped_at.unwrap_or_else(|| self.clock.now());
        until.saturating_sub(session.started_at)
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed().as_secs()
    }

    pub fn counts(&self) -> (u32, u32) {
        self.session
            .as_ref()
            .map(|s| (s.ecg_samples, s.imu_samples))
            .unwrap_or((0, 0))
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.session.as_ref().and_then(|s| s.path.as_deref())
    }

    pub fn summary(&self) -> Option<&CaptureSummary> {
        self.summary.as_ref()
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::container::{read_header, HEADER_SIZE};
    use crate::sampling::{ECG_RECORD_SIZE, IMU_RECORD_SIZE};
    use crate::sensor::{Absent, SyntheticEcg};
    use crate::testing::open_full_disk;
    use std::sync::Arc;
    use tempfile::tempdir;

    const EPOCH: u32 = 1_700_000_000;

    fn settings(dir: &Path, duration_secs: u64) -> CaptureSettings {
        CaptureSettings {
            device_id: 1,
            duration: Duration::from_secs(duration_secs),
            storage_dir: dir.to_path_buf(),
            buffer_capacity: 512,
            rates: (250, 25),
        }
    }

    fn controller(settings: CaptureSettings, clock: &Arc<ManualClock>) -> CaptureController {
        let encoder = SampleEncoder::new(
            Box::new(SyntheticEcg::new(clock.clone(), 72.0)),
            Box::new(Absent),
        );
        CaptureController::new(settings, clock.clone(), encoder)
    }

    fn run_until_stopped(capture: &mut CaptureController, clock: &ManualClock, step: Duration) {
        while capture.state() == CaptureState::Capturing {
            clock.advance(step);
            capture.tick();
        }
    }

    #[test]
    fn test_ten_second_session_counts_and_size() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 10), &clock);

        capture.start().unwrap();
        capture.tick();
        run_until_stopped(&mut capture, &clock, Duration::from_millis(1));

        assert_eq!(capture.state(), CaptureState::Stopped);
        assert_eq!(capture.counts(), (2500, 250));

        let summary = capture.summary().expect("summary");
        let CaptureOutput::Container(container) = &summary.output else {
            panic!("expected a container");
        };
        assert!(container.integrity.is_ok());
        let expected = HEADER_SIZE as u64
            + 2500 * ECG_RECORD_SIZE as u64
            + 250 * IMU_RECORD_SIZE as u64;
        assert_eq!(fs::metadata(&container.path).unwrap().len(), expected);

        let header = read_header(&container.path).unwrap();
        assert_eq!(header.ecg_samples, 2500);
        assert_eq!(header.imu_samples, 250);
        assert_eq!(header.session_id, EPOCH);
        assert_eq!((header.ecg_rate_hz, header.imu_rate_hz), (250, 25));
    }

    #[test]
    fn test_coarse_polling_loses_no_samples() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 2), &clock);

        capture.start().unwrap();
        // 37 ms between polls, far slower than the 4 ms ECG interval
        run_until_stopped(&mut capture, &clock, Duration::from_millis(37));

        assert_eq!(capture.counts(), (500, 50));
        let path = capture.current_file().unwrap().to_path_buf();
        assert_eq!(fs::metadata(&path).unwrap().len(), expected_size(500, 50));
    }

    #[test]
    fn test_start_while_capturing_is_busy() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 10), &clock);

        capture.start().unwrap();
        assert!(matches!(capture.start(), Err(CaptureError::Busy)));
        assert_eq!(capture.state(), CaptureState::Capturing);
    }

    #[test]
    fn test_external_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 10), &clock);

        capture.start().unwrap();
        clock.advance(Duration::from_millis(1000));
        capture.tick();
        capture.stop();

        let first = capture.summary().unwrap().clone();
        let path = capture.current_file().unwrap().to_path_buf();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();

        clock.advance(Duration::from_millis(500));
        capture.stop();
        capture.tick();

        assert_eq!(capture.counts(), (first.session.ecg_samples, first.session.imu_samples));
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), modified);
        assert_eq!(capture.elapsed(), Duration::from_millis(1000));
        assert!((capture.progress() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_progress_is_clamped() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 4), &clock);

        assert_eq!(capture.progress(), 0.0);
        assert_eq!(capture.elapsed_seconds(), 0);
        assert!(capture.current_file().is_none());

        capture.start().unwrap();
        clock.advance(Duration::from_secs(2));
        assert!((capture.progress() - 0.5).abs() < 1e-6);

        clock.advance(Duration::from_secs(10));
        capture.tick();
        assert_eq!(capture.progress(), 1.0);
    }

    #[test]
    fn test_restart_after_stop_opens_new_session() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 1), &clock);

        capture.start().unwrap();
        run_until_stopped(&mut capture, &clock, Duration::from_millis(5));
        let first = capture.current_file().unwrap().to_path_buf();

        clock.advance(Duration::from_secs(2));
        capture.start().unwrap();
        assert_eq!(capture.counts(), (0, 0));
        assert!(capture.summary().is_none());
        assert_ne!(capture.current_file().unwrap(), first.as_path());
    }

    #[test]
    fn test_without_storage_simulates_size() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(&blocker.join("sessions"), 1), &clock);
        assert!(!capture.storage_available);

        capture.start().unwrap();
        run_until_stopped(&mut capture, &clock, Duration::from_millis(2));

        let summary = capture.summary().unwrap();
        assert!(capture.current_file().is_none());
        match summary.output {
            CaptureOutput::Simulated { size } => assert_eq!(size, expected_size(250, 25)),
            _ => panic!("expected simulated output"),
        }
        let target = summary.upload_target();
        assert_eq!(target.session_id, format!("session_{}", EPOCH));
    }

    #[test]
    fn test_start_fails_when_file_cannot_be_created() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 1), &clock);

        // A directory squatting on the session file name
        fs::create_dir(dir.path().join(format!("session_{}.bin", EPOCH))).unwrap();

        assert!(matches!(
            capture.start(),
            Err(CaptureError::Storage(StorageError::Create { .. }))
        ));
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(capture.summary().is_none());
    }

    #[test]
    fn test_write_failure_aborts_without_summary() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(EPOCH);
        let mut capture = controller(settings(dir.path(), 10), &clock);
        capture.set_file_opener(open_full_disk);

        capture.start().unwrap();
        // 512-byte buffer overflows within the first half second
        run_until_stopped(&mut capture, &clock, Duration::from_millis(5));

        assert!(clock.now() < Duration::from_secs(1));
        assert!(capture.summary().is_none());
        assert!(matches!(
            capture.last_error(),
            Some(CaptureError::Storage(StorageError::Write { .. }))
        ));

        // Stopped for good: neither tick nor stop revives it
        clock.advance(Duration::from_secs(1));
        capture.tick();
        capture.stop();
        assert!(capture.summary().is_none());
    }
}
