//! # Upload Hand-off Module
//!
//! Moves a finalized container from local storage to the object store.
//!
//! ## States
//! ```text
//! Idle → LinkUp → BrokerReady → AwaitingUrl → Transferring → Done
//!          └──────────┴─────────────┴──────────────┴──────→ Failed
//! ```
//! Transitions only move forward. `start()` (from `Idle`, `Done` or `Failed`)
//! is the only way back to the beginning, and `cancel()` drops an active
//! attempt to `Idle`.
//!
//! ## Waiting
//! Nothing here blocks for a whole stage. Every wait (link polls, CONNACK,
//! broker retries, subscription confirmation, the response timeout) is a
//! deadline checked on each `tick()`. The streamed PUT is the one call that
//! runs to completion inside a tick.
//!
//! ## Correlation
//! The broker client forwards deliveries into a channel registered once at
//! construction. While `AwaitingUrl`, each tick drains that channel and
//! accepts the first valid `UploadResponse` on this device's response topic.
//! Other topics, malformed payloads and anything left over from an earlier
//! attempt are logged and dropped.

use crate::broker::{BrokerClient, InboundMessage, UploadRequest, UploadResponse};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::{AttemptInProgress, HandoffError, LinkError, StorageError};
use crate::link::Link;
use crate::transfer::ObjectStore;
use crossbeam_channel::{unbounded, Receiver};
use std::fs::{self, File};
use std::path::PathBuf;
use std::time::Duration;

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UploadState {
    Idle,
    LinkUp,
    BrokerReady,
    AwaitingUrl,
    Transferring,
    Done,
    Failed,
}

impl UploadState {
    pub fn label(&self) -> &'static str {
        match self {
            UploadState::Idle => "Idle",
            UploadState::LinkUp => "Connecting link...",
            UploadState::BrokerReady => "Connecting broker...",
            UploadState::AwaitingUrl => "Requesting URL...",
            UploadState::Transferring => "Uploading...",
            UploadState::Done => "Complete",
            UploadState::Failed => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Failed)
    }

    /// An attempt is running (neither idle nor terminal)
    pub fn is_active(&self) -> bool {
        !matches!(self, UploadState::Idle) && !self.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    File(PathBuf),
    /// No storage: announce this size and skip the transfer
    Simulated { size: u64 },
}

/// What one attempt hands off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub session_id: String,
    pub timestamp: u32,
    pub source: UploadSource,
}

impl UploadTarget {
    /// Session id is the file stem, e.g. `session_1700000000`
    pub fn file(path: PathBuf, timestamp: u32) -> Self {
        let session_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            session_id,
            timestamp,
            source: UploadSource::File(path),
        }
    }

    pub fn simulated(session_id: String, timestamp: u32, size: u64) -> Self {
        Self {
            session_id,
            timestamp,
            source: UploadSource::Simulated { size },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandoffSettings {
    pub device_id: String,
    pub request_topic: String,
    pub response_topic: String,
    pub link_attempts: u32,
    pub link_poll: Duration,
    pub connect_attempts: u32,
    pub connect_retry: Duration,
    pub connack_timeout: Duration,
    pub confirm_polls: u32,
    pub confirm_poll: Duration,
    pub response_timeout: Duration,
    pub progress_interval: Duration,
}

impl HandoffSettings {
    pub fn from_config(config: &Config) -> Self {
        let broker = &config.broker;
        Self {
            device_id: config.device.id.clone(),
            request_topic: broker.request_topic.clone(),
            response_topic: broker.response_topic(&config.device.id),
            link_attempts: config.network.link_attempts,
            link_poll: Duration::from_millis(config.network.link_poll_ms),
            connect_attempts: broker.connect_attempts,
            connect_retry: Duration::from_millis(broker.connect_retry_ms),
            connack_timeout: Duration::from_millis(broker.connack_timeout_ms),
            confirm_polls: broker.confirm_polls,
            confirm_poll: Duration::from_millis(broker.confirm_poll_ms),
            response_timeout: Duration::from_secs(broker.response_timeout_secs),
            progress_interval: Duration::from_millis(config.transfer.progress_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerStep {
    Connect,
    AwaitingConnAck { deadline: Duration },
    Confirming { polls: u32 },
}

/// Per-attempt context, dropped when the attempt is cancelled
#[derive(Debug)]
struct UploadAttempt {
    target: UploadTarget,
    url: String,
    link_started: bool,
    link_polls: u32,
    broker_attempts: u32,
    broker_step: BrokerStep,
    last_broker_error: Option<String>,
    /// Earliest time the current stage may act again
    next_action_at: Duration,
    /// When the request was published
    wait_anchor: Duration,
    last_wait_log: Duration,
    request_outstanding: bool,
    bytes_sent: u64,
}

impl UploadAttempt {
    fn new(target: UploadTarget, now: Duration) -> Self {
        Self {
            target,
            url: String::new(),
            link_started: false,
            link_polls: 0,
            broker_attempts: 0,
            broker_step: BrokerStep::Connect,
            last_broker_error: None,
            next_action_at: now,
            wait_anchor: now,
            last_wait_log: now,
            request_outstanding: false,
            bytes_sent: 0,
        }
    }
}

pub struct UploadHandoff {
    clock: SharedClock,
    settings: HandoffSettings,
    link: Box<dyn Link>,
    broker: Box<dyn BrokerClient>,
    store: Box<dyn ObjectStore>,
    inbox: Receiver<InboundMessage>,
    state: UploadState,
    attempt: Option<UploadAttempt>,
    last_error: Option<HandoffError>,
}

impl UploadHandoff {
    pub fn new(
        settings: HandoffSettings,
        clock: SharedClock,
        link: Box<dyn Link>,
        mut broker: Box<dyn BrokerClient>,
        store: Box<dyn ObjectStore>,
    ) -> Self {
        let (sink, inbox) = unbounded();
        broker.set_message_handler(sink);

        Self {
            clock,
            settings,
            link,
            broker,
            store,
            inbox,
            state: UploadState::Idle,
            attempt: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Begin a new attempt for `target`
    pub fn start(&mut self, target: UploadTarget) -> Result<(), AttemptInProgress> {
        if self.state.is_active() {
            return Err(AttemptInProgress);
        }

        let stale = self.inbox.try_iter().count();
        if stale > 0 {
            log::debug!("Dropped {} stale broker deliveries", stale);
        }

        log::info!("Starting upload of {}", target.session_id);
        self.last_error = None;
        self.attempt = Some(UploadAttempt::new(target, self.clock.now()));
        self.state = UploadState::LinkUp;
        Ok(())
    }

    /// Advance the current stage by at most one step
    pub fn tick(&mut self) {
        let now = self.clock.now();
        match self.state {
            UploadState::Idle | UploadState::Done | UploadState::Failed => {}
            UploadState::LinkUp => self.tick_link(now),
            UploadState::BrokerReady => self.tick_broker(now),
            UploadState::AwaitingUrl => self.tick_awaiting(now),
            UploadState::Transferring => self.tick_transfer(),
        }
    }

    /// Abandon an active attempt. The file is left on storage.
    pub fn cancel(&mut self) {
        if !self.state.is_active() {
            return;
        }
        log::info!("Upload cancelled in state {:?}", self.state);
        self.broker.disconnect();
        self.link.shutdown();
        self.attempt = None;
        self.state = UploadState::Idle;
    }

    /// Tear down the network link after the attempt is over
    pub fn release_link(&mut self) {
        self.broker.disconnect();
        self.link.shutdown();
    }

    fn tick_link(&mut self, now: Duration) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        if !attempt.link_started {
            attempt.link_started = true;
            if let Err(e) = self.link.begin() {
                self.fail(HandoffError::Link(e));
                return;
            }
        }

        if now < attempt.next_action_at {
            return;
        }

        if self.link.is_up() {
            log::info!("Link up after {} polls", attempt.link_polls);
            attempt.broker_step = BrokerStep::Connect;
            attempt.next_action_at = now;
            self.state = UploadState::BrokerReady;
            return;
        }

        attempt.link_polls += 1;
        if attempt.link_polls >= self.settings.link_attempts {
            let attempts = attempt.link_polls;
            self.fail(HandoffError::Link(LinkError::NotConnected { attempts }));
        } else {
            attempt.next_action_at = now + self.settings.link_poll;
        }
    }

    fn tick_broker(&mut self, now: Duration) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if now < attempt.next_action_at {
            return;
        }

        match attempt.broker_step {
            BrokerStep::Connect => {
                attempt.broker_attempts += 1;
                log::info!(
                    "Connecting to broker (attempt {}/{})",
                    attempt.broker_attempts,
                    self.settings.connect_attempts
                );
                match self.broker.connect() {
                    Ok(()) => {
                        attempt.broker_step = BrokerStep::AwaitingConnAck {
                            deadline: now + self.settings.connack_timeout,
                        };
                        attempt.next_action_at = now;
                    }
                    Err(e) => self.retry_broker(now, e.to_string()),
                }
            }
            BrokerStep::AwaitingConnAck { deadline } => {
                if let Err(e) = self.broker.poll() {
                    self.retry_broker(now, e.to_string());
                    return;
                }
                if self.broker.is_connected() {
                    match self.broker.subscribe(&self.settings.response_topic) {
                        Ok(()) => {
                            log::info!("Subscribed to {} (at-least-once)", self.settings.response_topic);
                            attempt.broker_step = BrokerStep::Confirming { polls: 0 };
                        }
                        Err(e) => self.retry_broker(now, e.to_string()),
                    }
                } else if now >= deadline {
                    self.retry_broker(now, "timed out waiting for CONNACK".into());
                }
            }
            BrokerStep::Confirming { polls } => {
                if let Err(e) = self.broker.poll() {
                    log::warn!("{}", e);
                }

                if !self.broker.is_connected() {
                    self.retry_broker(now, "connection lost during subscribe".into());
                    return;
                }

                if self.broker.subscription_confirmed() || polls + 1 >= self.settings.confirm_polls {
                    self.publish_request(now);
                } else {
                    attempt.broker_step = BrokerStep::Confirming { polls: polls + 1 };
                    attempt.next_action_at = now + self.settings.confirm_poll;
                }
            }
        }
    }

    /// Close out one failed connect attempt; fails the hand-off once the
    /// budget is spent, otherwise schedules the next `connect()`.
    fn retry_broker(&mut self, now: Duration, reason: String) {
        log::warn!("Broker: {}", reason);
        self.broker.disconnect();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.last_broker_error = Some(reason);
        attempt.broker_step = BrokerStep::Connect;
        attempt.next_action_at = now + self.settings.connect_retry;

        if attempt.broker_attempts >= self.settings.connect_attempts {
            let reason = format!(
                "Broker connection failed after {} attempts: {}",
                attempt.broker_attempts,
                attempt.last_broker_error.as_deref().unwrap_or("unknown error")
            );
            self.fail(HandoffError::Broker(reason));
        }
    }

    fn publish_request(&mut self, now: Duration) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        let file_size = match &attempt.target.source {
            UploadSource::File(path) => match fs::metadata(path) {
                Ok(metadata) => metadata.len(),
                Err(source) => {
                    let err = StorageError::Read {
                        path: path.clone(),
                        source,
                    };
                    self.fail(HandoffError::Storage(err.to_string()));
                    return;
                }
            },
            UploadSource::Simulated { size } => {
                log::info!("No container on storage, announcing simulated size {}", size);
                *size
            }
        };

        let request = UploadRequest::new(
            &self.settings.device_id,
            &attempt.target.session_id,
            attempt.target.timestamp,
            file_size,
        );
        log::info!(
            "Publishing upload request to {} ({} bytes announced)",
            self.settings.request_topic,
            file_size
        );

        if let Err(e) = self.broker.poll() {
            log::debug!("Poll before publish: {}", e);
        }
        let published = request
            .to_json()
            .and_then(|payload| self.broker.publish(&self.settings.request_topic, &payload));

        match published {
            Ok(()) => {
                attempt.request_outstanding = true;
                attempt.wait_anchor = now;
                attempt.last_wait_log = now;
                log::info!(
                    "Waiting for upload URL on {} ({}s timeout)",
                    self.settings.response_topic,
                    self.settings.response_timeout.as_secs()
                );
                self.state = UploadState::AwaitingUrl;
            }
            Err(e) => self.fail(HandoffError::PublishFailed(e.to_string())),
        }
    }

    fn tick_awaiting(&mut self, now: Duration) {
        if let Err(e) = self.broker.poll() {
            log::debug!("{}", e);
        }

        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        let waited = now.saturating_sub(attempt.wait_anchor);
        if waited >= self.settings.response_timeout {
            attempt.request_outstanding = false;
            let timeout = self.settings.response_timeout;
            self.fail(HandoffError::Timeout(timeout));
            return;
        }

        while let Ok(message) = self.inbox.try_recv() {
            if message.topic != self.settings.response_topic {
                log::warn!(
                    "Ignoring delivery on {} (expected {})",
                    message.topic,
                    self.settings.response_topic
                );
                continue;
            }
            if !attempt.request_outstanding {
                log::warn!("Ignoring response with no request outstanding");
                continue;
            }
            match UploadResponse::parse(&message.payload) {
                Ok(response) => {
                    log::info!(
                        "Upload URL received after {:.1}s: {}...",
                        waited.as_secs_f32(),
                        response.upload_url.chars().take(50).collect::<String>()
                    );
                    attempt.url = response.upload_url;
                    attempt.request_outstanding = false;
                    self.state = UploadState::Transferring;
                    return;
                }
                Err(reason) => log::warn!("Ignoring response: {}", reason),
            }
        }

        if now.saturating_sub(attempt.last_wait_log) >= WAIT_LOG_INTERVAL {
            attempt.last_wait_log = now;
            log::info!("Waiting for upload URL... ({}s)", waited.as_secs());
        }
    }

    fn tick_transfer(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        let path = match &attempt.target.source {
            UploadSource::File(path) => path.clone(),
            UploadSource::Simulated { .. } => {
                log::info!("No container to transfer; broker exchange completed");
                self.state = UploadState::Done;
                self.broker.disconnect();
                return;
            }
        };

        let opened = File::open(&path).and_then(|file| {
            let len = file.metadata()?.len();
            Ok((file, len))
        });
        let (mut file, total) = match opened {
            Ok(opened) => opened,
            Err(source) => {
                let err = StorageError::Read { path, source };
                self.fail(HandoffError::Storage(err.to_string()));
                return;
            }
        };

        log::info!("Uploading {} ({} KB)", path.display(), total / 1024);

        let url = attempt.url.clone();
        let clock = self.clock.clone();
        let interval = self.settings.progress_interval;
        let mut last_report = clock.now();
        let bytes_sent = &mut attempt.bytes_sent;
        *bytes_sent = 0;
        let mut on_progress = |sent: u64| {
            *bytes_sent = sent;
            let now = clock.now();
            if now.saturating_sub(last_report) >= interval {
                last_report = now;
                log::info!(
                    "Upload progress {:.1}% ({}/{} KB)",
                    sent as f64 * 100.0 / total.max(1) as f64,
                    sent / 1024,
                    total / 1024
                );
            }
        };

        let result = self.store.put(&url, &mut file, total, &mut on_progress);
        drop(file);

        match result {
            Ok(status @ (200 | 204)) => {
                log::info!("Upload accepted (HTTP {})", status);
                match fs::remove_file(&path) {
                    Ok(()) => log::info!("Removed {} from storage", path.display()),
                    Err(source) => log::error!("{}", StorageError::Remove { path, source }),
                }
                self.state = UploadState::Done;
                self.broker.disconnect();
            }
            Ok(status) => self.fail(HandoffError::Upload { status }),
            Err(e) => {
                let reason = format!("{} ({} of {} bytes sent)", e.0, attempt.bytes_sent, total);
                self.fail(HandoffError::Transport(reason));
            }
        }
    }

    fn fail(&mut self, error: HandoffError) {
        log::error!("Upload failed in state {:?}: {}", self.state, error);
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.request_outstanding = false;
        }
        self.last_error = Some(error);
        self.state = UploadState::Failed;
        self.broker.disconnect();
    }

    /// Coarse, monotonically increasing progress for display.
    ///
    /// The PUT streams to completion inside a single tick, so between ticks
    /// `Transferring` always reads 0.5; byte-level progress goes to the log.
    pub fn progress(&self) -> f32 {
        match self.state {
            UploadState::Idle | UploadState::Failed => 0.0,
            UploadState::LinkUp => 0.1,
            UploadState::BrokerReady => 0.3,
            UploadState::AwaitingUrl | UploadState::Transferring => 0.5,
            UploadState::Done => 1.0,
        }
    }

    /// Presigned URL, empty until a response was accepted
    pub fn url(&self) -> &str {
        self.attempt.as_ref().map(|a| a.url.as_str()).unwrap_or("")
    }

    pub fn last_error(&self) -> Option<&HandoffError> {
        self.last_error.as_ref()
    }

    pub fn last_error_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    pub fn status_line(&self) -> String {
        match self.state {
            UploadState::Failed => format!("Error: {}", self.last_error_message()),
            state => state.label().to_string(),
        }
    }
}
