//! # Error Types Module
//!
//! Centralized error handling for the recorder and upload pipeline.
//! One enum per concern, each with a human-readable `Display` that doubles as
//! the "last error" string shown by the status line.
//!
//! ## Error Types
//! - `ConfigError`: Configuration file I/O, parsing and validation
//! - `StorageError`: Container file create/write/seek/read/remove failures
//! - `IntegrityError`: Finalized file size disagrees with the header counts
//! - `CaptureError`: Capture session start/run failures
//! - `LinkError` / `BrokerError` / `TransferError`: collaborator failures
//! - `HandoffError`: What ended an upload attempt in `Failed`
//!
//! ## Usage
//! ```rust
//! // Container writer surfaces StorageError
//! pub fn open(path: &Path, header: ContainerHeader, ..) -> Result<Self, StorageError> { ... }
//!
//! // State machines never return errors from tick(); they record one
//! self.fail(HandoffError::Timeout(self.response_timeout));
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(io::Error),
    /// Failed to write config file
    WriteFailed(io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// Config parsed but holds values the pipeline cannot run with
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
            ConfigError::Invalid(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Errors raised by local storage (the container file and its directory)
#[derive(Debug)]
pub enum StorageError {
    /// Storage directory missing and could not be created
    Unavailable { path: PathBuf, source: io::Error },
    /// Container file could not be created
    Create { path: PathBuf, source: io::Error },
    /// Buffered bytes could not be written
    Write { path: PathBuf, source: io::Error },
    /// Seeking back to the header failed
    Seek { path: PathBuf, source: io::Error },
    /// File could not be opened or read back
    Read { path: PathBuf, source: io::Error },
    /// Uploaded file could not be deleted
    Remove { path: PathBuf, source: io::Error },
    /// File exists but does not start with a valid container header
    BadHeader { path: PathBuf },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable { path, source } => {
                write!(f, "Storage unavailable at {}: {}", path.display(), source)
            }
            StorageError::Create { path, source } => {
                write!(f, "Cannot create file {}: {}", path.display(), source)
            }
            StorageError::Write { path, source } => {
                write!(f, "Write to {} failed: {}", path.display(), source)
            }
            StorageError::Seek { path, source } => {
                write!(f, "Seek in {} failed: {}", path.display(), source)
            }
            StorageError::Read { path, source } => {
                write!(f, "Cannot read file {}: {}", path.display(), source)
            }
            StorageError::Remove { path, source } => {
                write!(f, "Cannot remove file {}: {}", path.display(), source)
            }
            StorageError::BadHeader { path } => {
                write!(f, "{} is not a session container", path.display())
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Unavailable { source, .. }
            | StorageError::Create { source, .. }
            | StorageError::Write { source, .. }
            | StorageError::Seek { source, .. }
            | StorageError::Read { source, .. }
            | StorageError::Remove { source, .. } => Some(source),
            StorageError::BadHeader { .. } => None,
        }
    }
}

/// Finalized container size differs from what the header counts imply.
///
/// Reported, never fatal: the coordinator still attempts the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityError {
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Container size mismatch: expected {} bytes, found {} bytes",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for IntegrityError {}

/// Errors that can occur while starting or running a capture session
#[derive(Debug)]
pub enum CaptureError {
    /// A session is already capturing
    Busy,
    /// The container file failed
    Storage(StorageError),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Busy => write!(f, "A capture session is already in progress"),
            CaptureError::Storage(e) => write!(f, "Capture storage error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Busy => None,
            CaptureError::Storage(e) => Some(e),
        }
    }
}

impl From<StorageError> for CaptureError {
    fn from(e: StorageError) -> Self {
        CaptureError::Storage(e)
    }
}

/// Network link could not be brought up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Link never reported up within the attempt budget
    NotConnected { attempts: u32 },
    /// The link driver refused to start
    Driver(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::NotConnected { attempts } => {
                write!(f, "Link connection failed after {} attempts", attempts)
            }
            LinkError::Driver(msg) => write!(f, "Link driver error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// Errors reported by the message broker client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connect attempt was refused or timed out
    Connect(String),
    /// Subscribe request could not be queued
    Subscribe(String),
    /// Publish request could not be queued
    Publish(String),
    /// Connection dropped while servicing the client
    ConnectionLost(String),
    /// Client used before `connect`
    NotConnected,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Connect(msg) => write!(f, "Broker connect failed: {}", msg),
            BrokerError::Subscribe(msg) => write!(f, "Broker subscribe failed: {}", msg),
            BrokerError::Publish(msg) => write!(f, "Broker publish failed: {}", msg),
            BrokerError::ConnectionLost(msg) => write!(f, "Broker connection lost: {}", msg),
            BrokerError::NotConnected => write!(f, "Broker client is not connected"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Transport-level failure of the object upload (no HTTP status available)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError(pub String);

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transfer failed: {}", self.0)
    }
}

impl std::error::Error for TransferError {}

/// `start()` called while an attempt is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInProgress;

impl fmt::Display for AttemptInProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "An upload attempt is already in progress")
    }
}

impl std::error::Error for AttemptInProgress {}

/// Why an upload attempt ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffError {
    Link(LinkError),
    /// Broker connect/subscribe gave up after the retry budget
    Broker(String),
    /// The upload request could not be published; no wait was started
    PublishFailed(String),
    /// No valid response arrived in time
    Timeout(Duration),
    /// Object store answered with a non-success status
    Upload { status: u16 },
    /// Transfer broke before a status was received
    Transport(String),
    /// Local file could not be opened or sized
    Storage(String),
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::Link(e) => write!(f, "{}", e),
            HandoffError::Broker(msg) => write!(f, "{}", msg),
            HandoffError::PublishFailed(msg) => write!(f, "Upload request publish failed: {}", msg),
            HandoffError::Timeout(after) => {
                write!(f, "Timeout waiting for upload URL ({}s)", after.as_secs())
            }
            HandoffError::Upload { status } => write!(f, "Upload failed: HTTP {}", status),
            HandoffError::Transport(msg) => write!(f, "Upload transport error: {}", msg),
            HandoffError::Storage(msg) => write!(f, "Upload source unavailable: {}", msg),
        }
    }
}

impl std::error::Error for HandoffError {}
