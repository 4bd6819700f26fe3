//! Object-store upload collaborator: one streamed PUT to a presigned URL.

use crate::error::TransferError;
use std::io::{self, Read};
use std::time::Duration;

pub trait ObjectStore: Send {
    /// Stream `content_length` bytes from `body` to `url`.
    ///
    /// Returns the HTTP status whatever its class; `Err` only when the
    /// transport failed before a status was received. `progress` is called
    /// with the running byte count.
    fn put(
        &mut self,
        url: &str,
        body: &mut dyn Read,
        content_length: u64,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u16, TransferError>;
}

/// Counts bytes as the HTTP client pulls them
pub struct ProgressReader<'a> {
    inner: &'a mut dyn Read,
    sent: u64,
    on_progress: &'a mut dyn FnMut(u64),
}

impl<'a> ProgressReader<'a> {
    pub fn new(inner: &'a mut dyn Read, on_progress: &'a mut dyn FnMut(u64)) -> Self {
        Self {
            inner,
            sent: 0,
            on_progress,
        }
    }
}

impl Read for ProgressReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sent += n as u64;
            (self.on_progress)(self.sent);
        }
        Ok(n)
    }
}

pub struct HttpObjectStore {
    agent: ureq::Agent,
}

impl HttpObjectStore {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self { agent }
    }
}

impl ObjectStore for HttpObjectStore {
    fn put(
        &mut self,
        url: &str,
        body: &mut dyn Read,
        content_length: u64,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u16, TransferError> {
        let reader = ProgressReader::new(body, progress);
        let result = self
            .agent
            .put(url)
            .set("Content-Type", "application/octet-stream")
            .set("Content-Length", &content_length.to_string())
            .send(reader);

        match result {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                log::warn!("Object store answered {}: {}", code, detail.trim());
                Ok(code)
            }
            Err(ureq::Error::Transport(transport)) => Err(TransferError(transport.to_string())),
        }
    }
}
