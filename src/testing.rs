//! In-memory collaborators for unit tests.
//!
//! Each fake is a cheap handle over shared state: hand one clone to the code
//! under test (boxed) and keep the other to script behavior and inspect calls.

use crate::broker::{BrokerClient, InboundMessage, MessageSink};
use crate::container::{ContainerFile, HEADER_SIZE};
use crate::error::{BrokerError, LinkError, TransferError};
use crate::link::Link;
use crate::transfer::ObjectStore;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct LinkState {
    polls_until_up: Option<u32>,
    polls: u32,
    begins: u32,
    shutdowns: u32,
    begin_error: Option<LinkError>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    state: Arc<Mutex<LinkState>>,
}

impl FakeLink {
    /// Reports down for `polls` checks, then up
    pub fn up_after(polls: u32) -> Self {
        let link = Self::default();
        link.state.lock().unwrap().polls_until_up = Some(polls);
        link
    }

    pub fn set_never_up(&self) {
        self.state.lock().unwrap().polls_until_up = None;
    }

    pub fn fail_begin(&self, error: LinkError) {
        self.state.lock().unwrap().begin_error = Some(error);
    }

    pub fn polls(&self) -> u32 {
        self.state.lock().unwrap().polls
    }

    pub fn begins(&self) -> u32 {
        self.state.lock().unwrap().begins
    }

    pub fn shutdowns(&self) -> u32 {
        self.state.lock().unwrap().shutdowns
    }
}

impl Link for FakeLink {
    fn begin(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        state.begins += 1;
        state.polls = 0;
        match state.begin_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_up(&mut self) -> bool {
        let mut state = self.state.lock().unwrap();
        let up = matches!(state.polls_until_up, Some(n) if state.polls >= n);
        state.polls += 1;
        up
    }

    fn shutdown(&mut self) {
        self.state.lock().unwrap().shutdowns += 1;
    }
}

#[derive(Debug)]
struct BrokerState {
    sink: Option<MessageSink>,
    session_open: bool,
    connected: bool,
    withhold_connack: bool,
    confirms: bool,
    confirmed: bool,
    connect_calls: u32,
    poll_calls: u32,
    connect_failures: VecDeque<BrokerError>,
    publish_failure: Option<BrokerError>,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    pending: VecDeque<InboundMessage>,
    on_publish: Vec<InboundMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            sink: None,
            session_open: false,
            connected: false,
            withhold_connack: false,
            confirms: true,
            confirmed: false,
            connect_calls: 0,
            poll_calls: 0,
            connect_failures: VecDeque::new(),
            publish_failure: None,
            subscriptions: Vec::new(),
            published: Vec::new(),
            pending: VecDeque::new(),
            on_publish: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a delivery for the next `poll` while connected
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.state.lock().unwrap().pending.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Queue a delivery as soon as something is published
    pub fn deliver_on_publish(&self, topic: &str, payload: &[u8]) {
        self.state.lock().unwrap().on_publish.push(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Push queued deliveries into the sink even while disconnected
    pub fn pump(&self) {
        let mut state = self.state.lock().unwrap();
        Self::flush_pending(&mut state);
    }

    /// Refuse the next session when its CONNACK would arrive
    pub fn fail_next_connect(&self, error: BrokerError) {
        self.state.lock().unwrap().connect_failures.push_back(error);
    }

    pub fn fail_publish(&self, error: BrokerError) {
        self.state.lock().unwrap().publish_failure = Some(error);
    }

    pub fn set_confirms(&self, confirms: bool) {
        self.state.lock().unwrap().confirms = confirms;
    }

    /// Sessions open but the broker never answers the CONNECT
    pub fn withhold_connack(&self) {
        self.state.lock().unwrap().withhold_connack = true;
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self) {
        let mut state = self.state.lock().unwrap();
        state.session_open = false;
        state.connected = false;
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().unwrap().connect_calls
    }

    pub fn poll_calls(&self) -> u32 {
        self.state.lock().unwrap().poll_calls
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    fn flush_pending(state: &mut BrokerState) {
        while let Some(message) = state.pending.pop_front() {
            if let Some(sink) = &state.sink {
                let _ = sink.send(message);
            }
        }
    }
}

impl BrokerClient for FakeBroker {
    fn set_message_handler(&mut self, sink: MessageSink) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    fn connect(&mut self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        state.session_open = true;
        state.connected = false;
        state.confirmed = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.subscriptions.push(topic.to_string());
        state.confirmed = false;
        Ok(())
    }

    fn subscription_confirmed(&self) -> bool {
        self.state.lock().unwrap().confirmed
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if let Some(e) = state.publish_failure.clone() {
            return Err(e);
        }
        state.published.push((topic.to_string(), payload.to_vec()));
        let replies: Vec<_> = state.on_publish.drain(..).collect();
        state.pending.extend(replies);
        Ok(())
    }

    fn poll(&mut self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.poll_calls += 1;
        if !state.session_open {
            return Err(BrokerError::NotConnected);
        }
        if !state.connected {
            if let Some(e) = state.connect_failures.pop_front() {
                state.session_open = false;
                return Err(e);
            }
            if state.withhold_connack {
                return Ok(());
            }
            state.connected = true;
        }
        if state.confirms && !state.subscriptions.is_empty() {
            state.confirmed = true;
        }
        Self::flush_pending(&mut state);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.session_open = false;
        state.connected = false;
        state.confirmed = false;
    }
}

#[derive(Debug, Clone)]
pub struct PutRecord {
    pub url: String,
    pub content_length: u64,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct StoreState {
    answer: Result<u16, TransferError>,
    /// Stop reading the body after this many bytes
    cut_after: Option<u64>,
    requests: Vec<PutRecord>,
}

#[derive(Debug, Clone)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn answering(answer: Result<u16, TransferError>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                answer,
                cut_after: None,
                requests: Vec::new(),
            })),
        }
    }

    pub fn set_answer(&self, answer: Result<u16, TransferError>) {
        self.state.lock().unwrap().answer = answer;
    }

    /// Read only the first `bytes` of the body before answering
    pub fn cut_after(&self, bytes: u64) {
        self.state.lock().unwrap().cut_after = Some(bytes);
    }

    pub fn requests(&self) -> Vec<PutRecord> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl ObjectStore for FakeStore {
    fn put(
        &mut self,
        url: &str,
        body: &mut dyn Read,
        content_length: u64,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u16, TransferError> {
        let limit = self.state.lock().unwrap().cut_after.unwrap_or(u64::MAX);
        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        while (received.len() as u64) < limit {
            let n = body.read(&mut chunk).map_err(|e| TransferError(e.to_string()))?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
            progress(received.len() as u64);
        }

        let mut state = self.state.lock().unwrap();
        state.requests.push(PutRecord {
            url: url.to_string(),
            content_length,
            body: received,
        });
        state.answer.clone()
    }
}

/// Takes the container header, then reports a full disk on every write
#[derive(Debug, Default)]
pub struct FullDisk {
    written: u64,
}

impl Write for FullDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= HEADER_SIZE as u64 {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FullDisk {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Ok(0)
    }
}

impl ContainerFile for FullDisk {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn open_full_disk(_path: &Path) -> io::Result<Box<dyn ContainerFile>> {
    Ok(Box::new(FullDisk::default()))
}

/// A real file whose first record flush silently loses its last record
#[derive(Debug)]
pub struct TornFile {
    inner: File,
    writes: u32,
}

/// Bytes the torn flush drops, one 6-byte record
pub const TORN_BYTES: usize = 6;

impl Write for TornFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes += 1;
        // Write 1 is the header at open, write 2 the first record flush
        if self.writes == 2 && buf.len() > TORN_BYTES {
            self.inner.write_all(&buf[..buf.len() - TORN_BYTES])?;
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for TornFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl ContainerFile for TornFile {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync_all()
    }
}

pub fn open_torn_file(path: &Path) -> io::Result<Box<dyn ContainerFile>> {
    let inner = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    Ok(Box::new(TornFile { inner, writes: 0 }))
}
