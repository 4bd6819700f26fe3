//! # Broker Module
//!
//! Request/response exchange over a publish/subscribe broker.
//!
//! ## Key Types
//! - `BrokerClient`: The narrow client interface the hand-off drives
//! - `InboundMessage`: A delivery handed to the registered message sink
//! - `UploadRequest` / `UploadResponse`: Typed wire payloads
//! - `MqttBroker`: `rumqttc` implementation with optional mutual TLS
//!
//! ## Session lifecycle
//! `connect()` starts a session and returns at once. The `rumqttc` event loop
//! runs on a dedicated thread and feeds a channel; `poll()` drains it without
//! blocking, which is where CONNACK, SUBACK and deliveries are observed.
//!
//! ## Message delivery
//! The client is given a `crossbeam_channel::Sender` once. Every publish it
//! receives while being polled is forwarded there; matching a delivery against
//! the outstanding request is the state machine's job, not the client's.

use crate::config::Config;
use crate::error::{BrokerError, ConfigError};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use rumqttc::{Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, QoS, Transport};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_PACKET_SIZE: usize = 4096;
const EVENTS_PER_POLL: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type MessageSink = Sender<InboundMessage>;

pub trait BrokerClient: Send {
    /// Register where deliveries go. Called once, before `connect`.
    fn set_message_handler(&mut self, sink: MessageSink);

    /// Start a session. Returns without waiting for the broker; the session
    /// counts as connected once a later `poll` has seen the CONNACK.
    fn connect(&mut self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Subscribe with at-least-once delivery
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Broker acknowledged the last subscription
    fn subscription_confirmed(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Pick up whatever the session produced since the last call and dispatch
    /// deliveries. Never waits. Must be called on every tick while a session
    /// is open; a refused or failed CONNACK surfaces here as `Connect`.
    fn poll(&mut self) -> Result<(), BrokerError>;

    fn disconnect(&mut self);
}

/// Published on the request channel once the broker is ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub device_id: String,
    pub session_id: String,
    /// Capture start, seconds, rendered as a decimal string
    pub timestamp: String,
    pub file_size: u64,
    pub ready_for_upload: bool,
}

impl UploadRequest {
    pub fn new(device_id: &str, session_id: &str, timestamp: u32, file_size: u64) -> Self {
        Self {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            timestamp: timestamp.to_string(),
            file_size,
            ready_for_upload: true,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Publish(e.to_string()))
    }
}

/// Delivered on the per-device response channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadResponse {
    pub upload_url: String,
}

impl UploadResponse {
    /// Parse and validate a response; anything incomplete is rejected whole
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        let response: UploadResponse =
            serde_json::from_slice(payload).map_err(|e| format!("bad response payload: {}", e))?;
        if response.upload_url.trim().is_empty() {
            return Err("response carries an empty upload_url".to_string());
        }
        Ok(response)
    }
}

/// What the event thread hands back to `poll`
type SessionEvent = Result<Event, String>;

/// One broker session: the request handle plus the thread draining its events
struct Session {
    client: Client,
    events: Receiver<SessionEvent>,
    should_stop: Arc<AtomicBool>,
}

/// `rumqttc` client whose event loop runs on its own thread.
///
/// `connect()` only starts a session; CONNACK, SUBACK and deliveries are
/// picked up by `poll()` without waiting, so no call here blocks a tick.
pub struct MqttBroker {
    options: MqttOptions,
    session: Option<Session>,
    sink: Option<MessageSink>,
    connected: bool,
    confirmed: bool,
}

impl MqttBroker {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let broker = &config.broker;
        let mut options = MqttOptions::new(config.device.id.clone(), broker.endpoint.clone(), broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        match &config.tls.ca_path {
            Some(ca_path) => {
                let ca = fs::read(ca_path).map_err(ConfigError::ReadFailed)?;
                let client_auth = match (&config.tls.cert_path, &config.tls.key_path) {
                    (Some(cert), Some(key)) => Some((
                        fs::read(cert).map_err(ConfigError::ReadFailed)?,
                        fs::read(key).map_err(ConfigError::ReadFailed)?,
                    )),
                    (None, None) => None,
                    _ => {
                        return Err(ConfigError::Invalid(
                            "tls.cert_path and tls.key_path must be given together".into(),
                        ))
                    }
                };
                options.set_transport(Transport::tls(ca, client_auth, None));
            }
            None => {
                if let Some(warning) = plaintext_warning(config) {
                    log::warn!("{}", warning);
                }
            }
        }

        Ok(Self {
            options,
            session: None,
            sink: None,
            connected: false,
            confirmed: false,
        })
    }

    /// Returns an error once the broker refused or dropped the session
    fn handle_event(&mut self, event: Event) -> Result<(), BrokerError> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(BrokerError::Connect(format!("refused: {:?}", ack.code)));
                }
                log::info!("Connected to broker as {}", self.options.client_id());
                self.connected = true;
            }
            Event::Incoming(Packet::Publish(publish)) => {
                log::debug!("Delivery on {} ({} bytes)", publish.topic, publish.payload.len());
                if let Some(sink) = &self.sink {
                    let _ = sink.send(InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    });
                }
            }
            Event::Incoming(Packet::SubAck(_)) => {
                self.confirmed = true;
            }
            Event::Incoming(Packet::Disconnect) => {
                self.connected = false;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Warning for a broker session that will run without TLS
pub fn plaintext_warning(config: &Config) -> Option<String> {
    if config.tls.ca_path.is_some() {
        return None;
    }
    Some(format!(
        "No tls.ca_path configured: MQTT to {}:{} will be plaintext",
        config.broker.endpoint, config.broker.port
    ))
}

/// Forward connection events until the session ends or is abandoned
fn pump_events(mut connection: Connection, events: Sender<SessionEvent>, should_stop: Arc<AtomicBool>) {
    for notification in connection.iter() {
        if should_stop.load(Ordering::Relaxed) {
            break;
        }
        match notification {
            Ok(event) => {
                if events.send(Ok(event)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(Err(e.to_string()));
                break;
            }
        }
    }
    log::debug!("Broker event thread exiting");
}

impl BrokerClient for MqttBroker {
    fn set_message_handler(&mut self, sink: MessageSink) {
        self.sink = Some(sink);
    }

    fn connect(&mut self) -> Result<(), BrokerError> {
        self.disconnect();

        let (client, connection) = Client::new(self.options.clone(), 16);
        let (event_sender, events) = unbounded();
        let should_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = should_stop.clone();

        thread::Builder::new()
            .name("mqtt-events".into())
            .spawn(move || pump_events(connection, event_sender, thread_stop))
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        log::debug!("Broker session started for {}", self.options.client_id());
        self.session = Some(Session {
            client,
            events,
            should_stop,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        self.confirmed = false;
        session
            .client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| BrokerError::Subscribe(e.to_string()))
    }

    fn subscription_confirmed(&self) -> bool {
        self.confirmed
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        session
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    fn poll(&mut self) -> Result<(), BrokerError> {
        let mut events = Vec::new();
        let mut failure = None;

        {
            let Some(session) = self.session.as_ref() else {
                return Err(BrokerError::NotConnected);
            };
            for _ in 0..EVENTS_PER_POLL {
                match session.events.try_recv() {
                    Ok(Ok(event)) => events.push(event),
                    Ok(Err(reason)) => {
                        failure = Some(reason);
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        failure = Some("event loop stopped".to_string());
                        break;
                    }
                }
            }
        }

        for event in events {
            if let Err(e) = self.handle_event(event) {
                self.disconnect();
                return Err(e);
            }
        }

        match failure {
            Some(reason) => {
                let was_connected = self.connected;
                self.disconnect();
                if was_connected {
                    Err(BrokerError::ConnectionLost(reason))
                } else {
                    Err(BrokerError::Connect(reason))
                }
            }
            None => Ok(()),
        }
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.should_stop.store(true, Ordering::Relaxed);
            let _ = session.client.try_disconnect();
            log::debug!("Broker session closed");
        }
        self.connected = false;
        self.confirmed = false;
    }
}
