//! Capability traits for the transports a router drives
//!
//! The dispatch engine and supervisor only see these seams; `midi` and
//! `mqtt` provide the real implementations and the test utilities provide
//! in-memory ones.

use async_trait::async_trait;
use miditrig_core::{MqttConfig, NoteEvent, NoteMessage};
use regex_lite::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::Result;

/// An open MIDI output port
///
/// Implementations must tolerate concurrent senders.
#[async_trait]
pub trait MidiOutputPort: Send + Sync {
    /// Port name as enumerated by the driver
    fn name(&self) -> &str;

    async fn send(&self, message: NoteMessage) -> Result<()>;
}

/// Stops an active input listener when invoked or dropped
pub struct ListenerHandle {
    port: String,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn new(port: impl Into<String>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            port: port.into(),
            stop: Some(Box::new(stop)),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Tear the listener down. Returns once no more events will be delivered.
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("port", &self.port)
            .finish()
    }
}

/// Port enumeration and acquisition on a MIDI driver
///
/// Calls may block on the driver and are run off the async workers.
pub trait MidiPortProvider: Send + Sync {
    fn input_ports(&self) -> Result<Vec<String>>;

    fn output_ports(&self) -> Result<Vec<String>>;

    /// Open the first output port whose name matches `pattern`
    fn open_output(&self, pattern: &Regex) -> Result<Arc<dyn MidiOutputPort>>;

    /// Start listening on the first input port whose name matches `pattern`.
    /// Decoded note events are pushed onto `events`.
    fn listen(
        &self,
        pattern: &Regex,
        events: mpsc::UnboundedSender<NoteEvent>,
    ) -> Result<ListenerHandle>;
}

/// Message received on a subscribed MQTT topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttInbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A connected MQTT client
///
/// Publishes use QoS 0 with the retained flag set.
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Opens MQTT sessions
#[async_trait]
pub trait MqttConnector: Send + Sync {
    /// Connect and wait for the broker to accept the session.
    /// `subscriptions` are (re)issued after every broker ConnAck.
    async fn connect(
        &self,
        config: &MqttConfig,
        subscriptions: Vec<String>,
        inbound: mpsc::UnboundedSender<MqttInbound>,
    ) -> Result<Arc<dyn MqttPublisher>>;
}
