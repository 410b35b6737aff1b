//! Router engine for midi-request-trigger
//!
//! Bridges MIDI note events to HTTP requests and MQTT publishes, and
//! inbound HTTP requests and MQTT messages back to MIDI notes:
//! - `dispatch`: rule evaluation and event translation
//! - `supervisor`: per-router acquisition and retry of live handles
//! - `http`: outbound request executor and inbound HTTP surface
//! - `midi` / `mqtt`: midir and rumqttc transports

pub mod dispatch;
pub mod error;
pub mod http;
pub mod router;
pub mod supervisor;
pub mod traits;

#[cfg(feature = "midi")]
pub mod midi;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use error::{BridgeError, Result};
pub use router::{MidiRouter, RouterContext};
pub use supervisor::{ConnectionState, FatalError, ResourceState, RETRY_INTERVAL};
pub use traits::{
    ListenerHandle, MidiOutputPort, MidiPortProvider, MqttConnector, MqttInbound, MqttPublisher,
};

#[cfg(feature = "midi")]
pub use midi::MidirProvider;

#[cfg(feature = "mqtt")]
pub use mqtt::RumqttConnector;
