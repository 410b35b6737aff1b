//! Core types for midi-request-trigger
//!
//! Provides the declarative trigger rule set, router configuration and the
//! note event types that flow between MIDI, HTTP and MQTT.

pub mod config;
pub mod error;
pub mod rules;
pub mod types;

pub use config::{LogLevel, MqttConfig, RouterConfig};
pub use error::{Error, Result};
pub use rules::{NoteTrigger, RequestTrigger};
pub use types::{note_name, NoteEvent, NoteMessage, NotePayload};
