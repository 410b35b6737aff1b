//! Trigger rule set
//!
//! Note triggers fire outbound HTTP requests and MQTT publishes when a MIDI
//! note event matches. Request triggers synthesize an outbound MIDI note
//! when an HTTP request or MQTT message arrives on their surface.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::{NoteEvent, NotePayload};

fn default_method() -> String {
    "GET".to_string()
}

/// Rule fired by inbound MIDI note events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteTrigger {
    pub channel: u8,
    pub match_all_channels: bool,
    pub note: u8,
    pub match_all_notes: bool,
    pub velocity: u8,
    pub match_all_velocities: bool,

    /// Pause before running this trigger's actions
    pub delay_before_ms: u64,
    /// Pause after running this trigger's actions
    pub delay_after_ms: u64,

    /// Topic to publish on. Unset disables the MQTT action.
    pub mqtt_topic: Option<String>,
    /// Literal payload; unset publishes the note record instead
    pub mqtt_payload: Option<serde_json::Value>,

    /// URL to request. Unset disables the HTTP action.
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Append channel, note and velocity as query parameters
    pub midi_info_in_request: bool,
    /// Skip TLS certificate verification for this trigger's request
    pub insecure_skip_verify: bool,
}

impl NoteTrigger {
    /// Channel, note and velocity must each match exactly or via their match-all flag
    pub fn matches(&self, event: &NoteEvent) -> bool {
        (self.match_all_channels || self.channel == event.channel)
            && (self.match_all_notes || self.note == event.note)
            && (self.match_all_velocities || self.velocity == event.velocity)
    }

    pub fn delay_before(&self) -> Duration {
        Duration::from_millis(self.delay_before_ms)
    }

    pub fn delay_after(&self) -> Duration {
        Duration::from_millis(self.delay_after_ms)
    }

    pub fn mqtt_topic(&self) -> Option<&str> {
        self.mqtt_topic.as_deref().filter(|t| !t.is_empty())
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }

    /// Method to use, GET when none is configured
    pub fn method(&self) -> &str {
        if self.method.is_empty() {
            "GET"
        } else {
            &self.method
        }
    }

    /// A trigger with neither a topic nor a URL never has an observable effect
    pub fn is_inert(&self) -> bool {
        self.mqtt_topic().is_none() && self.url().is_none()
    }
}

/// Rule fired by inbound HTTP requests or MQTT messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTrigger {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
    /// Allow query parameters to override channel, note and velocity
    pub midi_info_in_request: bool,
    /// Absolute topic to subscribe to
    pub mqtt_topic: Option<String>,
    /// Topic relative to the router's base topic
    pub mqtt_sub_topic: Option<String>,
    /// Ignore MQTT payloads and always use the defaults
    pub disallow_payload: bool,
    /// HTTP path that fires this trigger
    pub uri: Option<String>,
}

impl RequestTrigger {
    pub fn defaults(&self) -> NotePayload {
        NotePayload::new(self.channel, self.note, self.velocity)
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref().filter(|u| !u.is_empty())
    }

    pub fn mqtt_topic(&self) -> Option<&str> {
        self.mqtt_topic.as_deref().filter(|t| !t.is_empty())
    }

    pub fn mqtt_sub_topic(&self) -> Option<&str> {
        self.mqtt_sub_topic.as_deref().filter(|t| !t.is_empty())
    }

    /// Absolute topic for the sub-topic under `base_topic`
    pub fn resolved_sub_topic(&self, base_topic: &str) -> Option<String> {
        self.mqtt_sub_topic()
            .map(|sub| format!("{}/{}", base_topic, sub))
    }

    pub fn matches_uri(&self, path: &str) -> bool {
        self.uri() == Some(path)
    }

    /// Matches the absolute topic, or the sub-topic resolved against `base_topic`
    pub fn matches_topic(&self, topic: &str, base_topic: &str) -> bool {
        if self.mqtt_topic() == Some(topic) {
            return true;
        }
        match topic
            .strip_prefix(base_topic)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(rest) => self.mqtt_sub_topic() == Some(rest),
            None => false,
        }
    }

    pub fn has_surface(&self) -> bool {
        self.uri().is_some() || self.mqtt_topic().is_some() || self.mqtt_sub_topic().is_some()
    }
}
