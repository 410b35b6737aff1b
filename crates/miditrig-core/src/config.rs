//! Router configuration

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::rules::{NoteTrigger, RequestTrigger};
use crate::{Error, Result};

/// Per-router log verbosity, in increasing order of chattiness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Error,
    /// Inbound MQTT, HTTP and MIDI traffic
    Receive,
    /// Outbound MQTT, HTTP and MIDI traffic
    Send,
    Debug,
}

impl LogLevel {
    /// Whether a message of `level` is emitted at this verbosity
    pub fn allows(self, level: LogLevel) -> bool {
        level <= self
    }
}

fn default_keep_alive() -> u16 {
    60
}

/// MQTT broker connection for a router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Base topic; `/cmd`, `/send`, `/status` and `/status/check` live under it
    pub topic: String,
    /// Do not publish every note event to `<topic>/cmd`
    pub disable_midi_firehose: bool,
    /// Do not publish the configuration to `<topic>/status`
    pub disable_config_send: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            client_id: String::new(),
            user: None,
            password: None,
            topic: String::new(),
            disable_midi_firehose: false,
            disable_config_send: false,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    /// A session is only opened when both host and port are configured
    pub fn is_enabled(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    pub fn cmd_topic(&self) -> String {
        format!("{}/cmd", self.topic)
    }

    pub fn send_topic(&self) -> String {
        format!("{}/send", self.topic)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic)
    }

    pub fn status_check_topic(&self) -> String {
        format!("{}/status/check", self.topic)
    }
}

/// One configured device with its rule set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Human readable name
    pub name: String,
    /// Regular expression matched against MIDI port names
    pub device: String,
    pub mqtt: MqttConfig,
    /// Only open the device for sending notes
    pub disable_listener: bool,
    pub note_triggers: Vec<NoteTrigger>,
    pub request_triggers: Vec<RequestTrigger>,
    pub log_level: LogLevel,
}

impl RouterConfig {
    pub fn device_pattern(&self) -> Result<Regex> {
        Regex::new(&self.device).map_err(|e| Error::InvalidPattern {
            pattern: self.device.clone(),
            reason: e.to_string(),
        })
    }

    /// Output port is only needed when something can synthesize notes
    pub fn needs_output(&self) -> bool {
        !self.request_triggers.is_empty()
    }

    pub fn needs_listener(&self) -> bool {
        !self.disable_listener
    }

    /// Every topic the MQTT session subscribes to
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.mqtt.send_topic(), self.mqtt.status_check_topic()];
        for trigger in &self.request_triggers {
            if let Some(topic) = trigger.mqtt_topic() {
                topics.push(topic.to_string());
            }
            if let Some(topic) = trigger.resolved_sub_topic(&self.mqtt.topic) {
                topics.push(topic);
            }
        }
        topics
    }

    /// Distinct URIs declared by request triggers, in declaration order
    pub fn uris(&self) -> Vec<&str> {
        let mut uris: Vec<&str> = Vec::new();
        for uri in self.request_triggers.iter().filter_map(|t| t.uri()) {
            if !uris.contains(&uri) {
                uris.push(uri);
            }
        }
        uris
    }

    /// Configuration-shape problems. None of these stop the router.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.device_pattern() {
            warnings.push(e.to_string());
        }

        for (i, trigger) in self.note_triggers.iter().enumerate() {
            if trigger.is_inert() {
                warnings.push(format!("note trigger {} has neither mqtt_topic nor url", i));
            }
            if let Some(raw) = trigger.url() {
                if let Err(e) = url::Url::parse(raw) {
                    warnings.push(
                        Error::InvalidUrl {
                            url: raw.to_string(),
                            reason: e.to_string(),
                        }
                        .to_string(),
                    );
                }
            }
            if trigger.mqtt_topic().is_some() && !self.mqtt.is_enabled() {
                warnings.push(format!(
                    "note trigger {} publishes to mqtt but no broker is configured",
                    i
                ));
            }
        }

        for (i, trigger) in self.request_triggers.iter().enumerate() {
            if !trigger.has_surface() {
                warnings.push(format!(
                    "request trigger {} has no uri, mqtt_topic or mqtt_sub_topic",
                    i
                ));
            }
        }

        let uris: Vec<&str> = self.request_triggers.iter().filter_map(|t| t.uri()).collect();
        for uri in self.uris() {
            if uris.iter().filter(|u| **u == uri).count() > 1 {
                warnings.push(format!("uri {} is declared by more than one request trigger", uri));
            }
        }

        warnings
    }
}
