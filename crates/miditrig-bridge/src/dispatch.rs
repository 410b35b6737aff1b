//! Dispatch engine
//!
//! Evaluates a router's trigger rules against inbound events:
//! - MIDI note events fan out to MQTT publishes and HTTP requests
//! - HTTP requests and MQTT messages synthesize an outbound note
//!
//! Delivery failures are logged and only abort the single action that hit
//! them; they never propagate back into the MIDI listener.

use axum::http::StatusCode;
use miditrig_core::{LogLevel, NoteEvent, NoteMessage, NotePayload, NoteTrigger, RouterConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::http::HttpAction;
use crate::supervisor::HandleSlots;
use crate::traits::MqttPublisher;
use crate::{BridgeError, Result};

const MAX_CHANNEL: u32 = 255;
const MAX_NOTE: u32 = 254;
const MAX_VELOCITY: u32 = 127;

/// Parse a query value made only of decimal digits and within `max`
fn bounded_param(query: &HashMap<String, String>, key: &str, max: u32) -> Option<u8> {
    let raw = query.get(key)?;
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u32>()
        .ok()
        .filter(|v| *v <= max)
        .map(|v| v as u8)
}

/// Override each of channel, note and velocity independently from the query.
/// Missing, non-numeric and out-of-range values keep the default.
pub fn apply_query_overrides(defaults: NotePayload, query: &HashMap<String, String>) -> NotePayload {
    NotePayload {
        channel: bounded_param(query, "channel", MAX_CHANNEL).unwrap_or(defaults.channel),
        note: bounded_param(query, "note", MAX_NOTE).unwrap_or(defaults.note),
        velocity: bounded_param(query, "velocity", MAX_VELOCITY).unwrap_or(defaults.velocity),
    }
}

pub struct Dispatcher {
    config: Arc<RouterConfig>,
    slots: Arc<HandleSlots>,
    http: HttpAction,
}

impl Dispatcher {
    pub fn new(config: Arc<RouterConfig>, slots: Arc<HandleSlots>) -> Result<Self> {
        Ok(Self {
            config,
            slots,
            http: HttpAction::new()?,
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn logs(&self, level: LogLevel) -> bool {
        self.config.log_level.allows(level)
    }

    // =========================================================================
    // MIDI event path
    // =========================================================================

    /// Run every matching note trigger, in declaration order
    pub async fn on_note_event(&self, event: NoteEvent) {
        if !self.config.mqtt.disable_midi_firehose {
            if let Some(client) = self.slots.mqtt.get() {
                self.publish_note(client.as_ref(), &self.config.mqtt.cmd_topic(), &event)
                    .await;
            }
        }

        for trigger in self.config.note_triggers.iter() {
            if trigger.matches(&event) {
                self.run_note_trigger(trigger, &event).await;
            }
        }
    }

    async fn run_note_trigger(&self, trigger: &NoteTrigger, event: &NoteEvent) {
        if trigger.delay_before_ms > 0 {
            tokio::time::sleep(trigger.delay_before()).await;
        }

        if let Some(topic) = trigger.mqtt_topic() {
            match self.slots.mqtt.get() {
                Some(client) => match &trigger.mqtt_payload {
                    Some(literal) => match serde_json::to_vec(literal) {
                        Ok(data) => self.publish(client.as_ref(), topic, data).await,
                        Err(e) => error!(router = %self.name(), "Json encode: {}", e),
                    },
                    None => self.publish_note(client.as_ref(), topic, event).await,
                },
                None => {
                    if self.logs(LogLevel::Debug) {
                        debug!(router = %self.name(), "MQTT not connected, skipping publish to {}", topic);
                    }
                }
            }
        }

        if trigger.url().is_some() {
            self.run_http_action(trigger, event).await;
        }

        if trigger.delay_after_ms > 0 {
            tokio::time::sleep(trigger.delay_after()).await;
        }
    }

    async fn run_http_action(&self, trigger: &NoteTrigger, event: &NoteEvent) {
        if self.logs(LogLevel::Debug) {
            debug!(
                router = %self.name(),
                "Starting request for trigger: {} {}\n{}",
                trigger.method(),
                trigger.url().unwrap_or_default(),
                event
            );
        }

        let response = match self.http.execute(trigger, event).await {
            Ok(response) => response,
            Err(e) => {
                error!(router = %self.name(), "Trigger failed to request: {}\n {}", e, event);
                return;
            }
        };

        if self.logs(LogLevel::Send) {
            info!(
                router = %self.name(),
                "-> [HTTP] {} {}: {}",
                trigger.method(),
                response.url(),
                response.status()
            );
        }

        if self.logs(LogLevel::Debug) {
            match response.text().await {
                Ok(body) => debug!(router = %self.name(), "Trigger response: {}\n{}", event, body),
                Err(e) => error!(router = %self.name(), "Trigger failed to read body: {}\n {}", e, event),
            }
        }
    }

    async fn publish_note(&self, client: &dyn MqttPublisher, topic: &str, event: &NoteEvent) {
        match event.payload().to_json() {
            Ok(data) => self.publish(client, topic, data).await,
            Err(e) => error!(router = %self.name(), "Json encode: {}", e),
        }
    }

    async fn publish(&self, client: &dyn MqttPublisher, topic: &str, data: Vec<u8>) {
        let shown = self
            .logs(LogLevel::Send)
            .then(|| String::from_utf8_lossy(&data).into_owned());

        match client.publish(topic, data).await {
            Ok(()) => {
                if let Some(shown) = shown {
                    info!(router = %self.name(), "-> [MQTT] {}: {}", topic, shown);
                }
            }
            Err(e) => error!(router = %self.name(), "{}", e),
        }
    }

    // =========================================================================
    // HTTP request path
    // =========================================================================

    /// Fire every request trigger whose URI equals `path`.
    ///
    /// 204 once all matches were sent, 500 on the first send failure, 404 when
    /// nothing matched.
    pub async fn on_http_request(&self, path: &str, query: &HashMap<String, String>) -> StatusCode {
        let mut status = StatusCode::NOT_FOUND;

        for trigger in self.config.request_triggers.iter() {
            if !trigger.matches_uri(path) {
                continue;
            }

            if self.logs(LogLevel::Receive) {
                info!(router = %self.name(), "<- [HTTP] {}", path);
            }

            let values = if trigger.midi_info_in_request {
                apply_query_overrides(trigger.defaults(), query)
            } else {
                trigger.defaults()
            };

            if let Err(e) = self.send_note(values).await {
                error!(router = %self.name(), "Failed to send midi message: {}\n{}", path, e);
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
            status = StatusCode::NO_CONTENT;
        }

        status
    }

    // =========================================================================
    // MQTT message path
    // =========================================================================

    pub async fn on_mqtt_message(&self, topic: &str, payload: &[u8]) {
        if self.logs(LogLevel::Receive) {
            info!(
                router = %self.name(),
                "<- [MQTT] {}: {}",
                topic,
                String::from_utf8_lossy(payload)
            );
        }

        let base = &self.config.mqtt.topic;
        for trigger in self.config.request_triggers.iter() {
            if !trigger.matches_topic(topic, base) {
                continue;
            }

            let values = if !trigger.disallow_payload && !payload.is_empty() {
                match NotePayload::from_json(payload) {
                    Ok(values) => values,
                    Err(e) => {
                        error!(router = %self.name(), "Json error on {}: {}", topic, e);
                        continue;
                    }
                }
            } else {
                trigger.defaults()
            };

            if let Err(e) = self.send_note(values).await {
                error!(router = %self.name(), "Failed to send midi message: {}\n{}", topic, e);
            }
        }

        if topic == self.config.mqtt.send_topic() {
            if payload.is_empty() {
                return;
            }
            match NotePayload::from_json(payload) {
                Ok(values) => {
                    if let Err(e) = self.send_note(values).await {
                        error!(router = %self.name(), "Failed to send midi message: {}\n{}", topic, e);
                    }
                }
                Err(e) => error!(router = %self.name(), "Json error on {}: {}", topic, e),
            }
        } else if topic == self.config.mqtt.status_check_topic() {
            self.publish_status().await;
        }
    }

    /// Publish the router configuration to `<base>/status`
    pub async fn publish_status(&self) {
        if self.config.mqtt.disable_config_send {
            return;
        }
        let Some(client) = self.slots.mqtt.get() else {
            return;
        };

        match serde_json::to_vec(self.config.as_ref()) {
            Ok(data) => {
                self.publish(client.as_ref(), &self.config.mqtt.status_topic(), data)
                    .await
            }
            Err(e) => error!(router = %self.name(), "Json error: {}", e),
        }
    }

    // =========================================================================
    // MIDI outbound
    // =========================================================================

    /// Send a note on, or a note off when velocity is zero
    pub async fn send_note(&self, values: NotePayload) -> Result<()> {
        let port = self
            .slots
            .output
            .get()
            .ok_or(BridgeError::NotConnected("midi output"))?;

        let message = NoteMessage::from(values);
        port.send(message).await?;

        if self.logs(LogLevel::Send) {
            info!(router = %self.name(), "-> [MIDI] {}: {}", port.name(), message);
        }
        Ok(())
    }
}
