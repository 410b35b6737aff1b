//! Router: one device, one MQTT session, one rule set
//!
//! # Example
//!
//! ```no_run
//! use miditrig_bridge::{MidiRouter, RouterContext};
//! use miditrig_core::RouterConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RouterConfig {
//!         name: "Pads".to_string(),
//!         device: "^nanoPAD".to_string(),
//!         ..Default::default()
//!     };
//!     let router = MidiRouter::new(config, RouterContext::system()).unwrap();
//!     router.connect().unwrap();
//!     // ...
//!     router.disconnect().await;
//! }
//! ```

use axum::http::StatusCode;
use miditrig_core::{NoteEvent, RouterConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::supervisor::{ConnectionState, FatalError, HandleSlots, Supervisor, RETRY_INTERVAL};
use crate::traits::{MidiPortProvider, MqttConnector};
use crate::Result;

/// Transports and policies shared by the routers of one process
#[derive(Clone)]
pub struct RouterContext {
    pub provider: Arc<dyn MidiPortProvider>,
    pub connector: Arc<dyn MqttConnector>,
    pub retry_interval: Duration,
    pub fatal: Option<mpsc::UnboundedSender<FatalError>>,
}

impl RouterContext {
    pub fn new(provider: Arc<dyn MidiPortProvider>, connector: Arc<dyn MqttConnector>) -> Self {
        Self {
            provider,
            connector,
            retry_interval: RETRY_INTERVAL,
            fatal: None,
        }
    }

    /// midir for MIDI, rumqttc for MQTT
    #[cfg(all(feature = "midi", feature = "mqtt"))]
    pub fn system() -> Self {
        Self::new(
            Arc::new(crate::midi::MidirProvider::default()),
            Arc::new(crate::mqtt::RumqttConnector),
        )
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Where unrecoverable failures (MQTT initial connect) are reported
    pub fn with_fatal_sink(mut self, fatal: mpsc::UnboundedSender<FatalError>) -> Self {
        self.fatal = Some(fatal);
        self
    }
}

pub struct MidiRouter {
    config: Arc<RouterConfig>,
    slots: Arc<HandleSlots>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Supervisor,
}

impl MidiRouter {
    pub fn new(config: RouterConfig, context: RouterContext) -> Result<Self> {
        for warning in config.validate() {
            warn!(router = %config.name, "{}", warning);
        }

        let config = Arc::new(config);
        let slots = Arc::new(HandleSlots::default());
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), slots.clone())?);
        let supervisor = Supervisor::new(
            config.clone(),
            slots.clone(),
            dispatcher.clone(),
            context.provider,
            context.connector,
            context.retry_interval,
            context.fatal,
        );

        Ok(Self {
            config,
            slots,
            dispatcher,
            supervisor,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.slots.state()
    }

    /// Start acquiring the output port, input listener and MQTT session.
    /// Returns immediately; acquisition continues in the background.
    pub fn connect(&self) -> Result<()> {
        self.supervisor.start()
    }

    /// Release all live handles. Idempotent.
    pub async fn disconnect(&self) {
        self.supervisor.stop().await
    }

    pub async fn on_note_event(&self, event: NoteEvent) {
        self.dispatcher.on_note_event(event).await
    }

    pub async fn on_http_request(&self, path: &str, query: &HashMap<String, String>) -> StatusCode {
        self.dispatcher.on_http_request(path, query).await
    }

    pub async fn on_mqtt_message(&self, topic: &str, payload: &[u8]) {
        self.dispatcher.on_mqtt_message(topic, payload).await
    }
}

impl std::fmt::Debug for MidiRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiRouter")
            .field("name", &self.config.name)
            .field("device", &self.config.device)
            .field("state", &self.state())
            .finish()
    }
}
