//! Connection supervisor
//!
//! Each router owns three live handles: the MIDI output port, the input
//! listener and the MQTT client. Every handle sits in its own guarded slot
//! and moves through `Unbound -> Resolving -> Bound` independently.
//!
//! MIDI acquisition retries on a fixed interval until it succeeds. The
//! initial MQTT connect is not retried: its failure is reported on the
//! fatal channel so the process can stop.

use miditrig_core::{LogLevel, NoteEvent, RouterConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::traits::{
    ListenerHandle, MidiOutputPort, MidiPortProvider, MqttConnector, MqttInbound, MqttPublisher,
};
use crate::{BridgeError, Result};

/// Backoff between MIDI acquisition attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceState {
    #[default]
    Unbound,
    Resolving,
    Bound,
}

struct SlotInner<T> {
    state: ResourceState,
    handle: Option<T>,
}

/// Guarded handle slot with its acquisition state
///
/// State changes are refused once `session` is cancelled, so a handle
/// acquired while a disconnect is in progress is never stored.
pub struct Slot<T> {
    inner: Mutex<SlotInner<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: ResourceState::Unbound,
                handle: None,
            }),
        }
    }
}

impl<T> Slot<T> {
    pub fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    pub fn is_bound(&self) -> bool {
        self.state() == ResourceState::Bound
    }

    fn begin_resolving(&self, session: &CancellationToken) -> bool {
        let mut inner = self.inner.lock();
        if session.is_cancelled() {
            return false;
        }
        inner.state = ResourceState::Resolving;
        true
    }

    /// Store `handle`, or hand it back if the session was cancelled
    fn bind(&self, handle: T, session: &CancellationToken) -> std::result::Result<(), T> {
        let mut inner = self.inner.lock();
        if session.is_cancelled() {
            return Err(handle);
        }
        inner.state = ResourceState::Bound;
        inner.handle = Some(handle);
        Ok(())
    }

    /// Remove the handle and return to `Unbound`
    pub fn release(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        inner.state = ResourceState::Unbound;
        inner.handle.take()
    }
}

impl<T: Clone> Slot<T> {
    /// Current handle; `None` until bound
    pub fn get(&self) -> Option<T> {
        self.inner.lock().handle.clone()
    }
}

/// Per-router live handles
#[derive(Default)]
pub struct HandleSlots {
    pub output: Slot<Arc<dyn MidiOutputPort>>,
    pub listener: Slot<ListenerHandle>,
    pub mqtt: Slot<Arc<dyn MqttPublisher>>,
}

/// Snapshot of the three sub-resource states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub output: ResourceState,
    pub listener: ResourceState,
    pub mqtt: ResourceState,
}

impl HandleSlots {
    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            output: self.output.state(),
            listener: self.listener.state(),
            mqtt: self.mqtt.state(),
        }
    }
}

/// Unrecoverable router failure
#[derive(Debug)]
pub struct FatalError {
    pub router: String,
    pub error: BridgeError,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "router {}: {}", self.router, self.error)
    }
}

/// Everything an acquisition task needs, cheap to clone into each task
#[derive(Clone)]
struct Acquisition {
    config: Arc<RouterConfig>,
    slots: Arc<HandleSlots>,
    dispatcher: Arc<Dispatcher>,
    provider: Arc<dyn MidiPortProvider>,
    connector: Arc<dyn MqttConnector>,
    retry_interval: Duration,
    fatal: Option<mpsc::UnboundedSender<FatalError>>,
    session: CancellationToken,
}

impl Acquisition {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Sleep out the backoff; false when the session ended meanwhile
    async fn backoff(&self) -> bool {
        error!(router = %self.name(), "Retrying in {:?}.", self.retry_interval);
        tokio::select! {
            _ = self.session.cancelled() => false,
            _ = tokio::time::sleep(self.retry_interval) => true,
        }
    }

    async fn acquire_output(self) {
        let pattern = match self.config.device_pattern() {
            Ok(pattern) => pattern,
            Err(e) => {
                error!(router = %self.name(), "Output device disabled: {}", e);
                return;
            }
        };

        loop {
            if !self.slots.output.begin_resolving(&self.session) {
                return;
            }

            let provider = self.provider.clone();
            let attempt = pattern.clone();
            let result = tokio::task::spawn_blocking(move || provider.open_output(&attempt))
                .await
                .unwrap_or_else(|e| Err(BridgeError::Other(e.to_string())));

            match result {
                Ok(port) => {
                    let name = port.name().to_string();
                    if self.slots.output.bind(port, &self.session).is_ok() {
                        info!(router = %self.name(), "Connected to output device: {}", name);
                    }
                    return;
                }
                Err(e) => {
                    error!(
                        router = %self.name(),
                        "Failed to find output device '{}': {}",
                        self.config.device,
                        e
                    );
                }
            }

            if !self.backoff().await {
                return;
            }
        }
    }

    async fn acquire_listener(self, events: mpsc::UnboundedSender<NoteEvent>) {
        let pattern = match self.config.device_pattern() {
            Ok(pattern) => pattern,
            Err(e) => {
                error!(router = %self.name(), "Input device disabled: {}", e);
                return;
            }
        };

        loop {
            if !self.slots.listener.begin_resolving(&self.session) {
                return;
            }
            info!(router = %self.name(), "Connecting to input device: {}", self.config.device);

            let provider = self.provider.clone();
            let attempt = pattern.clone();
            let tx = events.clone();
            let result = tokio::task::spawn_blocking(move || provider.listen(&attempt, tx))
                .await
                .unwrap_or_else(|e| Err(BridgeError::Other(e.to_string())));

            match result {
                Ok(listener) => {
                    let name = listener.port().to_string();
                    match self.slots.listener.bind(listener, &self.session) {
                        Ok(()) => {
                            info!(router = %self.name(), "Connected to input device: {}", name)
                        }
                        Err(listener) => listener.stop(),
                    }
                    return;
                }
                Err(e) => {
                    error!(
                        router = %self.name(),
                        "Can't find input device '{}': {}",
                        self.config.device,
                        e
                    );
                }
            }

            if !self.backoff().await {
                return;
            }
        }
    }

    async fn acquire_mqtt(self, inbound: mpsc::UnboundedSender<MqttInbound>) {
        if !self.slots.mqtt.begin_resolving(&self.session) {
            return;
        }
        if self.config.log_level.allows(LogLevel::Debug) {
            debug!(router = %self.name(), "Connecting to MQTT");
        }

        let connect = self
            .connector
            .connect(&self.config.mqtt, self.config.subscriptions(), inbound);
        let result = tokio::select! {
            _ = self.session.cancelled() => return,
            result = connect => result,
        };

        match result {
            Ok(client) => match self.slots.mqtt.bind(client, &self.session) {
                Ok(()) => self.dispatcher.publish_status().await,
                Err(client) => {
                    let _ = client.disconnect().await;
                }
            },
            Err(error) => {
                self.slots.mqtt.release();
                error!(router = %self.name(), "MQTT error: {}", error);
                match &self.fatal {
                    Some(fatal) => {
                        let _ = fatal.send(FatalError {
                            router: self.config.name.clone(),
                            error,
                        });
                    }
                    None => warn!(router = %self.name(), "No fatal error sink, MQTT stays unbound"),
                }
            }
        }
    }

    /// One task per note event so trigger delays never hold up later events
    async fn pump_note_events(self, mut events: mpsc::UnboundedReceiver<NoteEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.session.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if self.config.log_level.allows(LogLevel::Receive) {
                let verb = if event.is_start() { "starting" } else { "ending" };
                info!(router = %self.name(), "<- [MIDI] {} {}", verb, event);
            }

            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { dispatcher.on_note_event(event).await });
        }
    }

    async fn pump_mqtt_messages(self, mut messages: mpsc::UnboundedReceiver<MqttInbound>) {
        loop {
            let message = tokio::select! {
                _ = self.session.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.dispatcher
                .on_mqtt_message(&message.topic, &message.payload)
                .await;
        }
    }
}

/// Drives acquisition of a router's handles
pub struct Supervisor {
    config: Arc<RouterConfig>,
    slots: Arc<HandleSlots>,
    dispatcher: Arc<Dispatcher>,
    provider: Arc<dyn MidiPortProvider>,
    connector: Arc<dyn MqttConnector>,
    retry_interval: Duration,
    fatal: Option<mpsc::UnboundedSender<FatalError>>,
    session: Mutex<Option<CancellationToken>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RouterConfig>,
        slots: Arc<HandleSlots>,
        dispatcher: Arc<Dispatcher>,
        provider: Arc<dyn MidiPortProvider>,
        connector: Arc<dyn MqttConnector>,
        retry_interval: Duration,
        fatal: Option<mpsc::UnboundedSender<FatalError>>,
    ) -> Self {
        Self {
            config,
            slots,
            dispatcher,
            provider,
            connector,
            retry_interval,
            fatal,
            session: Mutex::new(None),
        }
    }

    /// Spawn one acquisition task per needed sub-resource and return at once
    pub fn start(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(BridgeError::Other(format!(
                "router {} already connected",
                self.config.name
            )));
        }
        let token = CancellationToken::new();
        *session = Some(token.clone());

        let task = Acquisition {
            config: self.config.clone(),
            slots: self.slots.clone(),
            dispatcher: self.dispatcher.clone(),
            provider: self.provider.clone(),
            connector: self.connector.clone(),
            retry_interval: self.retry_interval,
            fatal: self.fatal.clone(),
            session: token,
        };

        if self.config.needs_output() {
            tokio::spawn(task.clone().acquire_output());
        }

        if self.config.needs_listener() {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(task.clone().pump_note_events(rx));
            tokio::spawn(task.clone().acquire_listener(tx));
        }

        if self.config.mqtt.is_enabled() {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(task.clone().pump_mqtt_messages(rx));
            tokio::spawn(task.acquire_mqtt(tx));
        }

        Ok(())
    }

    /// Release every bound handle. Safe in any state and idempotent.
    pub async fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cancel();
        }

        drop(self.slots.output.release());

        if let Some(listener) = self.slots.listener.release() {
            // Joins the listener thread
            let _ = tokio::task::spawn_blocking(move || listener.stop()).await;
        }

        if let Some(client) = self.slots.mqtt.release() {
            if let Err(e) = client.disconnect().await {
                warn!(router = %self.config.name, "MQTT disconnect: {}", e);
            }
        }
    }
}
