//! Common test helpers for midi-request-trigger tests
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - In-memory MIDI ports with scripted acquisition failures
//! - In-memory MQTT broker session recording publishes
//! - Local HTTP endpoint recording received requests

use async_trait::async_trait;
use miditrig_bridge::{
    BridgeError, ListenerHandle, MidiOutputPort, MidiPortProvider, MqttConnector, MqttInbound,
    MqttPublisher, Result,
};
use miditrig_core::{MqttConfig, NoteEvent, NoteMessage};
use parking_lot::Mutex;
use regex_lite::Regex;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rcgen::CertifiedKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    check()
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || counter.load(Ordering::SeqCst) >= target,
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// MIDI
// ============================================================================

/// Output port that records every message sent through it
pub struct MockOutputPort {
    name: String,
    sent: Arc<Mutex<Vec<NoteMessage>>>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl MidiOutputPort for MockOutputPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: NoteMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::Send("port gone".into()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// MIDI driver with a fixed port list
///
/// `fail_outputs(n)` / `fail_listens(n)` make the next `n` acquisitions fail
/// as if the device were missing.
pub struct MockPortProvider {
    ports: Vec<String>,
    output_failures: AtomicU32,
    listen_failures: AtomicU32,
    output_attempts: AtomicU32,
    listen_attempts: AtomicU32,
    listeners_stopped: Arc<AtomicU32>,
    sent: Arc<Mutex<Vec<NoteMessage>>>,
    fail_sends: Arc<AtomicBool>,
    events: Mutex<Option<mpsc::UnboundedSender<NoteEvent>>>,
}

impl MockPortProvider {
    pub fn new(ports: &[&str]) -> Self {
        Self {
            ports: ports.iter().map(|p| p.to_string()).collect(),
            output_failures: AtomicU32::new(0),
            listen_failures: AtomicU32::new(0),
            output_attempts: AtomicU32::new(0),
            listen_attempts: AtomicU32::new(0),
            listeners_stopped: Arc::new(AtomicU32::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
            events: Mutex::new(None),
        }
    }

    pub fn fail_outputs(self, n: u32) -> Self {
        self.output_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_listens(self, n: u32) -> Self {
        self.listen_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Make every send on opened ports fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn output_attempts(&self) -> &AtomicU32 {
        &self.output_attempts
    }

    pub fn listen_attempts(&self) -> &AtomicU32 {
        &self.listen_attempts
    }

    pub fn listeners_stopped(&self) -> u32 {
        self.listeners_stopped.load(Ordering::SeqCst)
    }

    /// Messages sent on any opened output port, in order
    pub fn sent(&self) -> Vec<NoteMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Deliver `event` as if it came from the active listener.
    /// Returns false when nothing is listening.
    pub fn inject(&self, event: NoteEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.events.lock().is_some()
    }

    fn find(&self, pattern: &Regex) -> Result<String> {
        self.ports
            .iter()
            .find(|p| pattern.is_match(p))
            .cloned()
            .ok_or_else(|| BridgeError::DeviceNotFound(pattern.as_str().to_string()))
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl MidiPortProvider for MockPortProvider {
    fn input_ports(&self) -> Result<Vec<String>> {
        Ok(self.ports.clone())
    }

    fn output_ports(&self) -> Result<Vec<String>> {
        Ok(self.ports.clone())
    }

    fn open_output(&self, pattern: &Regex) -> Result<Arc<dyn MidiOutputPort>> {
        self.output_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.output_failures) {
            return Err(BridgeError::DeviceNotFound(pattern.as_str().to_string()));
        }
        let name = self.find(pattern)?;
        Ok(Arc::new(MockOutputPort {
            name,
            sent: self.sent.clone(),
            fail: self.fail_sends.clone(),
        }))
    }

    fn listen(
        &self,
        pattern: &Regex,
        events: mpsc::UnboundedSender<NoteEvent>,
    ) -> Result<ListenerHandle> {
        self.listen_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.listen_failures) {
            return Err(BridgeError::DeviceNotFound(pattern.as_str().to_string()));
        }
        let name = self.find(pattern)?;
        *self.events.lock() = Some(events);

        let stopped = self.listeners_stopped.clone();
        Ok(ListenerHandle::new(name, move || {
            stopped.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

// ============================================================================
// MQTT
// ============================================================================

/// Client side of an in-memory MQTT session
#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    count: AtomicU32,
    disconnects: AtomicU32,
}

impl MockPublisher {
    pub fn count(&self) -> &AtomicU32 {
        &self.count
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Payloads published on exactly `topic`
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.published.lock().clear();
        self.count.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl MqttPublisher for MockPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published.lock().push((topic.to_string(), payload));
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory broker: records subscriptions and lets tests push messages
#[derive(Default)]
pub struct MockConnector {
    refuse: bool,
    publisher: Arc<MockPublisher>,
    subscriptions: Mutex<Vec<String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<MqttInbound>>>,
    connects: AtomicU32,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that refuses every connection
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn publisher(&self) -> Arc<MockPublisher> {
        self.publisher.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inbound.lock().is_some()
    }

    /// Deliver a message as if the broker forwarded it.
    /// Returns false when no session is open.
    pub fn push(&self, topic: &str, payload: &[u8]) -> bool {
        match self.inbound.lock().as_ref() {
            Some(tx) => tx
                .send(MqttInbound {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl MqttConnector for MockConnector {
    async fn connect(
        &self,
        config: &MqttConfig,
        subscriptions: Vec<String>,
        inbound: mpsc::UnboundedSender<MqttInbound>,
    ) -> Result<Arc<dyn MqttPublisher>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(BridgeError::ConnectionFailed(format!(
                "{}:{} refused",
                config.host, config.port
            )));
        }
        *self.subscriptions.lock() = subscriptions;
        *self.inbound.lock() = Some(inbound);
        Ok(self.publisher.clone())
    }
}

// ============================================================================
// HTTP endpoint
// ============================================================================

/// A request seen by [`RequestRecorder`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Lowercase names, in arrival order
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Clone, Default)]
struct Recording {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    count: Arc<AtomicU32>,
}

async fn record(
    State(recording): State<Recording>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    recording.requests.lock().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    recording.count.fetch_add(1, Ordering::SeqCst);
    "ok"
}

/// Local HTTP endpoint answering 200 to every method and path
///
/// Stops accepting when dropped.
pub struct RequestRecorder {
    addr: SocketAddr,
    scheme: &'static str,
    recording: Recording,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl RequestRecorder {
    fn app(recording: Recording) -> Router {
        Router::new().fallback(record).with_state(recording)
    }

    /// Plain HTTP on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recording = Recording::default();
        let app = Self::app(recording.clone());

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            scheme: "http",
            recording,
            handle: Some(handle),
        }
    }

    /// HTTPS with a freshly generated self-signed certificate, which no
    /// verifying client will accept
    pub async fn start_tls() -> Self {
        let CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        let cert = CertificateDer::from(cert.der().to_vec());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let tls = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recording = Recording::default();
        let app = Self::app(recording.clone());

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    // Rejected handshakes are expected from verifying clients
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(app))
                        .await;
                });
            }
        });

        Self {
            addr,
            scheme: "https",
            recording,
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recording.requests.lock().clone()
    }

    pub fn count(&self) -> u32 {
        self.recording.count.load(Ordering::SeqCst)
    }

    pub async fn wait_for_count(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.recording.count, n, max_wait).await
    }
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
