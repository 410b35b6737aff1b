//! MIDI port provider backed by midir
//!
//! midir connections are kept on dedicated threads: the output thread owns
//! the output connection and serves send requests over a channel, the
//! input thread owns the input connection until its listener is stopped.

use async_trait::async_trait;
use midir::{Ignore, MidiInput, MidiOutput};
use miditrig_core::{NoteEvent, NoteMessage};
use regex_lite::Regex;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::traits::{ListenerHandle, MidiOutputPort, MidiPortProvider};
use crate::{BridgeError, Result};

/// Index of the first port name matching `pattern`
pub fn select_port(names: &[String], pattern: &Regex) -> Option<usize> {
    names.iter().position(|name| pattern.is_match(name))
}

/// Port provider on the system MIDI driver
#[derive(Debug, Clone)]
pub struct MidirProvider {
    client_name: String,
}

impl Default for MidirProvider {
    fn default() -> Self {
        Self::new("midi-request-trigger")
    }
}

impl MidirProvider {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn input(&self) -> Result<MidiInput> {
        MidiInput::new(&self.client_name).map_err(|e| BridgeError::ConnectionFailed(e.to_string()))
    }

    fn output(&self) -> Result<MidiOutput> {
        MidiOutput::new(&self.client_name).map_err(|e| BridgeError::ConnectionFailed(e.to_string()))
    }
}

struct SendRequest {
    bytes: [u8; 3],
    reply: oneshot::Sender<Result<()>>,
}

/// Output port whose connection lives on its own thread
///
/// Dropping the last handle closes the connection.
pub struct MidirOutput {
    name: String,
    requests: std_mpsc::Sender<SendRequest>,
}

#[async_trait]
impl MidiOutputPort for MidirOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: NoteMessage) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(SendRequest {
                bytes: message.to_bytes(),
                reply,
            })
            .map_err(|_| BridgeError::Send(format!("output {} closed", self.name)))?;

        response
            .await
            .map_err(|_| BridgeError::Send(format!("output {} closed", self.name)))?
    }
}

impl MidiPortProvider for MidirProvider {
    fn input_ports(&self) -> Result<Vec<String>> {
        let midi_in = self.input()?;
        Ok(midi_in
            .ports()
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok())
            .collect())
    }

    fn output_ports(&self) -> Result<Vec<String>> {
        let midi_out = self.output()?;
        Ok(midi_out
            .ports()
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok())
            .collect())
    }

    fn open_output(&self, pattern: &Regex) -> Result<Arc<dyn MidiOutputPort>> {
        let provider = self.clone();
        let pattern = pattern.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<String>>();
        let (requests, request_rx) = std_mpsc::channel::<SendRequest>();

        std::thread::Builder::new()
            .name("midi-output".to_string())
            .spawn(move || {
                let midi_out = match provider.output() {
                    Ok(midi_out) => midi_out,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let ports = midi_out.ports();
                let names: Vec<String> = ports
                    .iter()
                    .map(|p| midi_out.port_name(p).unwrap_or_default())
                    .collect();

                let Some(index) = select_port(&names, &pattern) else {
                    let _ = ready_tx.send(Err(BridgeError::DeviceNotFound(
                        pattern.as_str().to_string(),
                    )));
                    return;
                };

                let mut conn = match midi_out.connect(&ports[index], &provider.client_name) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = ready_tx.send(Err(BridgeError::ConnectionFailed(e.to_string())));
                        return;
                    }
                };

                let name = names[index].clone();
                info!("Opened MIDI output: {}", name);
                let _ = ready_tx.send(Ok(name.clone()));

                while let Ok(request) = request_rx.recv() {
                    let result = conn
                        .send(&request.bytes)
                        .map_err(|e| BridgeError::Send(e.to_string()));
                    let _ = request.reply.send(result);
                }

                conn.close();
                debug!("Closed MIDI output: {}", name);
            })?;

        let name = ready_rx
            .recv()
            .map_err(|_| BridgeError::ConnectionFailed("midi output thread exited".to_string()))??;

        Ok(Arc::new(MidirOutput { name, requests }))
    }

    fn listen(
        &self,
        pattern: &Regex,
        events: mpsc::UnboundedSender<NoteEvent>,
    ) -> Result<ListenerHandle> {
        let provider = self.clone();
        let pattern = pattern.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("midi-input".to_string())
            .spawn(move || {
                let mut midi_in = match provider.input() {
                    Ok(midi_in) => midi_in,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                midi_in.ignore(Ignore::All);

                let ports = midi_in.ports();
                let names: Vec<String> = ports
                    .iter()
                    .map(|p| midi_in.port_name(p).unwrap_or_default())
                    .collect();

                let Some(index) = select_port(&names, &pattern) else {
                    let _ = ready_tx.send(Err(BridgeError::DeviceNotFound(
                        pattern.as_str().to_string(),
                    )));
                    return;
                };

                let conn = match midi_in.connect(
                    &ports[index],
                    &provider.client_name,
                    move |_stamp, message, _| {
                        if let Some(event) = NoteEvent::decode(message) {
                            // Receiver gone means the router is shutting down
                            let _ = events.send(event);
                        }
                    },
                    (),
                ) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = ready_tx.send(Err(BridgeError::ConnectionFailed(e.to_string())));
                        return;
                    }
                };

                let name = names[index].clone();
                info!("Opened MIDI input: {}", name);
                let _ = ready_tx.send(Ok(name.clone()));

                // Either an explicit stop or the handle being dropped ends the wait
                let _ = stop_rx.recv();
                conn.close();
                debug!("Closed MIDI input: {}", name);
            })?;

        let name = ready_rx
            .recv()
            .map_err(|_| BridgeError::ConnectionFailed("midi input thread exited".to_string()))??;

        Ok(ListenerHandle::new(name, move || {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                warn!("MIDI input thread panicked");
            }
        }))
    }
}
