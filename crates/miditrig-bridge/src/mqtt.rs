//! MQTT session backed by rumqttc
//!
//! The connector waits for the broker's ConnAck before handing out a
//! publisher. After that the event loop runs on its own task, forwarding
//! inbound publishes and re-subscribing whenever the broker accepts a
//! reconnect.

use async_trait::async_trait;
use miditrig_core::MqttConfig;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::traits::{MqttConnector, MqttInbound, MqttPublisher};
use crate::{BridgeError, Result};

/// Pause between polls after the event loop reports an error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connector for real brokers
#[derive(Debug, Clone, Default)]
pub struct RumqttConnector;

/// Connected client
pub struct RumqttPublisher {
    client: AsyncClient,
    shutdown: CancellationToken,
}

impl RumqttConnector {
    fn options(config: &MqttConfig) -> MqttOptions {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5) as u64));

        if let Some(user) = config.user.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }
        options
    }

    /// Poll until the broker answers the connect
    async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(BridgeError::ConnectionFailed(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(BridgeError::ConnectionFailed(e.to_string())),
            }
        }
    }

    fn subscribe_all(client: &AsyncClient, topics: &[String]) {
        for topic in topics {
            match client.try_subscribe(topic, QoS::AtMostOnce) {
                Ok(()) => debug!("MQTT subscribed to: {}", topic),
                Err(e) => error!("MQTT subscribe to {} failed: {}", topic, e),
            }
        }
    }

    async fn run_event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        subscriptions: Vec<String>,
        inbound: mpsc::UnboundedSender<MqttInbound>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = MqttInbound {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT reconnected to broker");
                    Self::subscribe_all(&client, &subscriptions);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT disconnected by broker");
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    error!("MQTT error: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
                _ => {}
            }
        }
        debug!("MQTT event loop stopped");
    }
}

#[async_trait]
impl MqttConnector for RumqttConnector {
    async fn connect(
        &self,
        config: &MqttConfig,
        subscriptions: Vec<String>,
        inbound: mpsc::UnboundedSender<MqttInbound>,
    ) -> Result<Arc<dyn MqttPublisher>> {
        info!("MQTT connecting to {}:{}", config.host, config.port);

        let (client, mut eventloop) = AsyncClient::new(Self::options(config), 100);
        Self::wait_for_connack(&mut eventloop).await?;
        info!("MQTT connected to broker");

        Self::subscribe_all(&client, &subscriptions);

        let shutdown = CancellationToken::new();
        tokio::spawn(Self::run_event_loop(
            eventloop,
            client.clone(),
            subscriptions,
            inbound,
            shutdown.clone(),
        ));

        Ok(Arc::new(RumqttPublisher { client, shutdown }))
    }
}

#[async_trait]
impl MqttPublisher for RumqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, true, payload)
            .await
            .map_err(|e| BridgeError::Mqtt(format!("publish to {} failed: {}", topic, e)))
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BridgeError::Mqtt(e.to_string()));
        self.shutdown.cancel();
        result
    }
}
