//! MQTT broker link.
//!
//! Subscribes to the entire topic namespace (`#`) with the MQTT 5
//! no-local flag so the bridge never receives its own publishes back as
//! fresh inbound messages. The event loop reconnects on its own; the one
//! thing it will not do automatically is re-subscribe, so the `#` filter
//! is re-issued after every `ConnAck`.

use std::time::Duration;

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Filter, Packet};
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;

const EVENT_LOOP_CAPACITY: usize = 256;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

// ── BrokerHandle ─────────────────────────────────────────────────────

/// Handle for publishing to the broker.
#[derive(Clone)]
pub struct BrokerHandle {
    client: AsyncClient,
}

impl BrokerHandle {
    /// Publish a UTF-8 text payload to a topic.
    ///
    /// Failures are surfaced to the caller; the event-loop task keeps the
    /// connection alive independently, so no teardown is needed here.
    pub async fn publish(&self, topic: &str, payload: String) -> Result<(), Error> {
        debug!(topic, "publishing to broker");
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(Error::Mqtt)
    }
}

// ── BrokerClient ─────────────────────────────────────────────────────

/// Spawns and owns the broker event loop.
pub struct BrokerClient;

impl BrokerClient {
    /// Connect to the broker and spawn the event-loop task.
    ///
    /// Inbound `(topic, payload)` pairs are forwarded through
    /// `inbound_tx`. Non-UTF-8 payloads are logged and dropped.
    pub fn spawn(
        host: &str,
        port: u16,
        client_id: &str,
        inbound_tx: mpsc::Sender<(String, String)>,
        cancel: CancellationToken,
    ) -> BrokerHandle {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, EVENT_LOOP_CAPACITY);

        let loop_client = client.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            // Re-subscribe after every broker (re)connect:
                            // the client does not restore subscriptions.
                            info!("broker connected, subscribing to #");
                            if let Err(e) = subscribe_all(&loop_client).await {
                                error!(error = %e, "broker subscribe failed");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                            match std::str::from_utf8(&publish.payload) {
                                Ok(payload) => {
                                    debug!(topic, "broker message received");
                                    if inbound_tx
                                        .send((topic, payload.to_owned()))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(_) => {
                                    warn!(topic, "dropping non-UTF-8 broker payload");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // The next poll() re-drives the reconnect cycle;
                            // back off so a dead broker is not hot-looped.
                            warn!(error = %e, "broker connection error");
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }

            debug!("broker loop exiting");
        });

        BrokerHandle { client }
    }
}

/// Subscribe to the full namespace with the no-local flag set.
async fn subscribe_all(client: &AsyncClient) -> Result<(), Error> {
    let mut filter = Filter::new("#", QoS::AtMostOnce);
    filter.nolocal = true;
    client.subscribe_many([filter]).await.map_err(Error::Mqtt)
}
