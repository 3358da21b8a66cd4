//! WebSocket hub link with auto-reconnect.
//!
//! Connects to the hub's `/ws/controllers` endpoint and keeps the link up
//! for the lifetime of the process: on any connect, read, or send failure
//! the connection is dropped, the loop waits a fixed backoff, re-reads the
//! current auth token, and reconnects. Outbound messages queue in an mpsc
//! channel while disconnected and flush once the link is re-established.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;

// ── Channel capacities ───────────────────────────────────────────────

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

// ── HubHandle ────────────────────────────────────────────────────────

/// Handle to a running hub connection.
///
/// `send` enqueues a message for delivery; it never blocks on the network.
/// Messages enqueued while the link is down are delivered after reconnect
/// (at-most-once -- a message in flight when the connection drops is lost).
#[derive(Clone)]
pub struct HubHandle {
    outbound_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl HubHandle {
    /// Queue a message for the hub.
    pub async fn send(&self, message: String) -> Result<(), Error> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| Error::WebSocketSend("hub connection task has shut down".into()))
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── HubClient ────────────────────────────────────────────────────────

/// Spawns and owns the hub reconnect loop.
pub struct HubClient;

impl HubClient {
    /// Spawn the connection loop and return a handle for sending.
    ///
    /// `endpoint` is the hub WebSocket URL without credentials
    /// (e.g. `ws://host:port/ws/controllers`); the current token is read
    /// from `token_rx` on every connection attempt. Inbound text frames
    /// are forwarded through `inbound_tx`.
    pub fn spawn(
        endpoint: Url,
        reconnect_delay: Duration,
        token_rx: watch::Receiver<Option<String>>,
        inbound_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> HubHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            hub_loop(
                endpoint,
                reconnect_delay,
                token_rx,
                inbound_tx,
                outbound_rx,
                task_cancel,
            )
            .await;
        });

        HubHandle {
            outbound_tx,
            cancel,
        }
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: connect → pump → on any error, fixed backoff → reconnect.
async fn hub_loop(
    endpoint: Url,
    reconnect_delay: Duration,
    token_rx: watch::Receiver<Option<String>>,
    inbound_tx: mpsc::Sender<String>,
    mut outbound_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect_and_pump(
                &endpoint,
                &token_rx,
                &inbound_tx,
                &mut outbound_rx,
                &cancel,
            ) => {
                match result {
                    Ok(()) => break, // shutdown or all senders gone
                    Err(e) => {
                        warn!(error = %e, "hub connection lost");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }

    debug!("hub loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one WebSocket connection and pump frames both ways until
/// it drops. A send failure returns `Err` so the caller tears the
/// connection down and reconnects; `Ok` means orderly shutdown.
async fn connect_and_pump(
    endpoint: &Url,
    token_rx: &watch::Receiver<Option<String>>,
    inbound_tx: &mpsc::Sender<String>,
    outbound_rx: &mut mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    // Fresh token on every attempt: the controller may have
    // re-authenticated while we were disconnected.
    let mut url = endpoint.clone();
    if let Some(token) = token_rx.borrow().as_deref() {
        url.query_pairs_mut().append_pair("token", token);
    }

    info!(endpoint = %endpoint, "connecting to hub");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;
    let request = ClientRequestBuilder::new(uri);

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    info!("hub connected");

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    // All handles dropped -- nothing left to deliver.
                    return Ok(());
                };
                write
                    .send(tungstenite::Message::Text(message.into()))
                    .await
                    .map_err(|e| Error::WebSocketSend(e.to_string()))?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if inbound_tx.send(text.to_string()).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite replies with pong automatically
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        return Err(Error::WebSocketConnect("hub closed the connection".into()));
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        return Err(Error::WebSocketConnect("hub stream ended".into()));
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_shutdown_fails() {
        let (_token_tx, token_rx) = watch::channel(None);
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = HubClient::spawn(
            Url::parse("ws://127.0.0.1:1/ws/controllers").expect("url"),
            Duration::from_secs(1),
            token_rx,
            inbound_tx,
            cancel.clone(),
        );

        handle.shutdown();
        // Give the task a moment to observe cancellation and drop the receiver.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = handle.send("{}".into()).await;
        assert!(matches!(result, Err(Error::WebSocketSend(_))));
    }
}
