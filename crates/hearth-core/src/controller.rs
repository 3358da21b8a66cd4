// ── Controller orchestration ──
//
// Wires every component together and owns the process-lifetime loops:
// the hub WebSocket link, the MQTT broker link, the routine event
// consumer, and the periodic health check that flips the shared online
// flag. Message fan-out is fire-and-forget: one task per inbound
// message, no side effect waits for another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use secrecy::ExposeSecret;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hearth_api::{BrokerClient, BrokerHandle, HubClient, HubHandle, RemoteClient, TransportConfig};

use crate::cache::ResourceCache;
use crate::config::BridgeConfig;
use crate::envelope::Envelope;
use crate::error::CoreError;
use crate::message::MessageHandler;
use crate::resource::ResourceHandler;
use crate::routine::{Routine, RoutineAction, RoutineEvent, RoutineManager};
use crate::transform::{self, TransformerRegistry};

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const LOCAL_BROADCAST_CAPACITY: usize = 256;

// ── OnlineFlag ───────────────────────────────────────────────────────

/// Shared online/offline mode, written only by the health-check loop.
/// Readers tolerate a stale value for up to one check interval.
#[derive(Clone, Debug, Default)]
pub struct OnlineFlag(Arc<AtomicBool>);

impl OnlineFlag {
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, online: bool) {
        self.0.store(online, Ordering::Relaxed);
    }
}

// ── Controller ───────────────────────────────────────────────────────

/// The bridge orchestrator. Cheaply cloneable via `Arc`; `run()` spawns
/// the background loops, `shutdown()` cancels and joins them.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: BridgeConfig,
    online: OnlineFlag,
    remote: RemoteClient,
    token_tx: watch::Sender<Option<String>>,
    token_rx: watch::Receiver<Option<String>>,
    cache: Arc<ResourceCache>,
    resources: Arc<ResourceHandler>,
    messages: MessageHandler,
    routines: RoutineManager,
    routine_events: Mutex<Option<mpsc::Receiver<RoutineEvent>>>,
    hub_rules: TransformerRegistry,
    broker_rules: TransformerRegistry,
    local_tx: broadcast::Sender<String>,
    hub: Mutex<Option<HubHandle>>,
    broker: Mutex<Option<BrokerHandle>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Build every component. Does not touch the network -- call
    /// [`run()`](Self::run) to probe the remote API and start the loops.
    pub fn new(config: BridgeConfig) -> Result<Self, CoreError> {
        let transport = TransportConfig::default();
        let remote = RemoteClient::new(config.remote_url(), config.api_prefix.clone(), &transport)?;

        let (token_tx, token_rx) = watch::channel(None);
        let online = OnlineFlag::new(false);

        let cache = Arc::new(ResourceCache::new());
        if let Some(path) = &config.cache_snapshot {
            if path.exists() {
                match cache.load_snapshot(path) {
                    Ok(()) => info!(path = %path.display(), "cache snapshot loaded"),
                    Err(e) => warn!(path = %path.display(), error = %e, "cache snapshot unreadable"),
                }
            }
        }

        let resources = Arc::new(ResourceHandler::new(
            remote.clone(),
            Arc::clone(&cache),
            token_rx.clone(),
            online.clone(),
            config.api_prefix.clone(),
        ));
        let messages = MessageHandler::with_default_handlers(Arc::clone(&resources));
        let (routines, routine_events) = RoutineManager::new();
        let hub_rules = transform::hub_registry()?;
        let broker_rules = transform::broker_registry(Arc::clone(&resources))?;
        let (local_tx, _) = broadcast::channel(LOCAL_BROADCAST_CAPACITY);

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                online,
                remote,
                token_tx,
                token_rx,
                cache,
                resources,
                messages,
                routines,
                routine_events: Mutex::new(Some(routine_events)),
                hub_rules,
                broker_rules,
                local_tx,
                hub: Mutex::new(None),
                broker: Mutex::new(None),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Whether the remote API was reachable at the last health check.
    pub fn online(&self) -> bool {
        self.inner.online.get()
    }

    /// The resource layer, for the local HTTP surface.
    pub fn resources(&self) -> &Arc<ResourceHandler> {
        &self.inner.resources
    }

    /// Subscribe to messages broadcast to local WebSocket clients.
    pub fn subscribe_local(&self) -> broadcast::Receiver<String> {
        self.inner.local_tx.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Probe the remote API once, initialise routines if reachable, and
    /// spawn every long-running loop. Returns once everything is running;
    /// degraded (offline) startup is not an error.
    pub async fn run(&self) -> Result<(), CoreError> {
        match self.inner.remote.health().await {
            Ok(()) => {
                info!("remote API reachable");
                self.inner.online.set(true);
                if let Err(e) = self.authenticate().await {
                    warn!(error = %e, "authentication failed, continuing degraded");
                } else {
                    self.init_routines().await;
                }
            }
            Err(e) => {
                warn!(error = %e, "remote API unreachable, starting in degraded mode");
                self.inner.online.set(false);
            }
        }

        let config = &self.inner.config;

        // Hub link
        let (hub_in_tx, hub_in_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let hub = HubClient::spawn(
            config.hub_ws_url(),
            config.reconnect_delay,
            self.inner.token_rx.clone(),
            hub_in_tx,
            self.inner.cancel.child_token(),
        );
        *self.inner.hub.lock().await = Some(hub);

        // Broker link
        let (broker_in_tx, broker_in_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let broker = BrokerClient::spawn(
            &config.mqtt_host,
            config.mqtt_port,
            &config.device_id,
            broker_in_tx,
            self.inner.cancel.child_token(),
        );
        *self.inner.broker.lock().await = Some(broker);

        let routine_rx = self
            .inner
            .routine_events
            .lock()
            .await
            .take()
            .ok_or_else(|| CoreError::Internal("controller already running".into()))?;

        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(tokio::spawn(hub_pump(self.clone(), hub_in_rx)));
        tasks.push(tokio::spawn(broker_pump(self.clone(), broker_in_rx)));
        tasks.push(tokio::spawn(routine_pump(self.clone(), routine_rx)));
        tasks.push(tokio::spawn(health_task(self.clone())));

        info!("controller running");
        Ok(())
    }

    /// Cancel all background work, join it, and persist the cache
    /// snapshot if one is configured.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        if let Some(path) = &self.inner.config.cache_snapshot {
            match self.inner.cache.save_snapshot(path) {
                Ok(()) => info!(path = %path.display(), "cache snapshot saved"),
                Err(e) => warn!(path = %path.display(), error = %e, "cache snapshot save failed"),
            }
        }

        debug!("controller stopped");
    }

    // ── Remote session ───────────────────────────────────────────────

    /// Exchange credentials for a token and publish it to every
    /// token-watching component (resource layer, hub link).
    async fn authenticate(&self) -> Result<(), CoreError> {
        let config = &self.inner.config;
        let token = self
            .inner
            .remote
            .login(&config.username, &config.password)
            .await?;
        let _ = self
            .inner
            .token_tx
            .send(Some(token.expose_secret().to_owned()));
        info!("authenticated with remote API");
        Ok(())
    }

    /// Fetch routines and actions from the remote API and (re)register
    /// them. Failures leave the previous registration in place.
    async fn init_routines(&self) {
        let routines_raw = self.inner.resources.fetch("routines", None, true).await;
        let actions_raw = self.inner.resources.fetch("actions", None, true).await;

        let routines: Vec<Routine> = match serde_json::from_value(routines_raw) {
            Ok(routines) => routines,
            Err(e) => {
                warn!(error = %e, "could not parse routines, keeping previous registration");
                return;
            }
        };
        let actions: Vec<RoutineAction> = match serde_json::from_value(actions_raw) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(error = %e, "could not parse actions, keeping previous registration");
                return;
            }
        };

        self.inner.routines.register_routines(routines, actions).await;
    }

    // ── Message routing ──────────────────────────────────────────────

    /// (a) reactive routine dispatch and (b) resource side effects for
    /// one inbound message. Non-canonical frames (broker payloads like
    /// `"on"`) are expected and skipped quietly; canonical frames missing
    /// an action are logged and dropped.
    async fn dispatch_side_effects(&self, raw: &str) {
        match Envelope::parse(raw) {
            Ok(envelope) => {
                self.inner.routines.handle_message(&envelope).await;
                self.inner.messages.handle_envelope(&envelope).await;
            }
            Err(CoreError::MissingAction) => {
                warn!("message has no action, dropping");
            }
            Err(_) => {
                debug!("inbound frame is not a canonical envelope");
            }
        }
    }

    /// A message from the hub: side effects, then transform on `dest`
    /// and fan out to the broker and local clients.
    pub async fn handle_hub_message(&self, raw: String) {
        info!("handling hub message");
        self.dispatch_side_effects(&raw).await;

        for (message, destination) in self.inner.hub_rules.transform(&raw, None).await {
            self.publish_broker(&destination, message.clone()).await;
            let _ = self.inner.local_tx.send(message);
        }
    }

    /// A message from the broker: side effects, then transform on the
    /// topic and fan out to the hub and local clients.
    pub async fn handle_broker_message(&self, topic: String, payload: String) {
        info!(topic, "handling broker message");
        self.dispatch_side_effects(&payload).await;

        for (message, _destination) in
            self.inner.broker_rules.transform(&payload, Some(&topic)).await
        {
            self.send_hub(message.clone()).await;
            let _ = self.inner.local_tx.send(message);
        }
    }

    /// A frame from a local WebSocket client: broadcast it to every
    /// local client (sender included), run side effects, keep the hub in
    /// the loop, and transform towards the broker.
    pub async fn handle_local_message(&self, raw: String) {
        info!("handling local client message");
        let _ = self.inner.local_tx.send(raw.clone());

        self.dispatch_side_effects(&raw).await;
        self.send_hub(raw.clone()).await;

        for (message, destination) in self.inner.hub_rules.transform(&raw, None).await {
            self.publish_broker(&destination, message).await;
        }
    }

    /// A routine fired: build the canonical envelope and route it like an
    /// outbound message. Reactive routine re-dispatch is deliberately
    /// skipped so a routine cannot trigger itself.
    pub async fn handle_routine_event(&self, event: RoutineEvent) {
        let envelope = routine_envelope(&self.inner.config.device_id, event);
        let raw = envelope.to_json();

        self.inner.messages.handle_envelope(&envelope).await;
        self.send_hub(raw.clone()).await;
        let _ = self.inner.local_tx.send(raw.clone());

        for (message, destination) in self.inner.hub_rules.transform(&raw, None).await {
            self.publish_broker(&destination, message).await;
        }
    }

    // ── Transport forwarding ─────────────────────────────────────────

    async fn publish_broker(&self, destination: &str, message: String) {
        if destination.is_empty() {
            debug!("emission has no destination, not publishing");
            return;
        }
        let broker = self.inner.broker.lock().await;
        let Some(handle) = broker.as_ref() else {
            debug!("broker link not running, dropping publish");
            return;
        };
        if let Err(e) = handle.publish(destination, message).await {
            error!(destination, error = %e, "broker publish failed");
        }
    }

    async fn send_hub(&self, message: String) {
        let hub = self.inner.hub.lock().await;
        let Some(handle) = hub.as_ref() else {
            debug!("hub link not running, dropping send");
            return;
        };
        if let Err(e) = handle.send(message).await {
            error!(error = %e, "hub send failed");
        }
    }
}

// ── Routine event translation ────────────────────────────────────────

/// Turn a routine event into a canonical envelope. The destination is
/// derived from the action's domain and the `device_id` param when both
/// are present (`plug__set` + device `d1` → `plugs/d1/command`), so the
/// normal transformer rules can route it to the device.
fn routine_envelope(src: &str, event: RoutineEvent) -> Envelope {
    let dest = event
        .action_type
        .split_once("__")
        .and_then(|(domain, _)| {
            event
                .params
                .get("device_id")
                .and_then(|v| v.as_str())
                .map(|id| format!("{domain}s/{id}/command"))
        })
        .unwrap_or_default();

    Envelope::new(src, dest, event.action_type, Some(event.params))
}

// ── Background tasks ─────────────────────────────────────────────────

/// Spawn one task per hub message -- no message blocks another.
async fn hub_pump(controller: Controller, mut rx: mpsc::Receiver<String>) {
    let cancel = controller.inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                let controller = controller.clone();
                tokio::spawn(async move { controller.handle_hub_message(message).await });
            }
        }
    }
}

async fn broker_pump(controller: Controller, mut rx: mpsc::Receiver<(String, String)>) {
    let cancel = controller.inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => {
                let Some((topic, payload)) = message else { break };
                let controller = controller.clone();
                tokio::spawn(async move { controller.handle_broker_message(topic, payload).await });
            }
        }
    }
}

async fn routine_pump(controller: Controller, mut rx: mpsc::Receiver<RoutineEvent>) {
    let cancel = controller.inner.cancel.clone();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                let controller = controller.clone();
                tokio::spawn(async move { controller.handle_routine_event(event).await });
            }
        }
    }
}

/// Periodic health probe. Flips the shared online flag; an
/// offline→online transition re-authenticates and re-registers routines,
/// online→offline is nothing but the flag flip.
async fn health_task(controller: Controller) {
    let cancel = controller.inner.cancel.clone();
    let mut interval = tokio::time::interval(controller.inner.config.health_interval);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let was_online = controller.inner.online.get();
                match controller.inner.remote.health().await {
                    Ok(()) => {
                        controller.inner.online.set(true);
                        if !was_online {
                            info!("remote API back online");
                            match controller.authenticate().await {
                                Ok(()) => controller.init_routines().await,
                                Err(e) => warn!(error = %e, "re-authentication failed"),
                            }
                        }
                    }
                    Err(e) => {
                        controller.inner.online.set(false);
                        if was_online {
                            warn!(error = %e, "remote API went offline");
                        }
                    }
                }
            }
        }
    }
}
