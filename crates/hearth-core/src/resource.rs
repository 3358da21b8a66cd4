// ── Resource mediation: remote API + offline cache ──
//
// Every resource read/write in the system goes through here. Online,
// calls are proxied to the remote API and mirrored into the cache; when
// the remote is unreachable (globally, or for one call) the cache serves
// reads and absorbs writes, which queue for later reconciliation.
//
// This layer never flips the global online state -- that transition is
// owned by the controller's health-check loop.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hearth_api::RemoteClient;

use crate::cache::ResourceCache;
use crate::controller::OnlineFlag;
use crate::error::CoreError;

// ── Pending writes ───────────────────────────────────────────────────

/// Write verb captured while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Post,
    Put,
    Delete,
}

/// One operation captured while offline, for later reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub method: WriteMethod,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub data: Option<Value>,
}

// ── ResourceHandler ──────────────────────────────────────────────────

/// Mediates CRUD against the remote API with cache fallback.
pub struct ResourceHandler {
    remote: RemoteClient,
    cache: Arc<ResourceCache>,
    token_rx: watch::Receiver<Option<String>>,
    online: OnlineFlag,
    api_prefix: String,
    pending: Mutex<Vec<PendingWrite>>,
}

impl ResourceHandler {
    pub fn new(
        remote: RemoteClient,
        cache: Arc<ResourceCache>,
        token_rx: watch::Receiver<Option<String>>,
        online: OnlineFlag,
        api_prefix: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            cache,
            token_rx,
            online,
            api_prefix: api_prefix.into(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// The shared cache backing this handler.
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Snapshot of the current token, if any.
    fn token(&self) -> Option<String> {
        self.token_rx.borrow().clone()
    }

    fn enqueue(&self, write: PendingWrite) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(write);
        }
    }

    /// Copy of the pending-write queue, in capture order.
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.pending.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Remove and return all pending writes (for an external sync pass).
    pub fn drain_pending(&self) -> Vec<PendingWrite> {
        self.pending
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }

    // ── fetch ────────────────────────────────────────────────────────

    /// GET a resource list (no id) or a single resource.
    ///
    /// Offline -- or on any remote failure -- the cache answers: a list
    /// (possibly empty) without an id, the object or `null` with one.
    /// The offline path never touches the network and never errors.
    pub async fn fetch(&self, resource_type: &str, resource_id: Option<&str>, online: bool) -> Value {
        if online {
            if let Some(token) = self.token() {
                match self.remote.fetch(resource_type, resource_id, &token).await {
                    Ok(data) => {
                        self.mirror_fetch(resource_type, &data, resource_id.is_some());
                        return data;
                    }
                    Err(e) => {
                        error!(resource_type, error = %e, "remote fetch failed, serving from cache");
                    }
                }
            } else {
                warn!(resource_type, "no auth token, serving from cache");
            }
        } else {
            debug!(resource_type, id = ?resource_id, "offline fetch from cache");
        }

        self.fetch_cached(resource_type, resource_id)
    }

    fn fetch_cached(&self, resource_type: &str, resource_id: Option<&str>) -> Value {
        match resource_id {
            Some(id) => self.cache.one(resource_type, id).unwrap_or(Value::Null),
            None => Value::Array(self.cache.all(resource_type)),
        }
    }

    /// Mirror a successful fetch into the cache.
    fn mirror_fetch(&self, resource_type: &str, data: &Value, single: bool) {
        if single {
            self.cache.add(resource_type, data.clone());
        } else if let Value::Array(items) = data {
            for item in items {
                self.cache.add(resource_type, item.clone());
            }
        }
    }

    // ── post ─────────────────────────────────────────────────────────

    /// Create a resource. Online success mirrors the server's response;
    /// failure (or offline mode) stores locally and queues the write.
    pub async fn post(&self, resource_type: &str, data: Value, online: bool) -> Value {
        if online {
            if let Some(token) = self.token() {
                match self.remote.create(resource_type, &data, &token).await {
                    Ok(created) => {
                        self.cache.add(resource_type, created.clone());
                        return created;
                    }
                    Err(e) => {
                        error!(resource_type, error = %e, "remote create failed, queueing");
                    }
                }
            }
        }

        info!(resource_type, "saving resource locally and queueing for later");
        let data = ensure_local_id(data);
        self.cache.add(resource_type, data.clone());
        self.enqueue(PendingWrite {
            method: WriteMethod::Post,
            resource_type: resource_type.to_owned(),
            resource_id: None,
            data: Some(data.clone()),
        });
        data
    }

    // ── put ──────────────────────────────────────────────────────────

    /// Update a resource. Online success merges the server's response
    /// into the cache; failure (or offline) merges the request data and
    /// queues the write.
    pub async fn put(
        &self,
        resource_type: &str,
        resource_id: &str,
        data: Value,
        online: bool,
    ) -> Value {
        if online {
            if let Some(token) = self.token() {
                match self
                    .remote
                    .update(resource_type, resource_id, &data, &token)
                    .await
                {
                    Ok(updated) => {
                        self.cache.update(resource_type, resource_id, &updated);
                        return updated;
                    }
                    Err(e) => {
                        error!(resource_type, resource_id, error = %e, "remote update failed, queueing");
                    }
                }
            }
        }

        info!(resource_type, resource_id, "updating resource locally and queueing for later");
        self.cache.update(resource_type, resource_id, &data);
        self.enqueue(PendingWrite {
            method: WriteMethod::Put,
            resource_type: resource_type.to_owned(),
            resource_id: Some(resource_id.to_owned()),
            data: Some(data.clone()),
        });
        data
    }

    // ── delete ───────────────────────────────────────────────────────

    /// Delete a resource. Failure (or offline) removes it locally and
    /// queues the deletion.
    pub async fn delete(&self, resource_type: &str, resource_id: &str, online: bool) -> Value {
        if online {
            if let Some(token) = self.token() {
                match self.remote.delete(resource_type, resource_id, &token).await {
                    Ok(()) => {
                        self.cache.delete(resource_type, resource_id);
                        return Value::Null;
                    }
                    Err(e) => {
                        error!(resource_type, resource_id, error = %e, "remote delete failed, queueing");
                    }
                }
            }
        }

        info!(resource_type, resource_id, "deleting resource locally and queueing for later");
        self.cache.delete(resource_type, resource_id);
        self.enqueue(PendingWrite {
            method: WriteMethod::Delete,
            resource_type: resource_type.to_owned(),
            resource_id: Some(resource_id.to_owned()),
            data: None,
        });
        Value::Null
    }

    // ── Unified entry point ──────────────────────────────────────────

    /// Dispatch an HTTP-shaped request: strip the API prefix, split the
    /// path into `resource_type[/resource_id]`, route on the method.
    /// The current mode comes from the shared online flag.
    pub async fn handle_request(
        &self,
        method: &str,
        path: &str,
        data: Option<Value>,
    ) -> Result<Value, CoreError> {
        debug!(method, path, "handling resource request");

        let trimmed = path
            .strip_prefix(self.api_prefix.as_str())
            .unwrap_or(path)
            .trim_matches('/');
        let mut parts = trimmed.splitn(2, '/');
        let resource_type = match parts.next() {
            Some(t) if !t.is_empty() => t,
            _ => {
                return Err(CoreError::InvalidPath {
                    path: path.to_owned(),
                })
            }
        };
        let resource_id = parts.next().map(|id| id.trim_matches('/'));

        let online = self.online.get();

        match method.to_ascii_uppercase().as_str() {
            "GET" => Ok(self.fetch(resource_type, resource_id, online).await),
            "POST" => {
                let data = data.ok_or(CoreError::MissingBody {
                    method: "POST".into(),
                })?;
                Ok(self.post(resource_type, data, online).await)
            }
            "PUT" => {
                let id = resource_id.ok_or(CoreError::MissingResourceId {
                    method: "PUT".into(),
                })?;
                let data = data.ok_or(CoreError::MissingBody {
                    method: "PUT".into(),
                })?;
                Ok(self.put(resource_type, id, data, online).await)
            }
            "DELETE" => {
                let id = resource_id.ok_or(CoreError::MissingResourceId {
                    method: "DELETE".into(),
                })?;
                Ok(self.delete(resource_type, id, online).await)
            }
            other => Err(CoreError::UnsupportedMethod {
                method: other.to_owned(),
            }),
        }
    }
}

/// Make an offline-created resource addressable: assign a fresh uuid when
/// the payload has no id field of its own.
fn ensure_local_id(mut data: Value) -> Value {
    if let Value::Object(ref mut map) = data {
        let has_id = map.contains_key("id") || map.contains_key("uuid");
        if !has_id {
            map.insert(
                "uuid".into(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
    }
    data
}
