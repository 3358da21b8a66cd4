// hearth-core: domain layer between the transports (hearth-api) and the
// daemon binary. Owns the canonical envelope, the offline-capable resource
// layer, message transformation/dispatch, routines, and the orchestrator.

pub mod cache;
pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod message;
pub mod resource;
pub mod routine;
pub mod transform;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::ResourceCache;
pub use config::BridgeConfig;
pub use controller::{Controller, OnlineFlag};
pub use envelope::Envelope;
pub use error::CoreError;
pub use message::MessageHandler;
pub use resource::{PendingWrite, ResourceHandler, WriteMethod};
pub use routine::{Routine, RoutineAction, RoutineEvent, RoutineManager};
pub use transform::{TransformerRegistry, Transformer};
