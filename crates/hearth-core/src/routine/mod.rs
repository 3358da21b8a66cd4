// ── Routine scheduling and reactive dispatch ──
//
// Routines come from the remote API as declarative trigger/condition/
// action specs. Each clock-style trigger becomes a timer task; each
// action-type trigger becomes an entry in a binding table consulted for
// every inbound message. `register_routines` rebuilds the whole picture
// from scratch and is called again on every routine refresh, so it first
// cancels and *joins* every timer it previously armed -- re-registration
// must never leave a duplicate timer running.

pub mod expr;
pub mod trigger;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::envelope::Envelope;

use self::trigger::Trigger;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── Remote resource shapes ───────────────────────────────────────────

/// A routine as served by the remote API.
#[derive(Debug, Clone, Deserialize)]
pub struct Routine {
    #[serde(default)]
    pub uuid: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub triggers: Option<String>,
    #[serde(default)]
    pub repeat_interval: Option<String>,
    #[serde(default)]
    pub eval_condition: Option<String>,
}

/// An action as served by the remote API; `routine` is the back-reference
/// to its owning routine's uuid.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutineAction {
    #[serde(default)]
    pub uuid: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub eval_params: Option<String>,
    #[serde(default)]
    pub routine: String,
}

fn default_active() -> bool {
    true
}

// ── Events ───────────────────────────────────────────────────────────

/// Emitted whenever a routine action executes. The controller turns
/// these into outbound canonical messages.
#[derive(Debug, Clone)]
pub struct RoutineEvent {
    pub routine_uuid: String,
    pub routine_name: String,
    pub action_type: String,
    pub params: Value,
}

// ── Internal state ───────────────────────────────────────────────────

/// A routine joined with its actions, shared between every task that
/// references it.
struct RoutineSpec {
    routine: Routine,
    actions: Vec<RoutineAction>,
    runs: AtomicU64,
}

struct ManagerState {
    /// Cancels every timer task of the current registration generation.
    cancel: CancellationToken,
    /// Owns the timer tasks so re-registration can join them.
    timers: JoinSet<()>,
    /// action type → routines bound to it, in registration order.
    bound: HashMap<String, Vec<Arc<RoutineSpec>>>,
}

// ── RoutineManager ───────────────────────────────────────────────────

/// Owns the scheduled and reactive state for all registered routines.
pub struct RoutineManager {
    events_tx: mpsc::Sender<RoutineEvent>,
    state: Mutex<ManagerState>,
}

impl RoutineManager {
    /// Create a manager and the receiving end of its event channel.
    pub fn new() -> (Self, mpsc::Receiver<RoutineEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            events_tx,
            state: Mutex::new(ManagerState {
                cancel: CancellationToken::new(),
                timers: JoinSet::new(),
                bound: HashMap::new(),
            }),
        };
        (manager, events_rx)
    }

    /// Replace all registered routines.
    ///
    /// Cancels every previously armed timer and waits for those tasks to
    /// finish before arming anything new -- the barrier is what makes
    /// repeated registration (periodic refresh from the remote API) safe
    /// from duplicate firings.
    pub async fn register_routines(&self, routines: Vec<Routine>, actions: Vec<RoutineAction>) {
        let mut state = self.state.lock().await;

        state.cancel.cancel();
        while state.timers.join_next().await.is_some() {}
        state.cancel = CancellationToken::new();
        state.bound.clear();

        info!(count = routines.len(), "registering routines");

        // Join actions to their routines.
        let mut by_routine: HashMap<String, Vec<RoutineAction>> = HashMap::new();
        for action in actions {
            if action.active {
                by_routine.entry(action.routine.clone()).or_default().push(action);
            }
        }

        let now = Local::now().naive_local();

        for routine in routines {
            if !routine.active {
                debug!(name = routine.name, "skipping inactive routine");
                continue;
            }

            let spec = Arc::new(RoutineSpec {
                actions: by_routine.remove(&routine.uuid).unwrap_or_default(),
                routine,
                runs: AtomicU64::new(0),
            });

            let triggers = spec.routine.triggers.clone().unwrap_or_default();

            // No triggers but an interval: run once immediately, then
            // repeat on the interval.
            if triggers.trim().is_empty() {
                if let Some(interval_spec) = spec.routine.repeat_interval.as_deref() {
                    let Some(interval) = trigger::parse_interval(interval_spec) else {
                        error!(
                            name = spec.routine.name,
                            repeat_interval = interval_spec,
                            "invalid repeat interval, skipping routine"
                        );
                        continue;
                    };
                    info!(
                        name = spec.routine.name,
                        "routine has no triggers, running immediately with repeat"
                    );
                    let task_spec = Arc::clone(&spec);
                    let cancel = state.cancel.clone();
                    let events_tx = self.events_tx.clone();
                    state.timers.spawn(async move {
                        handle_action(&task_spec, &events_tx).await;
                        let first_repeat = Local::now().naive_local() + interval;
                        run_schedule(task_spec, first_repeat, cancel, events_tx).await;
                    });
                }
                continue;
            }

            for token in triggers.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                match trigger::parse_trigger(token, now) {
                    Trigger::At(when) => {
                        info!(name = spec.routine.name, %when, "scheduling routine");
                        let task_spec = Arc::clone(&spec);
                        let cancel = state.cancel.clone();
                        let events_tx = self.events_tx.clone();
                        state.timers.spawn(async move {
                            run_schedule(task_spec, when, cancel, events_tx).await;
                        });
                    }
                    Trigger::Action(action_type) => {
                        info!(
                            name = spec.routine.name,
                            action_type, "binding routine to action type"
                        );
                        state
                            .bound
                            .entry(action_type)
                            .or_default()
                            .push(Arc::clone(&spec));
                    }
                }
            }
        }
    }

    /// Reactive dispatch: run every routine bound to the envelope's
    /// action type. Envelopes without an action are a no-op.
    pub async fn handle_message(&self, envelope: &Envelope) {
        if envelope.action.is_empty() {
            return;
        }

        let bound = {
            let state = self.state.lock().await;
            state.bound.get(&envelope.action).cloned()
        };

        let Some(routines) = bound else {
            debug!(action = envelope.action, "no routines bound to action type");
            return;
        };

        for spec in routines {
            handle_action(&spec, &self.events_tx).await;
        }
    }
}

// ── Execution ────────────────────────────────────────────────────────

/// Expression context for one execution: the routine's run counter plus
/// the local clock.
fn execution_context(spec: &RoutineSpec, now: NaiveDateTime) -> expr::Context {
    let mut ctx = expr::Context::new();
    ctx.insert("runs", Value::from(spec.runs.load(Ordering::Relaxed)));
    ctx.insert("hour", Value::from(now.hour()));
    ctx.insert("minute", Value::from(now.minute()));
    ctx.insert("second", Value::from(now.second()));
    ctx.insert(
        "weekday",
        Value::from(now.weekday().num_days_from_monday()),
    );
    ctx
}

/// Evaluate the routine's condition and, when it holds, emit one event
/// per action. Failures are contained per routine and per action.
async fn handle_action(spec: &RoutineSpec, events_tx: &mpsc::Sender<RoutineEvent>) {
    let ctx = execution_context(spec, Local::now().naive_local());

    let condition_src = spec.routine.eval_condition.as_deref().unwrap_or_default();
    let condition = match expr::eval_condition(condition_src, &ctx) {
        Ok(result) => result,
        Err(e) => {
            // Fail safe: a broken condition skips execution, nothing more.
            error!(
                name = spec.routine.name,
                condition = condition_src,
                error = %e,
                "failed to evaluate condition"
            );
            false
        }
    };

    if !condition {
        debug!(name = spec.routine.name, "condition not met, skipping");
        return;
    }

    spec.runs.fetch_add(1, Ordering::Relaxed);

    for action in &spec.actions {
        let params_src = action.eval_params.as_deref().unwrap_or_default();
        let params = match expr::eval_params(params_src, &ctx) {
            Ok(params) => params,
            Err(e) => {
                error!(
                    name = spec.routine.name,
                    action_type = action.action_type,
                    error = %e,
                    "failed to evaluate action params, skipping action"
                );
                continue;
            }
        };

        info!(
            name = spec.routine.name,
            action_type = action.action_type,
            "executing action"
        );
        let event = RoutineEvent {
            routine_uuid: spec.routine.uuid.clone(),
            routine_name: spec.routine.name.clone(),
            action_type: action.action_type.clone(),
            params,
        };
        if events_tx.send(event).await.is_err() {
            return; // consumer gone, nothing to execute against
        }
    }
}

/// Timer task for one (routine, trigger) pair: sleep until the trigger
/// time, execute, then either re-arm on the repeat interval or finish.
async fn run_schedule(
    spec: Arc<RoutineSpec>,
    mut trigger_time: NaiveDateTime,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<RoutineEvent>,
) {
    loop {
        let now = Local::now().naive_local();
        if let Ok(delay) = (trigger_time - now).to_std() {
            debug!(
                name = spec.routine.name,
                delay_secs = delay.as_secs(),
                "routine timer armed"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        // Past instants fire immediately.

        if cancel.is_cancelled() {
            return;
        }

        handle_action(&spec, &events_tx).await;

        let Some(interval_spec) = spec.routine.repeat_interval.as_deref() else {
            return;
        };
        let Some(interval) = trigger::parse_interval(interval_spec) else {
            error!(
                name = spec.routine.name,
                repeat_interval = interval_spec,
                "invalid repeat interval, not re-arming"
            );
            return;
        };

        trigger_time =
            trigger::advance_past(trigger_time, interval, Local::now().naive_local());
        debug!(name = spec.routine.name, next = %trigger_time, "routine will repeat");
    }
}
