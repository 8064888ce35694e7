//! Components
//!
//! A component is the unit of execution: a name, a bounded inbound queue, a
//! handler table filled in at construction, an observer table filled in by
//! wiring, and one task running [`run_component_loop`].
//!
//! # Lifecycle
//!
//! `Created → Active → Stopping → Stopped`. A stopping component keeps
//! draining whatever is already queued before its task exits.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{RuntimeError, RuntimeResult};
use crate::event::{Envelope, Event};
use crate::request::PendingRequest;
use crate::runtime::Runtime;
use crate::state::{DispatchState, StateSet};

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Current lifecycle stage of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed and registered, loop not running yet
    Created = 0,
    /// Loop running and accepting work
    Active = 1,
    /// Draining its backlog before exiting
    Stopping = 2,
    /// Loop exited
    Stopped = 3,
}

impl Lifecycle {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Active,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn is_active(&self) -> bool {
        *self == Lifecycle::Active
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Created => write!(f, "created"),
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::Stopping => write!(f, "stopping"),
            Lifecycle::Stopped => write!(f, "stopped"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased async event handler
pub type Handler<E> = Arc<dyn Fn(Delivery<E>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type Teardown = Box<dyn FnOnce() + Send>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registered handler so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

fn boxed_handler<E, F, Fut>(handler: F) -> Handler<E>
where
    E: Event,
    F: Fn(Delivery<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |delivery| handler(delivery).boxed())
}

/// One entry in a component's handler table
pub struct HandlerEntry<E: Event> {
    id: HandlerId,
    handler: Handler<E>,
    states: StateSet,
    /// Registered through `subscribe`, i.e. wired to the producer
    observe: bool,
}

impl<E: Event> HandlerEntry<E> {
    fn new(handler: Handler<E>, states: StateSet, observe: bool) -> Self {
        Self {
            id: HandlerId::next(),
            handler,
            states,
            observe,
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn states(&self) -> &StateSet {
        &self.states
    }

    pub fn observes(&self) -> bool {
        self.observe
    }
}

impl<E: Event> Clone for HandlerEntry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
            states: self.states.clone(),
            observe: self.observe,
        }
    }
}

/// What a handler receives for one event
pub struct Delivery<E: Event> {
    pub event: E,
    pub state: Option<DispatchState>,
    pub request: Option<PendingRequest<E>>,
    pub ctx: AppContext<E>,
}

impl<E: Event> Delivery<E> {
    /// Reply to the request this event arrived with
    pub async fn reply(&self, reply: E) -> RuntimeResult<()> {
        let request = self.request.as_ref().ok_or(RuntimeError::NoPendingRequest)?;
        self.ctx.reply(request, reply).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// App Context
// ─────────────────────────────────────────────────────────────────────────────

/// A component's view of the runtime, passed to every handler
pub struct AppContext<E: Event> {
    name: Arc<str>,
    runtime: Runtime<E>,
}

impl<E: Event> AppContext<E> {
    pub(crate) fn new(name: &str, runtime: Runtime<E>) -> Self {
        Self {
            name: Arc::from(name),
            runtime,
        }
    }

    /// Registry name of the component
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime(&self) -> &Runtime<E> {
        &self.runtime
    }

    /// Send an event to the component registered as `destination`
    pub async fn send_event(&self, destination: &str, event: E, state: Option<DispatchState>) {
        self.runtime
            .deliver(Some(self.name.as_ref()), destination, Envelope::event(event, state))
            .await;
    }

    /// Send an event to every observer of its kind on this component
    pub async fn broadcast(&self, event: E, state: Option<DispatchState>) {
        self.runtime.broadcast(&self.name, event, state).await;
    }

    /// Send a request and wait for its reply
    ///
    /// There is no timeout: wrap the call in `tokio::time::timeout` when the
    /// destination might never answer.
    pub async fn request(&self, destination: &str, event: E) -> RuntimeResult<E> {
        self.runtime.request(&self.name, destination, event).await
    }

    /// Send a request whose reply comes back as an ordinary event
    pub async fn post_request(&self, destination: &str, event: E) {
        self.runtime.post_request(&self.name, destination, event).await;
    }

    pub async fn reply(&self, request: &PendingRequest<E>, reply: E) -> RuntimeResult<()> {
        self.runtime.reply(request, reply).await
    }

    /// Add a direct handler to this component while it runs
    pub fn register_handler<F, Fut>(
        &self,
        kind: E::Kind,
        states: impl Into<StateSet>,
        handler: F,
    ) -> RuntimeResult<HandlerId>
    where
        F: Fn(Delivery<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.runtime.register_handler(&self.name, kind, states, handler)
    }

    pub fn unregister_handler(&self, kind: E::Kind, id: HandlerId) -> RuntimeResult<bool> {
        self.runtime.unregister_handler(&self.name, kind, id)
    }
}

impl<E: Event> Clone for AppContext<E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            runtime: self.runtime.clone(),
        }
    }
}

impl<E: Event> fmt::Debug for AppContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext").field("name", &self.name).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// App Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Collects a component's handlers during construction
pub struct AppBuilder<E: Event> {
    name: String,
    handlers: HashMap<E::Kind, Vec<HandlerEntry<E>>>,
    provides: Vec<E::Kind>,
    teardown: Option<Teardown>,
}

impl<E: Event> AppBuilder<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
            provides: Vec::new(),
            teardown: None,
        }
    }

    /// Registry name the component will be registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle `kind` and observe it on its producer
    pub fn subscribe<F, Fut>(&mut self, kind: E::Kind, states: impl Into<StateSet>, handler: F) -> &mut Self
    where
        F: Fn(Delivery<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_handler(kind, states.into(), true, handler)
    }

    /// Handle `kind` only when it is sent here directly
    pub fn handle<F, Fut>(&mut self, kind: E::Kind, states: impl Into<StateSet>, handler: F) -> &mut Self
    where
        F: Fn(Delivery<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_handler(kind, states.into(), false, handler)
    }

    /// Declare that this component emits `kind` although it originates elsewhere
    pub fn provide(&mut self, kind: E::Kind) -> &mut Self {
        if !self.provides.contains(&kind) {
            self.provides.push(kind);
        }
        self
    }

    /// Hook run once after the component's loop has exited
    pub fn on_close(&mut self, hook: impl FnOnce() + Send + 'static) -> &mut Self {
        self.teardown = Some(Box::new(hook));
        self
    }

    fn add_handler<F, Fut>(&mut self, kind: E::Kind, states: StateSet, observe: bool, handler: F) -> &mut Self
    where
        F: Fn(Delivery<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(HandlerEntry::new(boxed_handler(handler), states, observe));
        self
    }

    pub(crate) fn build(self, queue_capacity: usize) -> Component<E> {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (exited, _) = watch::channel(false);
        Component {
            name: self.name,
            handlers: RwLock::new(self.handlers),
            provides: self.provides,
            observers: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            lifecycle: AtomicU8::new(Lifecycle::Created as u8),
            task: Mutex::new(None),
            exited,
            teardown: Mutex::new(self.teardown),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component
// ─────────────────────────────────────────────────────────────────────────────

/// A registered component
pub struct Component<E: Event> {
    name: String,
    handlers: RwLock<HashMap<E::Kind, Vec<HandlerEntry<E>>>>,
    provides: Vec<E::Kind>,
    /// kind -> observer name -> accepted states
    observers: DashMap<E::Kind, HashMap<String, StateSet>>,
    tx: mpsc::Sender<Envelope<E>>,
    rx: Mutex<Option<mpsc::Receiver<Envelope<E>>>>,
    lifecycle: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Flipped to `true` once the loop has exited (or will never run)
    exited: watch::Sender<bool>,
    teardown: Mutex<Option<Teardown>>,
}

impl<E: Event> Component<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> Result<(), Lifecycle> {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(Lifecycle::from_u8)
    }

    /// Number of events waiting in the inbound queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Kinds this component declared it emits on behalf of other origins
    pub fn provides(&self) -> &[E::Kind] {
        &self.provides
    }

    pub fn provides_kind(&self, kind: E::Kind) -> bool {
        self.provides.contains(&kind)
    }

    /// Snapshot of the handler table, keyed by kind
    pub fn handler_table(&self) -> HashMap<E::Kind, Vec<HandlerEntry<E>>> {
        self.handlers.read().clone()
    }

    /// Handlers for `kind` that accept `state`, in registration order
    pub fn handlers_for(&self, kind: E::Kind, state: Option<DispatchState>) -> Vec<Handler<E>> {
        self.handlers
            .read()
            .get(&kind)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.states.admits(state))
                    .map(|e| Arc::clone(&e.handler))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Observed kinds with the states each handler accepts
    pub(crate) fn observed_kinds(&self) -> Vec<(E::Kind, StateSet)> {
        self.handlers
            .read()
            .iter()
            .flat_map(|(kind, entries)| {
                entries
                    .iter()
                    .filter(|e| e.observe)
                    .map(move |e| (*kind, e.states.clone()))
            })
            .collect()
    }

    /// Add a direct handler after construction
    ///
    /// The handler is not wired to any producer; combine with
    /// `Runtime::observe` to receive broadcasts of `kind`.
    pub fn register_handler<F, Fut>(&self, kind: E::Kind, states: impl Into<StateSet>, handler: F) -> HandlerId
    where
        F: Fn(Delivery<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry = HandlerEntry::new(boxed_handler(handler), states.into(), false);
        let id = entry.id;
        self.handlers.write().entry(kind).or_default().push(entry);
        id
    }

    /// Remove a handler; the kind disappears from the table with its last handler
    pub fn unregister_handler(&self, kind: E::Kind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(entries) = handlers.get_mut(&kind) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    // ── Observer table ──────────────────────────────────────────────────────

    /// Register `name` as an observer of `kind`; repeated calls merge states
    pub fn register_observer(&self, kind: E::Kind, name: &str, states: &StateSet) {
        let mut observers = self.observers.entry(kind).or_default();
        observers
            .entry(name.to_string())
            .and_modify(|existing| existing.merge(states))
            .or_insert_with(|| states.clone());
    }

    pub fn unregister_observer(&self, kind: E::Kind, name: &str) {
        if let Some(mut observers) = self.observers.get_mut(&kind) {
            observers.remove(name);
        }
    }

    /// Drop `name` from every observer list
    pub fn unregister_observer_all(&self, name: &str) {
        for mut entry in self.observers.iter_mut() {
            entry.value_mut().remove(name);
        }
    }

    /// Observers of `kind` that accept events in `state`
    pub fn observers_for(&self, kind: E::Kind, state: Option<DispatchState>) -> Vec<String> {
        self.observers
            .get(&kind)
            .map(|observers| {
                observers
                    .iter()
                    .filter(|(_, states)| states.admits(state))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// States registered for `observer` on `kind`
    pub fn observer_states(&self, kind: E::Kind, observer: &str) -> Option<StateSet> {
        self.observers.get(&kind)?.get(observer).cloned()
    }

    /// Snapshot of the observer table
    pub fn observer_table(&self) -> Vec<(E::Kind, HashMap<String, StateSet>)> {
        self.observers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    // ── Queue & task ────────────────────────────────────────────────────────

    pub(crate) fn sender(&self) -> mpsc::Sender<Envelope<E>> {
        self.tx.clone()
    }

    /// Spawn the loop task. Returns `false` if the component was not `Created`.
    pub(crate) fn start(self: &Arc<Self>, runtime: Runtime<E>) -> bool {
        if self.transition(Lifecycle::Created, Lifecycle::Active).is_err() {
            return false;
        }
        let Some(rx) = self.rx.lock().take() else {
            self.set_lifecycle(Lifecycle::Stopped);
            self.mark_exited();
            return false;
        };

        let component = Arc::clone(self);
        let handle = tokio::spawn(run_component_loop(component, rx, runtime));
        *self.task.lock() = Some(handle);
        tracing::debug!(component = %self.name, "Component started");
        true
    }

    /// Stop accepting new work, drain the backlog, wait for the task, then
    /// run the teardown hook.
    ///
    /// Safe to call concurrently: every caller returns only after the loop
    /// has exited.
    pub(crate) async fn stop(&self) -> RuntimeResult<()> {
        loop {
            match self.transition(Lifecycle::Active, Lifecycle::Stopping) {
                Ok(()) => {
                    // Unblocks a loop parked on an empty queue
                    if self.tx.send(Envelope::Stop).await.is_err() {
                        tracing::debug!(component = %self.name, "Queue closed before stop sentinel");
                    }
                    break;
                }
                Err(Lifecycle::Created) => {
                    if self.transition(Lifecycle::Created, Lifecycle::Stopped).is_ok() {
                        let discarded = self.queued();
                        if discarded > 0 {
                            tracing::warn!(component = %self.name, discarded, "Stopped before start, queued events discarded");
                        }
                        self.mark_exited();
                        break;
                    }
                    // Started concurrently, stop it as an active component
                }
                Err(_) => break,
            }
        }

        let handle = self.task.lock().take();
        let joined = match handle {
            Some(handle) => {
                let joined = handle.await;
                // A panicked loop never signals its own exit
                self.set_lifecycle(Lifecycle::Stopped);
                self.mark_exited();
                joined
            }
            None => {
                self.wait_exited().await;
                Ok(())
            }
        };

        self.close();

        if let Err(e) = joined {
            tracing::error!(component = %self.name, error = ?e, "Component task panicked");
            return Err(RuntimeError::TaskPanicked(self.name.clone()));
        }
        Ok(())
    }

    fn mark_exited(&self) {
        self.exited.send_replace(true);
    }

    async fn wait_exited(&self) {
        let mut exited = self.exited.subscribe();
        if exited.wait_for(|done| *done).await.is_err() {
            tracing::debug!(component = %self.name, "Exit signal dropped");
        }
    }

    /// Run the teardown hook if it has not run yet
    pub(crate) fn close(&self) {
        let hook = self.teardown.lock().take();
        if let Some(hook) = hook {
            tracing::debug!(component = %self.name, "Running teardown hook");
            if std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::error!(component = %self.name, "Teardown hook panicked");
            }
        }
    }

    /// Invoke every matching handler for one event, in registration order
    async fn dispatch(
        &self,
        ctx: &AppContext<E>,
        event: E,
        state: Option<DispatchState>,
        request: Option<PendingRequest<E>>,
    ) {
        let kind = event.kind();
        let handlers = self.handlers_for(kind, state);

        if handlers.is_empty() {
            tracing::debug!(component = %self.name, ?kind, ?state, "No handler for event");
            return;
        }

        for handler in handlers {
            let delivery = Delivery {
                event: event.clone(),
                state,
                request: request.clone(),
                ctx: ctx.clone(),
            };

            let outcome = AssertUnwindSafe(async move { handler(delivery).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        component = %self.name,
                        ?kind,
                        error = %e,
                        "Handler failed"
                    );
                }
                Err(_) => {
                    tracing::error!(component = %self.name, ?kind, "Handler panicked");
                }
            }
        }
    }
}

impl<E: Event> fmt::Debug for Component<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .field("queued", &self.queued())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component Task Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Run a component's loop until it is stopped and its queue is empty
async fn run_component_loop<E: Event>(
    component: Arc<Component<E>>,
    mut rx: mpsc::Receiver<Envelope<E>>,
    runtime: Runtime<E>,
) {
    let ctx = AppContext::new(&component.name, runtime);
    tracing::info!(component = %component.name, "Component loop running");

    loop {
        if !component.lifecycle().is_active() && rx.is_empty() {
            break;
        }

        let Some(envelope) = rx.recv().await else {
            break;
        };

        match envelope {
            Envelope::Stop => continue,
            Envelope::Event { event, state, request } => {
                component.dispatch(&ctx, event, state, request).await;
            }
        }
    }

    component.set_lifecycle(Lifecycle::Stopped);
    component.mark_exited();
    tracing::info!(component = %component.name, "Component loop exited");
}
