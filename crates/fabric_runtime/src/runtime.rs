//! Runtime
//!
//! The registry of live components and the operations that move events
//! between them. A `Runtime` is a cheap, cloneable handle; construct one at
//! process start and pass it to whatever needs registry access.
//!
//! Startup runs in order: resolve → create contexts → instantiate → wire
//! observers → start. Registry mutations take one coarse lock that is never
//! held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::component::{AppBuilder, Component, Delivery, HandlerId, Lifecycle};
use crate::config::{QueueFullPolicy, RuntimeConfig};
use crate::context::Contexts;
use crate::error::{RuntimeError, RuntimeResult};
use crate::event::{Envelope, Event, EventKind};
use crate::loader::{self, LoadPlan};
use crate::report::{ComponentReport, ContextReport, RuntimeReport};
use crate::request::{PendingRequest, ReplyTarget};
use crate::spec::{AppSpec, ContextSpec, Resolver};
use crate::state::{DispatchState, StateSet};

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

struct Registry<E: Event> {
    components: HashMap<String, Arc<Component<E>>>,
    /// Instantiation order, used for start and reverse teardown
    order: Vec<String>,
}

impl<E: Event> Registry<E> {
    fn new() -> Self {
        Self {
            components: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn remove(&mut self, name: &str) -> Option<Arc<Component<E>>> {
        let component = self.components.remove(name)?;
        self.order.retain(|n| n != name);
        Some(component)
    }

    fn ordered(&self) -> Vec<Arc<Component<E>>> {
        self.order
            .iter()
            .filter_map(|name| self.components.get(name).cloned())
            .collect()
    }
}

/// What one load has added so far; undone if the load fails
#[derive(Default)]
struct Installed {
    components: Vec<String>,
    contexts: Vec<String>,
}

struct RuntimeInner<E: Event> {
    config: RuntimeConfig,
    registry: RwLock<Registry<E>>,
    contexts: RwLock<Contexts>,
    /// kind -> registry name of its declared provider
    providers: RwLock<HashMap<E::Kind, String>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide authority over components and contexts
pub struct Runtime<E: Event> {
    inner: Arc<RuntimeInner<E>>,
}

impl<E: Event> Clone for Runtime<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Event> Default for Runtime<E> {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl<E: Event> Runtime<E> {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                registry: RwLock::new(Registry::new()),
                contexts: RwLock::new(Contexts::new()),
                providers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // ── Startup ─────────────────────────────────────────────────────────────

    /// Resolve `requested`, then create, instantiate, wire and start everything.
    ///
    /// Topology errors abort before any component runs; components and
    /// contexts added by a failed call are removed again.
    pub async fn run_apps<R, I, S>(&self, resolver: &R, requested: I) -> RuntimeResult<LoadPlan<E>>
    where
        R: Resolver<E> + ?Sized,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut plan = loader::resolve(resolver, requested)?;

        let mut installed = Installed::default();
        if let Err(e) = self.install(resolver, &mut plan, &mut installed) {
            error!(error = %e, "Load aborted");
            self.rollback(&installed);
            return Err(e);
        }

        self.wire_observers();
        self.report_bricks();
        self.start();
        Ok(plan)
    }

    /// Install `plan`, then keep loading the declared providers of kinds the
    /// new handlers subscribe to until nothing is missing
    fn install<R>(&self, resolver: &R, plan: &mut LoadPlan<E>, installed: &mut Installed) -> RuntimeResult<()>
    where
        R: Resolver<E> + ?Sized,
    {
        let mut apps = plan.apps.clone();
        let mut bindings = plan.contexts.clone();

        loop {
            let contexts = self.create_contexts_tracked(&bindings, installed)?;
            let components = self.instantiate_all(&apps, &contexts)?;
            installed
                .components
                .extend(components.iter().map(|c| c.name().to_string()));

            let missing = self.missing_providers(resolver, plan, installed);
            self.bind_providers(plan);
            if missing.is_empty() {
                return Ok(());
            }

            info!(providers = ?missing, "Loading providers of subscribed kinds");
            let (known_apps, known_bindings) = (plan.apps.len(), plan.contexts.len());
            plan.extend(loader::resolve(resolver, &missing)?)?;

            apps = plan.apps[known_apps..].to_vec();
            bindings = plan.contexts[known_bindings..].to_vec();
            if apps.is_empty() && bindings.is_empty() {
                return Ok(());
            }
        }
    }

    /// Declared providers of subscribed kinds that are neither planned nor
    /// registered; records every provider it sees on `plan`
    fn missing_providers<R>(&self, resolver: &R, plan: &mut LoadPlan<E>, installed: &Installed) -> Vec<String>
    where
        R: Resolver<E> + ?Sized,
    {
        let mut missing: Vec<String> = Vec::new();

        for name in &installed.components {
            let Some(component) = self.get(name) else {
                continue;
            };
            for (kind, _) in component.observed_kinds() {
                let Some(provider) = resolver.provider_of(kind) else {
                    continue;
                };
                plan.providers.entry(kind).or_insert_with(|| provider.clone());

                if plan.includes(&provider)
                    || plan.unresolved.contains(&provider)
                    || self.contains(&provider)
                    || missing.contains(&provider)
                {
                    continue;
                }
                warn!(component = %name, ?kind, provider = %provider, "Subscribed kind was not declared as consumed");
                missing.push(provider);
            }
        }

        missing
    }

    /// Remember the registry name of every loaded declared provider
    fn bind_providers(&self, plan: &LoadPlan<E>) {
        let bound: Vec<(E::Kind, String)> = plan
            .providers
            .iter()
            .filter_map(|(kind, id)| {
                let name = plan.registry_name(id).unwrap_or(id);
                self.contains(name).then(|| (*kind, name.to_string()))
            })
            .collect();

        let mut providers = self.inner.providers.write();
        for (kind, name) in bound {
            providers.insert(kind, name);
        }
    }

    /// Declare the component registered as `name` the provider of `kind`
    pub fn declare_provider(&self, kind: E::Kind, name: impl Into<String>) {
        self.inner.providers.write().insert(kind, name.into());
    }

    /// Registry name of the declared provider of `kind`
    pub fn provider_of(&self, kind: E::Kind) -> Option<String> {
        self.inner.providers.read().get(&kind).cloned()
    }

    fn rollback(&self, installed: &Installed) {
        self.remove_components(&installed.components);
        let mut contexts = self.inner.contexts.write();
        for key in &installed.contexts {
            contexts.remove(key);
        }
    }

    fn remove_components(&self, names: &[String]) {
        let mut registry = self.inner.registry.write();
        for name in names {
            registry.remove(name);
        }
    }

    /// Instantiate one instance per context binding
    ///
    /// A key already bound to the same type is reused; a different type is a
    /// conflict. Bindings that are also components are built and registered
    /// like any other component once every instance exists.
    pub fn create_contexts(&self, bindings: &[ContextSpec<E>]) -> RuntimeResult<Contexts> {
        let mut installed = Installed::default();
        let result = self.create_contexts_tracked(bindings, &mut installed);
        if result.is_err() {
            self.rollback(&installed);
        }
        result
    }

    fn create_contexts_tracked(
        &self,
        bindings: &[ContextSpec<E>],
        installed: &mut Installed,
    ) -> RuntimeResult<Contexts> {
        let mut fresh = Vec::new();
        {
            let mut contexts = self.inner.contexts.write();
            for binding in bindings {
                if let Some(existing) = contexts.context_type(&binding.key) {
                    if existing != binding.ty {
                        return Err(RuntimeError::ContextConflict {
                            key: binding.key.clone(),
                            existing: existing.name,
                            requested: binding.ty.name,
                        });
                    }
                    debug!(context = %binding.key, "Context already bound, reusing");
                    continue;
                }

                info!(context = %binding.key, type_name = binding.ty.name, "Creating context");
                contexts.insert_erased(binding.key.clone(), binding.ty, binding.make())?;
                installed.contexts.push(binding.key.clone());
                fresh.push(binding);
            }
        }

        let contexts = self.contexts();
        for binding in fresh {
            if let Some(service) = binding.service_spec() {
                let component = self.instantiate_one(service, &contexts)?;
                installed.components.push(component.name().to_string());
            }
        }

        Ok(contexts)
    }

    /// Construct and register every spec, injecting `contexts`
    pub fn instantiate_all(
        &self,
        specs: &[AppSpec<E>],
        contexts: &Contexts,
    ) -> RuntimeResult<Vec<Arc<Component<E>>>> {
        let mut components = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.instantiate_one(spec, contexts) {
                Ok(component) => components.push(component),
                Err(e) => {
                    let names: Vec<String> = components.iter().map(|c| c.name().to_string()).collect();
                    self.remove_components(&names);
                    return Err(e);
                }
            }
        }
        Ok(components)
    }

    fn instantiate_one(&self, spec: &AppSpec<E>, contexts: &Contexts) -> RuntimeResult<Arc<Component<E>>> {
        info!(app = %spec.id, component = %spec.name, "Instantiating app");

        if self.contains(&spec.name) {
            return Err(RuntimeError::DuplicateRegistration(spec.name.clone()));
        }

        let mut builder = AppBuilder::new(spec.name.clone());
        spec.build(&mut builder, contexts)
            .map_err(|e| RuntimeError::Construction {
                name: spec.name.clone(),
                reason: format!("{e:#}"),
            })?;

        let component = Arc::new(builder.build(self.inner.config.queue_capacity));
        self.register(Arc::clone(&component))?;
        Ok(component)
    }

    fn register(&self, component: Arc<Component<E>>) -> RuntimeResult<()> {
        let mut registry = self.inner.registry.write();
        let name = component.name().to_string();
        if registry.components.contains_key(&name) {
            return Err(RuntimeError::DuplicateRegistration(name));
        }
        registry.order.push(name.clone());
        registry.components.insert(name, component);
        Ok(())
    }

    /// Register every consumer as an observer on the producers of its kinds
    ///
    /// Producers are the kind's origin, its declared provider, and every
    /// component that `provide`s it. Safe to run repeatedly: observer entries
    /// are keyed by name and their state sets merge.
    pub fn wire_observers(&self) {
        let components = self.inner.registry.read().ordered();
        let declared = self.inner.providers.read().clone();
        let by_name: HashMap<&str, &Arc<Component<E>>> =
            components.iter().map(|c| (c.name(), c)).collect();

        for consumer in &components {
            for (kind, states) in consumer.observed_kinds() {
                let origins = kind
                    .source()
                    .into_iter()
                    .chain(declared.get(&kind).map(String::as_str));
                for producer in origins.filter_map(|name| by_name.get(name)) {
                    producer.register_observer(kind, consumer.name(), &states);
                }

                for provider in components.iter().filter(|c| c.provides_kind(kind)) {
                    provider.register_observer(kind, consumer.name(), &states);
                }
            }
        }
    }

    /// Launch the loop of every component that has not been started yet
    pub fn start(&self) {
        for component in self.inner.registry.read().ordered() {
            if component.start(self.clone()) {
                debug!(component = %component.name(), "Started");
            }
        }
    }

    /// Hot-load one component: register, wire, and start it
    pub fn instantiate(&self, spec: &AppSpec<E>) -> RuntimeResult<Arc<Component<E>>> {
        let contexts = self.contexts();
        let component = self.instantiate_one(spec, &contexts)?;
        self.wire_observers();
        ComponentReport::from_component(&component).log();
        component.start(self.clone());
        Ok(component)
    }

    // ── Messaging ───────────────────────────────────────────────────────────

    /// Enqueue an event on `destination`; unknown names drop it silently
    pub async fn send_event(&self, destination: &str, event: E, state: Option<DispatchState>) {
        self.deliver(None, destination, Envelope::event(event, state)).await;
    }

    pub(crate) async fn deliver(&self, source: Option<&str>, destination: &str, envelope: Envelope<E>) {
        let source = source.unwrap_or("-");
        let kind = match &envelope {
            Envelope::Event { event, .. } => Some(event.kind()),
            Envelope::Stop => None,
        };

        let sender = self
            .inner
            .registry
            .read()
            .components
            .get(destination)
            .map(|c| c.sender());

        let Some(sender) = sender else {
            debug!("EVENT LOST {} -> {} {:?}", source, destination, kind);
            return;
        };

        debug!("EVENT {} -> {} {:?}", source, destination, kind);

        match self.inner.config.queue_full {
            QueueFullPolicy::Block => {
                if sender.send(envelope).await.is_err() {
                    debug!("EVENT LOST {} -> {} {:?} (stopped)", source, destination, kind);
                }
            }
            QueueFullPolicy::Drop => match sender.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(component = %destination, ?kind, "Queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("EVENT LOST {} -> {} {:?} (stopped)", source, destination, kind);
                }
            },
        }
    }

    /// Send `event` to every observer of its kind registered on `source`
    /// that accepts `state`
    pub async fn broadcast(&self, source: &str, event: E, state: Option<DispatchState>) {
        let Some(component) = self.get(source) else {
            debug!(component = %source, "Broadcast from unknown component");
            return;
        };

        for observer in component.observers_for(event.kind(), state) {
            self.deliver(Some(source), &observer, Envelope::event(event.clone(), state))
                .await;
        }
    }

    /// Send a request and suspend the caller until the reply arrives
    ///
    /// Fails with `RequestDropped` when the request is lost or every handler
    /// finished without replying. An unresponsive destination that keeps the
    /// request blocks forever; callers needing a bound must add a timeout.
    pub async fn request(&self, source: &str, destination: &str, event: E) -> RuntimeResult<E> {
        let (request, reply_rx) = PendingRequest::synchronous(source, destination, event.clone());
        debug!(request_id = %request.id(), source, destination, "Sending request");

        self.deliver(
            Some(source),
            destination,
            Envelope::Event {
                event,
                state: None,
                request: Some(request),
            },
        )
        .await;

        reply_rx.await.map_err(|_| RuntimeError::RequestDropped {
            destination: destination.to_string(),
        })
    }

    /// Send a request whose reply is delivered to `source` as an event
    pub async fn post_request(&self, source: &str, destination: &str, event: E) {
        let request = PendingRequest::routed(source, destination, event.clone());
        debug!(request_id = %request.id(), source, destination, "Posting request");

        self.deliver(
            Some(source),
            destination,
            Envelope::Event {
                event,
                state: None,
                request: Some(request),
            },
        )
        .await;
    }

    /// Answer a pending request; only the first reply is accepted
    pub async fn reply(&self, request: &PendingRequest<E>, reply: E) -> RuntimeResult<()> {
        match request.take_target() {
            None => Err(RuntimeError::AlreadyReplied),
            Some(ReplyTarget::Slot(tx)) => {
                if tx.send(reply).is_err() {
                    debug!(request_id = %request.id(), "Requester went away before the reply");
                }
                Ok(())
            }
            Some(ReplyTarget::Route) => {
                self.deliver(
                    Some(request.destination()),
                    request.source(),
                    Envelope::event(reply, None),
                )
                .await;
                Ok(())
            }
        }
    }

    /// Observe `kind` on its producers as `observer`
    pub fn observe(&self, observer: &str, kind: E::Kind, states: impl Into<StateSet>) {
        let states = states.into();
        for producer in self.producers_of(kind) {
            producer.register_observer(kind, observer, &states);
        }
    }

    pub fn unobserve(&self, observer: &str, kind: E::Kind) {
        for producer in self.producers_of(kind) {
            producer.unregister_observer(kind, observer);
        }
    }

    /// Registered origin and declared provider of `kind`
    fn producers_of(&self, kind: E::Kind) -> Vec<Arc<Component<E>>> {
        let declared = self.provider_of(kind);
        let mut producers: Vec<Arc<Component<E>>> = Vec::new();
        for name in kind.source().map(str::to_string).into_iter().chain(declared) {
            if let Some(producer) = self.get(&name) {
                if !producers.iter().any(|p| Arc::ptr_eq(p, &producer)) {
                    producers.push(producer);
                }
            }
        }
        producers
    }

    /// Add a direct handler to the component registered as `name`
    pub fn register_handler<F, Fut>(
        &self,
        name: &str,
        kind: E::Kind,
        states: impl Into<StateSet>,
        handler: F,
    ) -> RuntimeResult<HandlerId>
    where
        F: Fn(Delivery<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let component = self
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
        let id = component.register_handler(kind, states, handler);
        debug!(component = %name, ?kind, "Handler registered");
        Ok(id)
    }

    /// Remove a handler added by `register_handler` or at construction
    pub fn unregister_handler(&self, name: &str, kind: E::Kind, id: HandlerId) -> RuntimeResult<bool> {
        let component = self
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
        Ok(component.unregister_handler(kind, id))
    }

    // ── Shutdown ────────────────────────────────────────────────────────────

    /// Stop a component after it drains its backlog, then run its teardown hook
    pub async fn stop(&self, name: &str) -> RuntimeResult<()> {
        let component = self
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
        component.stop().await
    }

    /// Remove a component from the registry and every observer list, then stop it
    pub async fn uninstantiate(&self, name: &str) -> RuntimeResult<()> {
        let component = {
            let mut registry = self.inner.registry.write();
            let component = registry
                .remove(name)
                .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
            for other in registry.components.values() {
                other.unregister_observer_all(name);
            }
            component
        };

        info!(component = %name, "Uninstantiating");
        let result = component.stop().await;

        let remaining = component.queued();
        if remaining > 0 {
            debug!(component = %name, remaining, "Events remain in queue");
        }
        result
    }

    /// Stop and tear down every component in reverse instantiation order,
    /// then release every context
    pub async fn close(&self) -> RuntimeResult<()> {
        let components = self.inner.registry.read().ordered();
        let mut first_error = None;

        for component in components.iter().rev() {
            if let Err(e) = component.stop().await {
                error!(component = %component.name(), error = %e, "Failed to stop component");
                first_error.get_or_insert(e);
            }
        }

        {
            let mut registry = self.inner.registry.write();
            registry.components.clear();
            registry.order.clear();
        }
        self.inner.contexts.write().clear();
        self.inner.providers.write().clear();
        info!("Runtime closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Inspection ──────────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<Arc<Component<E>>> {
        self.inner.registry.read().components.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.registry.read().components.contains_key(name)
    }

    /// Registered names in instantiation order
    pub fn names(&self) -> Vec<String> {
        self.inner.registry.read().order.clone()
    }

    pub fn lifecycle(&self, name: &str) -> Option<Lifecycle> {
        self.get(name).map(|c| c.lifecycle())
    }

    /// Snapshot of the context map
    pub fn contexts(&self) -> Contexts {
        self.inner.contexts.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.registry.read().components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.read().components.is_empty()
    }

    pub fn report(&self) -> RuntimeReport {
        let components = self
            .inner
            .registry
            .read()
            .ordered()
            .iter()
            .map(|c| ComponentReport::from_component(c))
            .collect();

        let contexts = self.inner.contexts.read();
        let contexts = contexts
            .keys()
            .map(|key| ContextReport {
                key: key.to_string(),
                type_name: contexts.type_name(key).unwrap_or_default().to_string(),
            })
            .collect();

        RuntimeReport { components, contexts }
    }

    /// Log what every component provides and consumes
    pub fn report_bricks(&self) {
        for component in self.report().components {
            component.log();
        }
    }
}

impl<E: Event> std::fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("components", &self.names())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::event::testing::{PRODUCER, TestEvent, TestKind};
    use crate::spec::Catalog;
    use crate::state::DispatchState::{Handshake, Main};

    fn noop(_: &mut AppBuilder<TestEvent>, _: &Contexts) -> anyhow::Result<()> {
        Ok(())
    }

    fn counting_app(
        name: &'static str,
        kind: TestKind,
        states: StateSet,
        hits: Arc<AtomicUsize>,
    ) -> AppSpec<TestEvent> {
        AppSpec::<TestEvent>::new(name, move |builder, _| {
            let hits = Arc::clone(&hits);
            builder.subscribe(kind, states.clone(), move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            Ok(())
        })
        .consume(kind)
    }

    fn doubler() -> AppSpec<TestEvent> {
        AppSpec::<TestEvent>::new("W", |builder, _| {
            builder.handle(TestKind::Compute, StateSet::all(), |delivery| async move {
                if let TestEvent::Compute(x) = delivery.event {
                    delivery.reply(TestEvent::Result(x * 2)).await?;
                }
                Ok(())
            });
            Ok(())
        })
    }

    fn catalog_with_producer() -> Catalog<TestEvent> {
        let mut catalog = Catalog::new();
        catalog
            .register(AppSpec::<TestEvent>::new(PRODUCER, noop))
            .declare_provider(PRODUCER, [TestKind::Tick, TestKind::Status]);
        catalog
    }

    #[tokio::test]
    async fn test_broadcast_reaches_observer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog_with_producer();
        catalog.register(counting_app("consumer", TestKind::Tick, StateSet::all(), Arc::clone(&hits)));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["consumer"]).await.unwrap();
        assert_eq!(runtime.names(), vec!["consumer", PRODUCER]);
        assert_eq!(runtime.lifecycle("consumer"), Some(Lifecycle::Active));

        runtime.broadcast(PRODUCER, TestEvent::Tick(1), None).await;
        runtime.stop("consumer").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.lifecycle("consumer"), Some(Lifecycle::Stopped));
    }

    #[tokio::test]
    async fn test_state_gated_delivery() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog_with_producer();
        catalog.register(counting_app("consumer", TestKind::Tick, StateSet::from(Main), Arc::clone(&hits)));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["consumer"]).await.unwrap();

        runtime.send_event("consumer", TestEvent::Tick(1), Some(Handshake)).await;
        runtime.broadcast(PRODUCER, TestEvent::Tick(2), Some(Handshake)).await;
        runtime.send_event("consumer", TestEvent::Tick(3), Some(Main)).await;
        runtime.stop("consumer").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_context_single_instance() {
        struct NetImpl;

        let seen: Arc<Mutex<Vec<Arc<NetImpl>>>> = Arc::new(Mutex::new(Vec::new()));
        let app = |id: &'static str, seen: Arc<Mutex<Vec<Arc<NetImpl>>>>| {
            AppSpec::<TestEvent>::new(id, move |_, contexts: &Contexts| {
                seen.lock().push(contexts.require::<NetImpl>("net")?);
                Ok(())
            })
            .context(ContextSpec::new("net", || NetImpl))
        };

        let mut catalog = Catalog::new();
        catalog
            .register(app("X", Arc::clone(&seen)))
            .register(app("Y", Arc::clone(&seen)));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["X", "Y"]).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(Arc::ptr_eq(&seen[0], &seen[1]));
        assert_eq!(runtime.contexts().len(), 1);
        assert!(Arc::ptr_eq(&runtime.contexts().get::<NetImpl>("net").unwrap(), &seen[0]));
    }

    #[tokio::test]
    async fn test_context_conflict_before_instantiation() {
        struct NetImpl;
        struct OtherNet;

        let mut catalog = Catalog::new();
        catalog
            .register(AppSpec::<TestEvent>::new("X", noop).context(ContextSpec::new("net", || NetImpl)))
            .register(AppSpec::<TestEvent>::new("Y", noop).context(ContextSpec::new("net", || OtherNet)));

        let runtime = Runtime::default();
        let result = runtime.run_apps(&catalog, ["X", "Y"]).await;

        assert!(matches!(result, Err(RuntimeError::ContextConflict { .. })));
        assert!(runtime.is_empty());
        assert!(runtime.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_request_reply() {
        let mut catalog = Catalog::new();
        catalog.register(doubler()).register(AppSpec::<TestEvent>::new("Z", noop));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["W", "Z"]).await.unwrap();

        let reply = runtime.request("Z", "W", TestEvent::Compute(42)).await.unwrap();
        assert_eq!(reply, TestEvent::Result(84));
    }

    #[tokio::test]
    async fn test_request_from_inside_handler() {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);

        let caller = AppSpec::<TestEvent>::new("Z", move |builder, _| {
            let slot = Arc::clone(&slot);
            builder.handle(TestKind::Tick, StateSet::all(), move |delivery| {
                let slot = Arc::clone(&slot);
                async move {
                    let reply = delivery.ctx.request("W", TestEvent::Compute(21)).await?;
                    *slot.lock() = Some(reply);
                    Ok(())
                }
            });
            Ok(())
        });

        let mut catalog = Catalog::new();
        catalog.register(doubler()).register(caller);

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["Z", "W"]).await.unwrap();

        runtime.send_event("Z", TestEvent::Tick(0), None).await;
        runtime.stop("Z").await.unwrap();

        assert_eq!(*result.lock(), Some(TestEvent::Result(42)));
    }

    #[tokio::test]
    async fn test_routed_reply_arrives_as_event() {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);

        let caller = AppSpec::<TestEvent>::new("Z", move |builder, _| {
            let slot = Arc::clone(&slot);
            builder.handle(TestKind::Result, StateSet::all(), move |delivery| {
                let slot = Arc::clone(&slot);
                async move {
                    *slot.lock() = Some(delivery.event);
                    Ok(())
                }
            });
            Ok(())
        });

        let mut catalog = Catalog::new();
        catalog.register(doubler()).register(caller);

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["Z", "W"]).await.unwrap();

        runtime.post_request("Z", "W", TestEvent::Compute(5)).await;
        runtime.stop("W").await.unwrap();
        runtime.stop("Z").await.unwrap();

        assert_eq!(*result.lock(), Some(TestEvent::Result(10)));
    }

    #[tokio::test]
    async fn test_request_without_reply_is_dropped() {
        let mut catalog = Catalog::new();
        catalog.register(AppSpec::<TestEvent>::new("silent", |builder, _| {
            builder.handle(TestKind::Compute, StateSet::all(), |_| async { Ok(()) });
            Ok(())
        }));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["silent"]).await.unwrap();

        let unanswered = runtime.request("test", "silent", TestEvent::Compute(1)).await;
        assert!(matches!(unanswered, Err(RuntimeError::RequestDropped { .. })));

        let lost = runtime.request("test", "ghost", TestEvent::Compute(1)).await;
        assert!(matches!(lost, Err(RuntimeError::RequestDropped { destination }) if destination == "ghost"));
    }

    #[tokio::test]
    async fn test_second_reply_rejected() {
        let runtime: Runtime<TestEvent> = Runtime::default();
        let (request, rx) = PendingRequest::synchronous("a", "b", TestEvent::Compute(1));

        tokio_test::assert_ok!(runtime.reply(&request, TestEvent::Result(2)).await);
        let again = runtime.reply(&request, TestEvent::Result(3)).await;

        assert!(matches!(again, Err(RuntimeError::AlreadyReplied)));
        assert_eq!(rx.await.unwrap(), TestEvent::Result(2));
    }

    #[tokio::test]
    async fn test_provider_loaded_implicitly() {
        let mut catalog = Catalog::new();
        catalog
            .register(AppSpec::<TestEvent>::new("A", noop).consume(TestKind::Status))
            .register(AppSpec::<TestEvent>::new("B", noop).named(PRODUCER))
            .declare_provider("B", [TestKind::Status]);

        let runtime = Runtime::default();
        let plan = runtime.run_apps(&catalog, ["A"]).await.unwrap();

        assert_eq!(plan.app_ids(), vec!["A", "B"]);
        assert!(runtime.contains("A"));
        assert!(runtime.contains(PRODUCER));
    }

    #[tokio::test]
    async fn test_duplicate_registration_aborts_load() {
        let mut catalog = Catalog::new();
        catalog
            .register(AppSpec::<TestEvent>::new("first", noop).named("same"))
            .register(AppSpec::<TestEvent>::new("second", noop).named("same"));

        let runtime = Runtime::default();
        let result = runtime.run_apps(&catalog, ["first", "second"]).await;

        assert!(matches!(result, Err(RuntimeError::DuplicateRegistration(name)) if name == "same"));
        assert!(runtime.is_empty());
    }

    #[tokio::test]
    async fn test_construction_failure_is_reported() {
        let mut catalog = Catalog::new();
        catalog
            .register(AppSpec::<TestEvent>::new("ok", noop))
            .register(AppSpec::<TestEvent>::new("broken", |_, contexts: &Contexts| {
                contexts.require::<String>("missing")?;
                Ok(())
            }));

        let runtime = Runtime::default();
        let result = runtime.run_apps(&catalog, ["ok", "broken"]).await;

        assert!(matches!(result, Err(RuntimeError::Construction { name, .. }) if name == "broken"));
        assert!(!runtime.contains("ok"));
    }

    #[tokio::test]
    async fn test_wiring_is_idempotent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog_with_producer();
        catalog.register(counting_app("consumer", TestKind::Tick, StateSet::from(Main), Arc::clone(&hits)));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["consumer"]).await.unwrap();
        runtime.wire_observers();
        runtime.wire_observers();

        let producer = runtime.get(PRODUCER).unwrap();
        let table = producer.observer_table();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].1.len(), 1);
        assert_eq!(
            producer.observer_states(TestKind::Tick, "consumer"),
            Some(StateSet::from(Main))
        );

        runtime.broadcast(PRODUCER, TestEvent::Tick(1), Some(Main)).await;
        runtime.stop("consumer").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provided_kind_wires_to_relay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog_with_producer();
        catalog
            .register(AppSpec::<TestEvent>::new("relay", |builder, _| {
                builder.provide(TestKind::Status);
                Ok(())
            }))
            .register(counting_app("consumer", TestKind::Status, StateSet::all(), Arc::clone(&hits)));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["relay", "consumer"]).await.unwrap();

        runtime.broadcast("relay", TestEvent::Status("up".into()), None).await;
        runtime.broadcast(PRODUCER, TestEvent::Status("up".into()), None).await;
        runtime.stop("consumer").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_to_unknown_destination_is_noop() {
        let runtime: Runtime<TestEvent> = Runtime::default();
        tokio::time::timeout(
            Duration::from_secs(1),
            runtime.send_event("ghost", TestEvent::Tick(1), None),
        )
        .await
        .expect("send to unknown destination must not block");
    }

    #[tokio::test]
    async fn test_stop_drains_backlog() {
        let hits = Arc::new(AtomicUsize::new(0));
        let runtime = Runtime::default();
        let contexts = runtime.contexts();
        runtime
            .instantiate_all(
                &[counting_app("consumer", TestKind::Tick, StateSet::all(), Arc::clone(&hits))],
                &contexts,
            )
            .unwrap();

        for i in 0..10 {
            runtime.send_event("consumer", TestEvent::Tick(i), None).await;
        }
        assert_eq!(runtime.get("consumer").unwrap().queued(), 10);

        runtime.start();
        runtime.stop("consumer").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        // Nothing runs once stop has returned
        runtime.send_event("consumer", TestEvent::Tick(99), None).await;
        tokio::task::yield_now().await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_stop_unknown_component() {
        let runtime: Runtime<TestEvent> = Runtime::default();
        let err = tokio_test::assert_err!(runtime.stop("ghost").await);
        assert!(matches!(err, RuntimeError::UnknownComponent(_)));
    }

    #[tokio::test]
    async fn test_handler_faults_are_contained() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let app = AppSpec::<TestEvent>::new("fragile", move |builder, _| {
            let counter = Arc::clone(&counter);
            builder
                .handle(TestKind::Tick, StateSet::all(), |_| async { Err::<(), _>(anyhow::anyhow!("bad tick")) })
                .handle(TestKind::Tick, StateSet::all(), |delivery| async move {
                    if let TestEvent::Tick(0) = delivery.event {
                        panic!("tick zero");
                    }
                    Ok(())
                })
                .handle(TestKind::Tick, StateSet::all(), move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
            Ok(())
        });

        let mut catalog = Catalog::new();
        catalog.register(app);

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["fragile"]).await.unwrap();

        runtime.send_event("fragile", TestEvent::Tick(0), None).await;
        runtime.send_event("fragile", TestEvent::Tick(1), None).await;
        runtime.stop("fragile").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_under_drop_policy() {
        let config = RuntimeConfig::default()
            .with_queue_capacity(1)
            .with_queue_full(QueueFullPolicy::Drop);
        let runtime = Runtime::new(config);
        runtime
            .instantiate_all(&[AppSpec::<TestEvent>::new("slow", noop)], &Contexts::new())
            .unwrap();

        for i in 0..3 {
            runtime.send_event("slow", TestEvent::Tick(i), None).await;
        }
        assert_eq!(runtime.get("slow").unwrap().queued(), 1);
    }

    #[tokio::test]
    async fn test_uninstantiate_removes_observers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let on_close = Arc::clone(&closed);

        let mut catalog = catalog_with_producer();
        catalog.register(counting_app("consumer", TestKind::Tick, StateSet::all(), Arc::clone(&hits)));
        catalog.register(
            AppSpec::<TestEvent>::new("closer", move |builder, _| {
                let on_close = Arc::clone(&on_close);
                builder.on_close(move || {
                    on_close.fetch_add(1, Ordering::SeqCst);
                });
                builder.subscribe(TestKind::Tick, StateSet::all(), |_| async { Ok(()) });
                Ok(())
            })
            .consume(TestKind::Tick),
        );

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["consumer", "closer"]).await.unwrap();

        runtime.uninstantiate("closer").await.unwrap();
        assert!(!runtime.contains("closer"));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let producer = runtime.get(PRODUCER).unwrap();
        assert_eq!(producer.observers_for(TestKind::Tick, None), vec!["consumer"]);

        let again = runtime.uninstantiate("closer").await;
        assert!(matches!(again, Err(RuntimeError::UnknownComponent(_))));
    }

    #[tokio::test]
    async fn test_hot_loaded_component_is_wired() {
        let hits = Arc::new(AtomicUsize::new(0));
        let runtime = Runtime::default();
        runtime.run_apps(&catalog_with_producer(), [PRODUCER]).await.unwrap();

        let late = counting_app("late", TestKind::Tick, StateSet::all(), Arc::clone(&hits));
        let component = runtime.instantiate(&late).unwrap();
        assert_eq!(component.lifecycle(), Lifecycle::Active);

        runtime.broadcast(PRODUCER, TestEvent::Tick(1), None).await;
        runtime.stop("late").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let duplicate = runtime.instantiate(&late);
        assert!(matches!(duplicate, Err(RuntimeError::DuplicateRegistration(_))));
    }

    #[tokio::test]
    async fn test_dynamic_observe() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let mut catalog = catalog_with_producer();
        catalog.register(AppSpec::<TestEvent>::new("direct", move |builder, _| {
            let counter = Arc::clone(&counter);
            builder.handle(TestKind::Tick, StateSet::all(), move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            Ok(())
        }));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["direct", PRODUCER]).await.unwrap();

        // `handle` does not observe, so the first broadcast goes nowhere
        runtime.broadcast(PRODUCER, TestEvent::Tick(1), None).await;
        runtime.observe("direct", TestKind::Tick, StateSet::all());
        runtime.broadcast(PRODUCER, TestEvent::Tick(2), None).await;
        runtime.unobserve("direct", TestKind::Tick);
        runtime.broadcast(PRODUCER, TestEvent::Tick(3), None).await;
        runtime.stop("direct").await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_service_is_registered() {
        #[derive(Default)]
        struct DpSet {
            seen: AtomicUsize,
        }

        let dpset = AppSpec::<TestEvent>::new("dpset", |builder, contexts: &Contexts| {
            let dpset = contexts.require::<DpSet>("dpset")?;
            builder.subscribe(TestKind::Status, StateSet::all(), move |_| {
                let dpset = Arc::clone(&dpset);
                async move {
                    dpset.seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            Ok(())
        })
        .consume(TestKind::Status);

        let mut catalog = catalog_with_producer();
        catalog.register(
            AppSpec::<TestEvent>::new("switch", noop).context(ContextSpec::service("dpset", DpSet::default, dpset)),
        );

        let runtime = Runtime::default();
        let plan = runtime.run_apps(&catalog, ["switch"]).await.unwrap();
        assert_eq!(plan.app_ids(), vec!["switch", PRODUCER]);
        assert_eq!(runtime.names(), vec!["dpset", "switch", PRODUCER]);

        runtime.broadcast(PRODUCER, TestEvent::Status("up".into()), None).await;
        runtime.stop("dpset").await.unwrap();

        let shared = runtime.contexts().get::<DpSet>("dpset").unwrap();
        assert_eq!(shared.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_tears_down_in_reverse_order() {
        let closed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let app = |id: &'static str, closed: Arc<Mutex<Vec<String>>>| {
            AppSpec::<TestEvent>::new(id, move |builder: &mut AppBuilder<TestEvent>, _| {
                let closed = Arc::clone(&closed);
                let name = builder.name().to_string();
                builder.on_close(move || closed.lock().push(name));
                Ok(())
            })
        };

        let mut catalog = Catalog::new();
        catalog
            .register(app("a", Arc::clone(&closed)))
            .register(app("b", Arc::clone(&closed)))
            .register(app("c", Arc::clone(&closed)));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["a", "b", "c"]).await.unwrap();
        runtime.close().await.unwrap();

        assert_eq!(*closed.lock(), vec!["c", "b", "a"]);
        assert!(runtime.is_empty());
    }

    #[tokio::test]
    async fn test_report_snapshot() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog_with_producer();
        catalog.register(
            counting_app("consumer", TestKind::Tick, StateSet::from(Main), hits)
                .context(ContextSpec::new("net", || 1u32)),
        );

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["consumer"]).await.unwrap();

        let report = runtime.report();
        assert_eq!(report.components.len(), 2);
        assert_eq!(report.contexts[0].key, "net");
        assert_eq!(report.contexts[0].type_name, "u32");

        let producer = report.components.iter().find(|c| c.name == PRODUCER).unwrap();
        assert_eq!(producer.provides["Tick"]["consumer"], StateSet::from(Main));
    }

    /// Records every Tick payload after `delay`; counts teardowns in `closed`
    fn recorder(
        name: &'static str,
        seen: Arc<Mutex<Vec<u32>>>,
        closed: Arc<AtomicUsize>,
        delay: Duration,
    ) -> AppSpec<TestEvent> {
        AppSpec::<TestEvent>::new(name, move |builder, _| {
            let seen = Arc::clone(&seen);
            let closed = Arc::clone(&closed);
            builder
                .handle(TestKind::Tick, StateSet::all(), move |delivery| {
                    let seen = Arc::clone(&seen);
                    async move {
                        tokio::time::sleep(delay).await;
                        if let TestEvent::Tick(i) = delivery.event {
                            seen.lock().push(i);
                        }
                        Ok(())
                    }
                })
                .on_close(move || {
                    closed.fetch_add(1, Ordering::SeqCst);
                });
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_concurrent_stops_wait_for_loop_exit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut catalog = Catalog::new();
        catalog.register(recorder(
            "slow",
            Arc::clone(&seen),
            Arc::clone(&closed),
            Duration::from_millis(300),
        ));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["slow"]).await.unwrap();

        runtime.send_event("slow", TestEvent::Tick(7), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.stop("slow").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.lifecycle("slow"), Some(Lifecycle::Stopping));

        // The second caller finds the component already stopping
        runtime.stop("slow").await.unwrap();
        assert_eq!(*seen.lock(), vec![7]);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.lifecycle("slow"), Some(Lifecycle::Stopped));

        tokio_test::assert_ok!(first.await.unwrap());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_dispatched_in_send_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut catalog = Catalog::new();
        catalog.register(recorder(
            "ordered",
            Arc::clone(&seen),
            Arc::clone(&closed),
            Duration::from_millis(1),
        ));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["ordered"]).await.unwrap();
        for i in 0..10 {
            runtime.send_event("ordered", TestEvent::Tick(i), None).await;
        }

        let (a, b) = tokio::join!(runtime.stop("ordered"), runtime.stop("ordered"));
        a.unwrap();
        b.unwrap();

        // Both stops returned only after the whole backlog ran
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<u32>>());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        runtime.send_event("ordered", TestEvent::Tick(99), None).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.lock().len(), 10);
    }

    #[tokio::test]
    async fn test_declared_provider_is_wired() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut catalog = Catalog::new();
        catalog
            .register(AppSpec::<TestEvent>::new("P", noop))
            .register(counting_app("C", TestKind::Status, StateSet::all(), Arc::clone(&hits)))
            .declare_provider("P", [TestKind::Status]);

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["C"]).await.unwrap();
        assert_eq!(runtime.names(), vec!["C", "P"]);
        assert_eq!(runtime.provider_of(TestKind::Status).as_deref(), Some("P"));

        runtime.broadcast("P", TestEvent::Status("up".into()), None).await;
        runtime.stop("C").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_observe_through_declared_provider() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let mut catalog = Catalog::new();
        catalog
            .register(AppSpec::<TestEvent>::new("P", noop))
            .register(AppSpec::<TestEvent>::new("direct", move |builder, _| {
                let counter = Arc::clone(&counter);
                builder.handle(TestKind::Status, StateSet::all(), move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
                Ok(())
            }));

        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["direct", "P"]).await.unwrap();
        runtime.declare_provider(TestKind::Status, "P");

        runtime.observe("direct", TestKind::Status, StateSet::all());
        let producer = runtime.get("P").unwrap();
        assert_eq!(producer.observers_for(TestKind::Status, None), vec!["direct"]);
        runtime.broadcast("P", TestEvent::Status("up".into()), None).await;

        runtime.unobserve("direct", TestKind::Status);
        assert!(producer.observers_for(TestKind::Status, None).is_empty());
        runtime.broadcast("P", TestEvent::Status("down".into()), None).await;

        runtime.stop("direct").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscription_pulls_in_undeclared_provider() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        // Subscribes to Status without declaring it consumed
        let subscriber = AppSpec::<TestEvent>::new("S", move |builder, _| {
            let counter = Arc::clone(&counter);
            builder.subscribe(TestKind::Status, StateSet::all(), move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            Ok(())
        });

        let mut catalog = Catalog::new();
        catalog
            .register(subscriber)
            .register(AppSpec::<TestEvent>::new("P", noop).named("relay"))
            .declare_provider("P", [TestKind::Status]);

        let runtime = Runtime::default();
        let plan = runtime.run_apps(&catalog, ["S"]).await.unwrap();
        assert_eq!(plan.app_ids(), vec!["S", "P"]);
        assert_eq!(runtime.names(), vec!["S", "relay"]);
        assert_eq!(runtime.provider_of(TestKind::Status).as_deref(), Some("relay"));
        assert_eq!(runtime.lifecycle("relay"), Some(Lifecycle::Active));

        runtime.broadcast("relay", TestEvent::Status("up".into()), None).await;
        runtime.stop("S").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handlers_registered_at_runtime() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registered: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let (counter, slot) = (Arc::clone(&hits), Arc::clone(&registered));

        // The first Compute adds a Tick handler from inside the loop
        let app = AppSpec::<TestEvent>::new("dyn", move |builder, _| {
            let (counter, slot) = (Arc::clone(&counter), Arc::clone(&slot));
            builder.handle(TestKind::Compute, StateSet::all(), move |delivery| {
                let (counter, slot) = (Arc::clone(&counter), Arc::clone(&slot));
                async move {
                    if slot.lock().is_none() {
                        let id = delivery.ctx.register_handler(TestKind::Tick, StateSet::all(), move |_| {
                            let counter = Arc::clone(&counter);
                            async move {
                                counter.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        })?;
                        *slot.lock() = Some(id);
                    }
                    delivery.reply(TestEvent::Result(0)).await?;
                    Ok::<(), anyhow::Error>(())
                }
            });
            Ok(())
        });

        let mut catalog = Catalog::new();
        catalog.register(app);
        let runtime = Runtime::default();
        runtime.run_apps(&catalog, ["dyn"]).await.unwrap();

        runtime.send_event("dyn", TestEvent::Tick(0), None).await;
        runtime.request("test", "dyn", TestEvent::Compute(0)).await.unwrap();
        runtime.send_event("dyn", TestEvent::Tick(1), None).await;
        runtime.send_event("dyn", TestEvent::Tick(2), None).await;
        // Queued behind the ticks, so both have run once this returns
        runtime.request("test", "dyn", TestEvent::Compute(0)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let id = registered.lock().take().unwrap();
        assert!(runtime.unregister_handler("dyn", TestKind::Tick, id).unwrap());
        assert!(!runtime.unregister_handler("dyn", TestKind::Tick, id).unwrap());
        runtime.send_event("dyn", TestEvent::Tick(3), None).await;

        // Runtime-level registration works on a running component too
        let extra = runtime
            .register_handler("dyn", TestKind::Status, StateSet::all(), |_| async { Ok(()) })
            .unwrap();
        assert!(runtime.get("dyn").unwrap().handler_table().contains_key(&TestKind::Status));
        assert!(runtime.unregister_handler("dyn", TestKind::Status, extra).unwrap());

        let unknown = runtime.unregister_handler("ghost", TestKind::Tick, id);
        assert!(matches!(unknown, Err(RuntimeError::UnknownComponent(_))));

        runtime.stop("dyn").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_load_releases_contexts() {
        struct NetImpl;

        let mut catalog = Catalog::new();
        catalog.register(
            AppSpec::<TestEvent>::new("X", |_, _| Err(anyhow::anyhow!("no link")))
                .context(ContextSpec::new("net", || NetImpl)),
        );

        let runtime = Runtime::default();
        let result = runtime.run_apps(&catalog, ["X"]).await;
        assert!(matches!(result, Err(RuntimeError::Construction { .. })));
        assert!(runtime.is_empty());
        assert!(runtime.contexts().is_empty());

        // A retry with a working factory starts from a clean store
        catalog.register(AppSpec::<TestEvent>::new("X", noop).context(ContextSpec::new("net", || NetImpl)));
        runtime.run_apps(&catalog, ["X"]).await.unwrap();
        let first = runtime.contexts().get::<NetImpl>("net").unwrap();

        // A later load binding the same key to the same type reuses the instance
        catalog.register(AppSpec::<TestEvent>::new("Y", noop).context(ContextSpec::new("net", || NetImpl)));
        runtime.run_apps(&catalog, ["Y"]).await.unwrap();
        assert_eq!(runtime.names(), vec!["X", "Y"]);
        assert_eq!(runtime.contexts().len(), 1);
        assert!(Arc::ptr_eq(&first, &runtime.contexts().get::<NetImpl>("net").unwrap()));

        catalog.register(AppSpec::<TestEvent>::new("Z", noop).context(ContextSpec::new("net", || 0u8)));
        let conflict = runtime.run_apps(&catalog, ["Z"]).await;
        assert!(matches!(conflict, Err(RuntimeError::ContextConflict { .. })));
        assert!(!runtime.contains("Z"));
        assert_eq!(runtime.contexts().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_discards_backlog() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let idle = recorder("idle", Arc::clone(&seen), Arc::clone(&closed), Duration::ZERO);

        let runtime = Runtime::default();
        let contexts = runtime.contexts();
        runtime.instantiate_all(&[idle], &contexts).unwrap();
        for i in 0..3 {
            runtime.send_event("idle", TestEvent::Tick(i), None).await;
        }
        assert_eq!(runtime.lifecycle("idle"), Some(Lifecycle::Created));

        runtime.stop("idle").await.unwrap();
        assert_eq!(runtime.lifecycle("idle"), Some(Lifecycle::Stopped));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // A stopped component is never started
        runtime.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().is_empty());
        assert_eq!(runtime.lifecycle("idle"), Some(Lifecycle::Stopped));
    }
}
