//! Dependency Loader
//!
//! Expands a set of requested identifiers into the full closure of
//! components to instantiate. Dependencies come from three places: explicit
//! requirements, shared contexts that are themselves components, and the
//! providers of every event kind a component consumes.
//!
//! The expansion is a worklist fixpoint. Every identifier is enqueued at most
//! once, so self-referencing or cyclic specs terminate.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::event::Event;
use crate::spec::{AppSpec, ContextSpec, Resolver};

/// Result of a resolve pass
#[derive(Debug)]
pub struct LoadPlan<E: Event> {
    /// Components to instantiate, in discovery order
    pub apps: Vec<AppSpec<E>>,

    /// One binding per context key, in discovery order
    pub contexts: Vec<ContextSpec<E>>,

    /// Identifiers that could not be resolved and were skipped
    pub unresolved: Vec<String>,

    /// Declared provider identifier of every kind consumed by the plan
    pub providers: HashMap<E::Kind, String>,
}

impl<E: Event> LoadPlan<E> {
    /// Identifiers of the planned components
    pub fn app_ids(&self) -> Vec<&str> {
        self.apps.iter().map(|a| a.id.as_str()).collect()
    }

    pub fn context_keys(&self) -> Vec<&str> {
        self.contexts.iter().map(|c| c.key.as_str()).collect()
    }

    /// Whether `id` is planned, as an app or as a context service
    pub fn includes(&self, id: &str) -> bool {
        self.apps.iter().any(|a| a.id == id)
            || self
                .contexts
                .iter()
                .filter_map(|c| c.service_spec())
                .any(|s| s.id == id)
    }

    /// Registry name the planned spec `id` will be registered under
    pub fn registry_name(&self, id: &str) -> Option<&str> {
        self.apps
            .iter()
            .chain(self.contexts.iter().filter_map(|c| c.service_spec()))
            .find(|s| s.id == id)
            .map(|s| s.name.as_str())
    }

    /// Fold a follow-up plan into this one
    pub(crate) fn extend(&mut self, other: LoadPlan<E>) -> RuntimeResult<()> {
        for app in other.apps {
            if !self.includes(&app.id) {
                self.apps.push(app);
            }
        }
        for context in other.contexts {
            match self.contexts.iter().find(|c| c.key == context.key) {
                Some(existing) if existing.ty != context.ty => {
                    return Err(RuntimeError::ContextConflict {
                        key: context.key.clone(),
                        existing: existing.ty.name,
                        requested: context.ty.name,
                    });
                }
                Some(_) => {}
                None => self.contexts.push(context),
            }
        }
        for id in other.unresolved {
            if !self.unresolved.contains(&id) {
                self.unresolved.push(id);
            }
        }
        for (kind, provider) in other.providers {
            self.providers.entry(kind).or_insert(provider);
        }
        Ok(())
    }
}

/// Split comma-joined entries (`"a,b"`) and drop blanks
pub fn split_app_lists<I, S>(requested: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    requested
        .into_iter()
        .flat_map(|entry| {
            entry
                .as_ref()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Identifiers `spec` depends on: explicit requirements plus the providers of
/// its consumed kinds, excluding itself. Order-preserving, no duplicates.
pub fn dependent_services<E, R>(spec: &AppSpec<E>, resolver: &R) -> Vec<String>
where
    E: Event,
    R: Resolver<E> + ?Sized,
{
    let mut services: Vec<String> = Vec::new();

    for kind in &spec.consumes {
        if let Some(provider) = resolver.provider_of(*kind) {
            if provider != spec.id && !services.contains(&provider) {
                services.push(provider);
            }
        }
    }

    for required in &spec.requires {
        if *required != spec.id && !services.contains(required) {
            services.push(required.clone());
        }
    }

    services
}

/// Compute the load plan for `requested`
///
/// Fails only on a context key bound to two different types; unknown
/// identifiers are skipped with a warning.
pub fn resolve<E, R, I, S>(resolver: &R, requested: I) -> RuntimeResult<LoadPlan<E>>
where
    E: Event,
    R: Resolver<E> + ?Sized,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut worklist: VecDeque<String> = VecDeque::new();
    let mut seen: HashSet<String> = HashSet::new();

    for id in split_app_lists(requested) {
        if seen.insert(id.clone()) {
            worklist.push_back(id);
        }
    }

    let mut apps: Vec<AppSpec<E>> = Vec::new();
    let mut contexts: Vec<ContextSpec<E>> = Vec::new();
    let mut bound: HashMap<String, usize> = HashMap::new();
    // Identifiers instantiated through a context binding, not as top-level apps
    let mut context_ids: HashSet<String> = HashSet::new();
    let mut unresolved = Vec::new();
    let mut providers: HashMap<E::Kind, String> = HashMap::new();

    while let Some(id) = worklist.pop_front() {
        if context_ids.contains(&id) {
            debug!(app = %id, "Skipping context-provided app");
            continue;
        }

        let Some(spec) = resolver.resolve(&id) else {
            warn!(app = %id, "Unresolved app identifier, skipping");
            unresolved.push(id);
            continue;
        };

        info!(app = %id, "Loading app");

        let mut services: Vec<String> = Vec::new();

        for context in &spec.contexts {
            match bound.get(&context.key) {
                Some(&index) => {
                    let existing = &contexts[index];
                    if existing.ty != context.ty {
                        return Err(RuntimeError::ContextConflict {
                            key: context.key.clone(),
                            existing: existing.ty.name,
                            requested: context.ty.name,
                        });
                    }
                }
                None => {
                    bound.insert(context.key.clone(), contexts.len());
                    contexts.push(context.clone());

                    if let Some(service) = context.service_spec() {
                        record_providers(service, resolver, &mut providers);
                        context_ids.insert(service.id.clone());
                        // Already loaded as a plain app before the binding was seen
                        apps.retain(|a| a.id != service.id);
                        services.extend(dependent_services(service, resolver));
                    }
                }
            }
        }

        record_providers(&spec, resolver, &mut providers);
        for service in dependent_services(&spec, resolver) {
            if !context_ids.contains(&service) {
                services.push(service);
            }
        }

        apps.push(spec);

        for service in services {
            if seen.insert(service.clone()) {
                debug!(app = %id, dependency = %service, "Queueing dependency");
                worklist.push_back(service);
            }
        }
    }

    Ok(LoadPlan {
        apps,
        contexts,
        unresolved,
        providers,
    })
}

fn record_providers<E, R>(spec: &AppSpec<E>, resolver: &R, providers: &mut HashMap<E::Kind, String>)
where
    E: Event,
    R: Resolver<E> + ?Sized,
{
    for kind in &spec.consumes {
        if let Some(provider) = resolver.provider_of(*kind) {
            providers.entry(*kind).or_insert(provider);
        }
    }
}
