//! App Specs
//!
//! An [`AppSpec`] is everything the loader needs to know about a component
//! before it exists: its identifier, registry name, contexts, consumed event
//! kinds, explicit requirements, and a factory. Identifiers are turned into
//! specs by a [`Resolver`]; [`Catalog`] is the in-memory implementation.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::component::AppBuilder;
use crate::context::{ContextType, Contexts, SharedContext};
use crate::event::Event;

/// Builds a component by registering its handlers on the builder
pub type AppFactory<E> =
    Arc<dyn Fn(&mut AppBuilder<E>, &Contexts) -> anyhow::Result<()> + Send + Sync>;

type ContextFactory = Arc<dyn Fn() -> SharedContext + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// App Spec
// ─────────────────────────────────────────────────────────────────────────────

/// Loadable description of one component
pub struct AppSpec<E: Event> {
    /// Loadable identifier (what users and `require` name)
    pub id: String,

    /// Registry name of the instantiated component
    pub name: String,

    /// Identifiers that must be loaded alongside this one
    pub requires: Vec<String>,

    /// Event kinds the component's handlers consume
    pub consumes: Vec<E::Kind>,

    /// Shared contexts injected at construction
    pub contexts: Vec<ContextSpec<E>>,

    factory: AppFactory<E>,
}

impl<E: Event> AppSpec<E> {
    /// Create a spec whose registry name equals its identifier
    pub fn new<F>(id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&mut AppBuilder<E>, &Contexts) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            requires: Vec::new(),
            consumes: Vec::new(),
            contexts: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Set a registry name different from the identifier
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Require another identifier to be loaded
    pub fn require(mut self, id: impl Into<String>) -> Self {
        self.requires.push(id.into());
        self
    }

    /// Declare a consumed event kind
    pub fn consume(mut self, kind: E::Kind) -> Self {
        self.consumes.push(kind);
        self
    }

    /// Declare a shared context
    pub fn context(mut self, context: ContextSpec<E>) -> Self {
        self.contexts.push(context);
        self
    }

    pub(crate) fn build(&self, builder: &mut AppBuilder<E>, contexts: &Contexts) -> anyhow::Result<()> {
        (self.factory)(builder, contexts)
    }
}

impl<E: Event> Clone for AppSpec<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            requires: self.requires.clone(),
            consumes: self.consumes.clone(),
            contexts: self.contexts.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<E: Event> fmt::Debug for AppSpec<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("requires", &self.requires)
            .field("consumes", &self.consumes)
            .field("contexts", &self.contexts)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context Spec
// ─────────────────────────────────────────────────────────────────────────────

/// Binding of a context key to its implementing type
pub struct ContextSpec<E: Event> {
    pub key: String,
    pub ty: ContextType,
    make: ContextFactory,
    service: Option<Box<AppSpec<E>>>,
}

impl<E: Event> ContextSpec<E> {
    /// A plain shared object
    pub fn new<T, F>(key: impl Into<String>, make: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            ty: ContextType::of::<T>(),
            make: Arc::new(move || Arc::new(make()) as SharedContext),
            service: None,
        }
    }

    /// A shared object that is also a component
    ///
    /// The instance is created first and placed in the context map, then the
    /// component is built from `app` and registered like any other; its
    /// factory can fetch the instance by `key`.
    pub fn service<T, F>(key: impl Into<String>, make: F, app: AppSpec<E>) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            service: Some(Box::new(app)),
            ..Self::new(key, make)
        }
    }

    pub fn service_spec(&self) -> Option<&AppSpec<E>> {
        self.service.as_deref()
    }

    pub(crate) fn make(&self) -> SharedContext {
        (self.make)()
    }
}

impl<E: Event> Clone for ContextSpec<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            ty: self.ty,
            make: Arc::clone(&self.make),
            service: self.service.clone(),
        }
    }
}

impl<E: Event> fmt::Debug for ContextSpec<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSpec")
            .field("key", &self.key)
            .field("type", &self.ty.name)
            .field("service", &self.service.as_ref().map(|s| &s.id))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────────────────────────────────────

/// Maps loadable identifiers to specs and event kinds to their providers
pub trait Resolver<E: Event> {
    /// Resolve an identifier; `None` if nothing is known by that name
    fn resolve(&self, id: &str) -> Option<AppSpec<E>>;

    /// Identifier of the component declared as canonical source of `kind`
    fn provider_of(&self, kind: E::Kind) -> Option<String>;
}

/// In-memory registry of loadable specs and provider declarations
pub struct Catalog<E: Event> {
    specs: HashMap<String, AppSpec<E>>,
    providers: HashMap<E::Kind, String>,
}

impl<E: Event> Default for Catalog<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Catalog<E> {
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
            providers: HashMap::new(),
        }
    }

    /// Make a spec loadable by its identifier
    pub fn register(&mut self, spec: AppSpec<E>) -> &mut Self {
        self.specs.insert(spec.id.clone(), spec);
        self
    }

    /// Declare `id` as the canonical source of `kinds`
    ///
    /// A component consuming any of these kinds pulls `id` into the load.
    pub fn declare_provider(
        &mut self,
        id: impl Into<String>,
        kinds: impl IntoIterator<Item = E::Kind>,
    ) -> &mut Self {
        let id = id.into();
        for kind in kinds {
            if let Some(previous) = self.providers.insert(kind, id.clone()) {
                if previous != id {
                    tracing::warn!(?kind, previous = %previous, provider = %id, "Provider redeclared");
                }
            }
        }
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.specs.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl<E: Event> Resolver<E> for Catalog<E> {
    fn resolve(&self, id: &str) -> Option<AppSpec<E>> {
        self.specs.get(id).cloned()
    }

    fn provider_of(&self, kind: E::Kind) -> Option<String> {
        self.providers.get(&kind).cloned()
    }
}
