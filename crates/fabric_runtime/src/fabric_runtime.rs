//! Fabric Runtime - Component runtime and event-routing fabric
//!
//! This crate loads components, resolves their dependencies, shares
//! contexts between them, wires observers, and runs each component as an
//! isolated task reachable only through typed events.

pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod loader;
pub mod report;
pub mod request;
pub mod runtime;
pub mod spec;
pub mod state;

pub use component::{AppBuilder, AppContext, Component, Delivery, Handler, HandlerEntry, HandlerId, Lifecycle};
pub use config::{QueueFullPolicy, RuntimeConfig};
pub use context::{ContextType, Contexts, SharedContext};
pub use error::{RuntimeError, RuntimeResult};
pub use event::{Event, EventKind};
pub use loader::{LoadPlan, dependent_services, resolve, split_app_lists};
pub use report::{ComponentReport, ContextReport, RuntimeReport};
pub use request::PendingRequest;
pub use runtime::Runtime;
pub use spec::{AppFactory, AppSpec, Catalog, ContextSpec, Resolver};
pub use state::{DispatchState, StateSet};
