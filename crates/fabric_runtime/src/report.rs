//! Runtime Reports
//!
//! Serializable snapshot of the registry for administrative surfaces.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::component::{Component, Lifecycle};
use crate::event::Event;
use crate::state::StateSet;

/// Snapshot of every registered component and context
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeReport {
    pub components: Vec<ComponentReport>,
    pub contexts: Vec<ContextReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextReport {
    pub key: String,
    pub type_name: String,
}

/// One component: what it consumes and to whom it provides
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub queued: usize,
    /// kind -> states accepted by each handler
    pub consumes: BTreeMap<String, Vec<StateSet>>,
    /// kind -> observer name -> states
    pub provides: BTreeMap<String, BTreeMap<String, StateSet>>,
}

impl ComponentReport {
    pub fn from_component<E: Event>(component: &Component<E>) -> Self {
        let consumes = component
            .handler_table()
            .iter()
            .map(|(kind, entries)| {
                (
                    format!("{kind:?}"),
                    entries.iter().map(|e| e.states().clone()).collect(),
                )
            })
            .collect();

        let provides = component
            .observer_table()
            .into_iter()
            .map(|(kind, observers)| (format!("{kind:?}"), observers.into_iter().collect()))
            .collect();

        Self {
            name: component.name().to_string(),
            lifecycle: component.lifecycle(),
            queued: component.queued(),
            consumes,
            provides,
        }
    }

    /// Log in the "BRICK / PROVIDES / CONSUMES" layout
    pub fn log(&self) {
        tracing::debug!("BRICK {}", self.name);
        for (kind, observers) in &self.provides {
            let list: Vec<String> = observers
                .iter()
                .map(|(name, states)| format!("{name}[{states}]"))
                .collect();
            tracing::debug!("  PROVIDES {} TO {}", kind, list.join(", "));
        }
        for kind in self.consumes.keys() {
            tracing::debug!("  CONSUMES {}", kind);
        }
    }
}
