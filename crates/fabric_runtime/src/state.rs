//! Dispatcher States
//!
//! Opaque phase labels attached to events. The runtime only compares them;
//! what a phase means is up to the component producing the event.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol phase under which an event was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    Handshake,
    Config,
    Main,
    Dead,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Handshake => "handshake",
            DispatchState::Config => "config",
            DispatchState::Main => "main",
            DispatchState::Dead => "dead",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of states a handler or observer accepts
///
/// An empty set means "every state". An untagged event (`None`) is admitted
/// by every set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSet(BTreeSet<DispatchState>);

impl StateSet {
    /// Accept events in every state
    pub fn all() -> Self {
        Self(BTreeSet::new())
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, state: DispatchState) -> bool {
        self.0.contains(&state)
    }

    /// Whether an event tagged with `state` passes this set
    pub fn admits(&self, state: Option<DispatchState>) -> bool {
        match state {
            None => true,
            Some(s) => self.is_all() || self.0.contains(&s),
        }
    }

    /// Union with another set; "every state" absorbs any restriction.
    pub fn merge(&mut self, other: &StateSet) {
        if self.is_all() {
            return;
        }
        if other.is_all() {
            self.0.clear();
            return;
        }
        self.0.extend(other.0.iter().copied());
    }

    pub fn iter(&self) -> impl Iterator<Item = DispatchState> + '_ {
        self.0.iter().copied()
    }
}

impl From<DispatchState> for StateSet {
    fn from(state: DispatchState) -> Self {
        Self(BTreeSet::from([state]))
    }
}

impl<const N: usize> From<[DispatchState; N]> for StateSet {
    fn from(states: [DispatchState; N]) -> Self {
        Self(states.into_iter().collect())
    }
}

impl FromIterator<DispatchState> for StateSet {
    fn from_iter<I: IntoIterator<Item = DispatchState>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return f.write_str("*");
        }
        let names: Vec<_> = self.0.iter().map(DispatchState::as_str).collect();
        write!(f, "{}", names.join("|"))
    }
}
