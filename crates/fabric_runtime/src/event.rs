//! Events
//!
//! Applications define their messages as a closed enum and implement
//! [`Event`] for it. Dispatch keys on the [`EventKind`] tag, never on the
//! payload.

use std::fmt::Debug;
use std::hash::Hash;

use crate::request::PendingRequest;
use crate::state::DispatchState;

/// Tag identifying one message kind of an application's event enum
pub trait EventKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Registry name of the component that produces events of this kind.
    ///
    /// Observer wiring registers consumers on this component. `None` means the
    /// kind is only ever sent to an explicit destination.
    fn source(&self) -> Option<&'static str>;
}

/// A message exchanged between components
pub trait Event: Clone + Debug + Send + Sync + 'static {
    type Kind: EventKind;

    fn kind(&self) -> Self::Kind;
}

/// Item carried on a component's inbound queue
#[derive(Debug)]
pub(crate) enum Envelope<E: Event> {
    Event {
        event: E,
        state: Option<DispatchState>,
        request: Option<PendingRequest<E>>,
    },
    /// Wakes a loop blocked on an empty queue during shutdown
    Stop,
}

impl<E: Event> Envelope<E> {
    pub(crate) fn event(event: E, state: Option<DispatchState>) -> Self {
        Envelope::Event {
            event,
            state,
            request: None,
        }
    }
}
