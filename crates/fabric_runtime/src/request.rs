//! Pending Requests
//!
//! Correlation record behind request/reply. A synchronous request owns a
//! oneshot slot the caller awaits; an asynchronous one routes the reply back
//! to the source as an ordinary event.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::event::Event;

/// Where a reply goes once it is produced
pub(crate) enum ReplyTarget<E: Event> {
    /// Fill the caller's slot directly
    Slot(oneshot::Sender<E>),
    /// Send the reply as an event to the request source
    Route,
}

/// A request in flight
///
/// Every handler matching the request receives a clone; the reply slot is
/// shared, so only the first `reply` wins.
pub struct PendingRequest<E: Event> {
    id: Uuid,
    source: String,
    destination: String,
    payload: E,
    target: Arc<Mutex<Option<ReplyTarget<E>>>>,
    sync: bool,
}

impl<E: Event> PendingRequest<E> {
    /// Create a synchronous request and the receiver the caller waits on
    pub(crate) fn synchronous(
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: E,
    ) -> (Self, oneshot::Receiver<E>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: destination.into(),
            payload,
            target: Arc::new(Mutex::new(Some(ReplyTarget::Slot(tx)))),
            sync: true,
        };
        (request, rx)
    }

    /// Create a request whose reply is routed back as an event
    pub(crate) fn routed(
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: destination.into(),
            payload,
            target: Arc::new(Mutex::new(Some(ReplyTarget::Route))),
            sync: false,
        }
    }

    /// Correlation id, used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Whether a reply has already been produced
    pub fn is_answered(&self) -> bool {
        self.target.lock().is_none()
    }

    pub(crate) fn take_target(&self) -> Option<ReplyTarget<E>> {
        self.target.lock().take()
    }
}

impl<E: Event> Clone for PendingRequest<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            source: self.source.clone(),
            destination: self.destination.clone(),
            payload: self.payload.clone(),
            target: Arc::clone(&self.target),
            sync: self.sync,
        }
    }
}

impl<E: Event> fmt::Debug for PendingRequest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("payload", &self.payload)
            .field("sync", &self.sync)
            .field("answered", &self.is_answered())
            .finish()
    }
}
