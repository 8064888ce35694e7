//! Built-in Apps
//!
//! The event set shared by the built-in apps and the catalog that resolves
//! them by identifier.

use fabric_runtime::{Catalog, Event, EventKind};

pub mod link_monitor;
pub mod link_source;
pub mod stats;

pub use stats::{LinkStats, StatsSnapshot};

/// Loaded when no app is requested
pub const DEFAULT_APP: &str = link_source::LINK_SOURCE;

/// Events exchanged by the built-in apps
#[derive(Debug, Clone, PartialEq)]
pub enum DemoEvent {
    /// Timer tick driving the link source
    Poll,
    Heartbeat { seq: u64 },
    PortStatus { port: u32, up: bool },
    StatsRequest,
    StatsReply(StatsSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemoKind {
    Poll,
    Heartbeat,
    PortStatus,
    StatsRequest,
    StatsReply,
}

impl EventKind for DemoKind {
    fn source(&self) -> Option<&'static str> {
        match self {
            DemoKind::Heartbeat | DemoKind::PortStatus => Some(link_source::LINK_SOURCE),
            DemoKind::Poll | DemoKind::StatsRequest | DemoKind::StatsReply => None,
        }
    }
}

impl Event for DemoEvent {
    type Kind = DemoKind;

    fn kind(&self) -> DemoKind {
        match self {
            DemoEvent::Poll => DemoKind::Poll,
            DemoEvent::Heartbeat { .. } => DemoKind::Heartbeat,
            DemoEvent::PortStatus { .. } => DemoKind::PortStatus,
            DemoEvent::StatsRequest => DemoKind::StatsRequest,
            DemoEvent::StatsReply(_) => DemoKind::StatsReply,
        }
    }
}

/// Catalog of every built-in app, with providers declared
pub fn catalog() -> Catalog<DemoEvent> {
    let mut catalog = Catalog::new();
    catalog
        .register(link_source::spec())
        .register(link_monitor::spec())
        .declare_provider(link_source::LINK_SOURCE, [DemoKind::Heartbeat, DemoKind::PortStatus]);
    catalog
}
