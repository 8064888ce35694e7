//! Link Monitor
//!
//! Counts heartbeats in every state and port status changes once the link is
//! in main, recording both into the shared `stats` context. Answers
//! `StatsRequest` with a snapshot of the counters.

use fabric_runtime::{AppSpec, ContextSpec, DispatchState, StateSet};
use tracing::info;

use super::stats::{LinkStats, STATS_CONTEXT};
use super::{DemoEvent, DemoKind};

pub const LINK_MONITOR: &str = "link_monitor";

pub fn spec() -> AppSpec<DemoEvent> {
    AppSpec::new(LINK_MONITOR, |builder, contexts| {
        let stats = contexts.require::<LinkStats>(STATS_CONTEXT)?;

        let heartbeat_stats = stats.clone();
        builder.subscribe(DemoKind::Heartbeat, StateSet::all(), move |_| {
            heartbeat_stats.record_heartbeat();
            async { Ok(()) }
        });

        let port_stats = stats.clone();
        builder.subscribe(DemoKind::PortStatus, DispatchState::Main, move |delivery| {
            if let DemoEvent::PortStatus { port, up } = delivery.event {
                info!(port, up, "Port status");
                port_stats.record_port(up);
            }
            async { Ok(()) }
        });

        builder.handle(DemoKind::StatsRequest, StateSet::all(), move |delivery| {
            let snapshot = stats.snapshot();
            async move {
                delivery.reply(DemoEvent::StatsReply(snapshot)).await?;
                Ok(())
            }
        });

        Ok(())
    })
    .consume(DemoKind::Heartbeat)
    .consume(DemoKind::PortStatus)
    .context(ContextSpec::new(STATS_CONTEXT, LinkStats::default))
}
