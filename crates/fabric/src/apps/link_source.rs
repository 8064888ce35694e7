//! Link Source
//!
//! Provider of `Heartbeat` and `PortStatus`. Every poll advances the
//! dispatcher state one step along handshake → config → main and broadcasts
//! a heartbeat tagged with that state. Port status is only reported once the
//! link reaches main.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use fabric_runtime::{AppSpec, DispatchState, Runtime, StateSet};

use super::{DemoEvent, DemoKind};

pub const LINK_SOURCE: &str = "link_source";

const PORTS: u64 = 4;

const SEQUENCE: [DispatchState; 3] = [
    DispatchState::Handshake,
    DispatchState::Config,
    DispatchState::Main,
];

/// Dispatcher state reported for poll number `seq`
pub fn state_for(seq: u64) -> DispatchState {
    let index = usize::try_from(seq).unwrap_or(usize::MAX).min(SEQUENCE.len() - 1);
    SEQUENCE[index]
}

pub fn spec() -> AppSpec<DemoEvent> {
    AppSpec::new(LINK_SOURCE, |builder, _| {
        let polls = Arc::new(AtomicU64::new(0));
        builder.handle(DemoKind::Poll, StateSet::all(), move |delivery| {
            let seq = polls.fetch_add(1, Ordering::Relaxed);
            async move {
                let state = state_for(seq);
                debug!(seq, %state, "Link poll");

                delivery
                    .ctx
                    .broadcast(DemoEvent::Heartbeat { seq }, Some(state))
                    .await;

                if state == DispatchState::Main {
                    let port = (seq % PORTS) as u32;
                    let status = DemoEvent::PortStatus { port, up: seq % 2 == 0 };
                    delivery.ctx.broadcast(status, Some(state)).await;
                }
                Ok(())
            }
        });
        Ok(())
    })
}

/// Send a `Poll` to the link source every `every` until it is gone
pub fn spawn_poller(runtime: Runtime<DemoEvent>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if !runtime.contains(LINK_SOURCE) {
                debug!("Link source gone, poller exiting");
                break;
            }
            runtime.send_event(LINK_SOURCE, DemoEvent::Poll, None).await;
        }
    })
}
