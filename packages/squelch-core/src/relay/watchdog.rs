//! Liveness watchdog.
//!
//! Clients prove liveness with `ping`; the transport's own keepalive is not
//! assumed. Every sweep evicts sessions whose last ping is older than the
//! deadline: detach from the channel (with the usual `user_left`
//! broadcast), remove the session, terminate the transport. Eviction is
//! idempotent with a client-initiated disconnect racing it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::{PING_TIMEOUT_SECS, WATCHDOG_INTERVAL_SECS};
use crate::protocol::ServerMessage;

use super::Relay;

/// Runs the sweep loop until `cancel` fires.
pub async fn run(relay: Arc<Relay>, cancel: CancellationToken) {
    let mut sweep = interval(Duration::from_secs(WATCHDOG_INTERVAL_SECS));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("[Watchdog] Started (ping deadline {}s)", PING_TIMEOUT_SECS);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = relay.sweep_idle();
                if evicted > 0 {
                    log::info!("[Watchdog] Evicted {} idle session(s)", evicted);
                }
            }
        }
    }
    log::info!("[Watchdog] Stopped");
}

impl Relay {
    /// Evicts every session past the ping deadline. Returns the count.
    pub fn sweep_idle(&self) -> usize {
        let deadline = Duration::from_secs(PING_TIMEOUT_SECS);
        let mut st = self.state.lock();
        let stale: Vec<Uuid> = st
            .sessions
            .iter()
            .filter(|(_, s)| s.last_ping_at.elapsed() > deadline)
            .map(|(id, _)| *id)
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let mut any_detached = false;
        for id in &stale {
            let name = st.sessions.get(id).and_then(|s| s.name.clone());
            let age = st
                .sessions
                .get(id)
                .map(|s| s.connected_at.elapsed().as_secs())
                .unwrap_or(0);
            log::warn!(
                "[Watchdog] Evicting idle session {} ({:?}, connected {}s ago)",
                id,
                name,
                age
            );
            any_detached |= st.detach(*id).is_some();
            if let Some(session) = st.sessions.remove(id) {
                session.handle.close();
            }
        }
        if any_detached {
            let list = st.channel_list();
            st.broadcast_all(&ServerMessage::Channels { list });
        }
        stale.len()
    }
}
