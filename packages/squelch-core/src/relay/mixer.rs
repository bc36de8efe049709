//! Per-channel periodic mix task.
//!
//! Every non-empty channel owns one task that fires every 20 ms and
//! composes a mix-minus output for each member: the sum of every other
//! eligible speaker's next frame, never the listener's own voice. The task
//! is cancelled when the channel empties and respawned on the next join,
//! so a mixer is running iff the channel has members.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::MixBuffer;
use crate::constants::FRAME_DURATION_MS;

use super::Relay;

/// Spawns the mix task for a channel that just gained its first member.
pub(crate) fn spawn(relay: Arc<Relay>, channel: String, cancel: CancellationToken) {
    log::info!("[Mixer] Started for channel '{}'", channel);
    tokio::spawn(run(relay, channel, cancel));
}

async fn run(relay: Arc<Relay>, channel: String, cancel: CancellationToken) {
    let mut metronome = interval(Duration::from_millis(FRAME_DURATION_MS));
    // Burst catches up after scheduler hiccups so the average cadence holds.
    metronome.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = metronome.tick() => {
                if !relay.mix_channel(&channel) {
                    break;
                }
            }
        }
    }
    log::debug!("[Mixer] Tick loop ended for channel '{}'", channel);
}

impl Relay {
    /// Runs one mix tick for `name`.
    ///
    /// Returns `false` when the channel is gone or empty, telling the tick
    /// loop to stop (the cancellation token is the primary stop signal;
    /// this is the backstop for a channel removed mid-tick).
    pub fn mix_channel(&self, name: &str) -> bool {
        let mut st = self.state.lock();
        let Some(channel) = st.channels.get_mut(name) else {
            return false;
        };
        if channel.members.is_empty() {
            return false;
        }

        // Speaker eligibility is decided once per tick, before any pops.
        // Sorted name lists keep the pop order deterministic.
        let mut eligible: Vec<String> = channel
            .members
            .iter()
            .filter(|(_, m)| !m.muted && m.talking && m.queue.ready())
            .map(|(n, _)| n.clone())
            .collect();
        if eligible.is_empty() {
            return true;
        }
        eligible.sort();

        let mut listeners: Vec<String> = channel.members.keys().cloned().collect();
        listeners.sort();

        for listener in &listeners {
            let mut mix = MixBuffer::new();
            for speaker in eligible.iter().filter(|s| s.as_str() != listener.as_str()) {
                // Each listener pops its own frame from every speaker; a
                // queue drained by an earlier listener is skipped.
                if let Some(frame) = channel
                    .members
                    .get_mut(speaker)
                    .and_then(|m| m.queue.pop())
                {
                    mix.add_frame(&frame);
                }
            }
            if mix.is_empty() {
                continue;
            }
            if let Some(member) = channel.members.get(listener) {
                member.handle.send_frame(mix.into_frame());
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::{BufMut, Bytes, BytesMut};
    use tokio::sync::mpsc;
    use tokio::time::{self, Duration};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::constants::{FRAME_BYTES, FRAME_SAMPLES, OUTBOUND_QUEUE_CAPACITY};
    use crate::protocol::ClientMessage as C;
    use crate::relay::{ClientHandle, Outbound};

    fn constant_frame(value: i16) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_BYTES);
        for _ in 0..FRAME_SAMPLES {
            buf.put_i16_le(value);
        }
        buf.freeze()
    }

    fn decode(frame: &[u8]) -> Vec<i16> {
        frame
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    /// Registers `names`, joins them all to "room", and marks them talking.
    fn room(
        relay: &Arc<Relay>,
        names: &[&str],
    ) -> HashMap<String, (Uuid, mpsc::Receiver<Outbound>)> {
        let mut clients = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
            let id = Uuid::new_v4();
            relay.connect(id, ClientHandle::new(tx, CancellationToken::new()));
            relay.handle_message(id, C::Register { name: (*name).into() });
            if i == 0 {
                relay.handle_message(id, C::CreateChannel { channel: "room".into() });
            }
            relay.handle_message(id, C::Join { channel: "room".into() });
            relay.handle_message(id, C::Talking { talking: true });
            clients.insert((*name).to_string(), (id, rx));
        }
        for (_, rx) in clients.values_mut() {
            drain_frames(rx);
        }
        clients
    }

    /// Drops queued signalling messages and returns the binary frames.
    fn drain_frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(frame) = item {
                frames.push(frame);
            }
        }
        frames
    }

    #[tokio::test]
    async fn silence_relays_to_the_other_member() {
        let relay = Arc::new(Relay::new());
        let mut clients = room(&relay, &["a", "b"]);
        let a = clients["a"].0;

        // One frame is below the jitter floor: nothing mixes yet.
        relay.ingest_frame(a, constant_frame(0));
        assert!(relay.mix_channel("room"));
        assert!(drain_frames(&mut clients.get_mut("b").unwrap().1).is_empty());

        // Second frame reaches the floor; b hears a's silence, a hears nothing.
        relay.ingest_frame(a, constant_frame(0));
        assert!(relay.mix_channel("room"));
        let frames = drain_frames(&mut clients.get_mut("b").unwrap().1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_BYTES);
        assert!(frames[0].iter().all(|&b| b == 0));
        assert!(drain_frames(&mut clients.get_mut("a").unwrap().1).is_empty());
    }

    #[tokio::test]
    async fn three_speakers_mix_with_duck_gain() {
        let relay = Arc::new(Relay::new());
        let mut clients = room(&relay, &["a", "b", "c"]);
        let value = 2000i16;
        for (id, _) in clients.values() {
            relay.ingest_frame(*id, constant_frame(value));
            relay.ingest_frame(*id, constant_frame(value));
        }

        assert!(relay.mix_channel("room"));

        // Each listener hears the other two at gain 0.7/2 = 0.35.
        let expected_f = (2.0 * (f32::from(value) / 32_768.0) * 0.35).tanh();
        let expected = (expected_f * 32_767.0) as i16;
        for name in ["a", "b", "c"] {
            let frames = drain_frames(&mut clients.get_mut(name).unwrap().1);
            assert_eq!(frames.len(), 1, "{} should hear one mixed frame", name);
            assert!(decode(&frames[0]).iter().all(|&s| s == expected));
        }
    }

    #[tokio::test]
    async fn muted_and_silent_members_do_not_contribute() {
        let relay = Arc::new(Relay::new());
        let mut clients = room(&relay, &["a", "b", "c"]);
        let a = clients["a"].0;
        let b = clients["b"].0;
        let c = clients["c"].0;

        for id in [a, b, c] {
            relay.ingest_frame(id, constant_frame(1000));
            relay.ingest_frame(id, constant_frame(1000));
        }
        // b mutes, c releases push-to-talk: only a remains eligible.
        relay.handle_message(b, C::Mute { muted: true });
        relay.handle_message(c, C::Talking { talking: false });
        for (_, rx) in clients.values_mut() {
            drain_frames(rx);
        }

        assert!(relay.mix_channel("room"));

        // a hears nothing (its only would-be sources are gated out).
        assert!(drain_frames(&mut clients.get_mut("a").unwrap().1).is_empty());
        // b and c both hear a alone at unit gain.
        for name in ["b", "c"] {
            let frames = drain_frames(&mut clients.get_mut(name).unwrap().1);
            assert_eq!(frames.len(), 1, "{} should hear a", name);
        }
    }

    #[tokio::test]
    async fn each_listener_pops_its_own_frames() {
        let relay = Arc::new(Relay::new());
        let mut clients = room(&relay, &["a", "b", "c"]);
        let a = clients["a"].0;
        for _ in 0..4 {
            relay.ingest_frame(a, constant_frame(100));
        }

        assert!(relay.mix_channel("room"));

        // Two listeners each popped one of a's frames.
        let snap = relay.snapshot();
        let a_status = snap
            .clients
            .iter()
            .find(|c| c.name.as_deref() == Some("a"))
            .unwrap();
        assert_eq!(a_status.queue_size, 2);
        assert_eq!(drain_frames(&mut clients.get_mut("b").unwrap().1).len(), 1);
        assert_eq!(drain_frames(&mut clients.get_mut("c").unwrap().1).len(), 1);
    }

    #[tokio::test]
    async fn mix_stops_reporting_for_missing_or_empty_channel() {
        let relay = Arc::new(Relay::new());
        assert!(!relay.mix_channel("nowhere"));

        let mut clients = room(&relay, &["a"]);
        let (a, _rx) = clients.remove("a").unwrap();
        assert!(relay.mix_channel("room"));
        relay.handle_message(a, C::Leave);
        // Channel persists but is empty: the loop should wind down.
        assert!(!relay.mix_channel("room"));
    }

    #[tokio::test(start_paused = true)]
    async fn mixer_task_delivers_at_cadence() {
        let relay = Arc::new(Relay::new());
        let mut clients = room(&relay, &["a", "b"]);
        let a = clients["a"].0;

        relay.ingest_frame(a, constant_frame(500));
        relay.ingest_frame(a, constant_frame(500));

        // Let the spawned mix task observe one 20 ms tick.
        time::advance(Duration::from_millis(FRAME_DURATION_MS)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let frames = drain_frames(&mut clients.get_mut("b").unwrap().1);
        assert!(
            !frames.is_empty(),
            "listener should receive a mixed frame within one tick"
        );
    }
}
