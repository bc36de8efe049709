//! The relay service: signalling state machine, mixing, liveness.
//!
//! [`Relay`] is the single steward of the session table and channel
//! registry. Connection handlers, the per-channel mix tasks, the watchdog
//! and the admin surface all mutate through its lock; none of them touch
//! the tables directly. Mutations never block - the only suspension points
//! in the system are transport writes and timer ticks, both outside the
//! lock.

pub mod mixer;
pub mod state;
pub mod watchdog;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::{ADMIN_OWNER, FRAME_BYTES, KICKED_MESSAGE};
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ClientMessage, ClientStatus, ServerMessage, StatusSnapshot};

pub use state::{Channel, ClientHandle, Membership, Outbound, RelayState, Session};

/// Stewards all relay state and implements the signalling protocol.
pub struct Relay {
    pub(crate) state: Mutex<RelayState>,
    started_at: Instant,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            started_at: Instant::now(),
        }
    }

    /// Seconds since the relay was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Number of live sessions (registered or not).
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers a freshly accepted connection.
    pub fn connect(&self, id: Uuid, handle: ClientHandle) {
        let mut st = self.state.lock();
        st.sessions.insert(id, Session::new(handle));
        log::info!("[Signal] Session {} connected ({} total)", id, st.sessions.len());
    }

    /// Tears down a session after its transport closed.
    ///
    /// Idempotent with watchdog eviction and admin kick: a second call for
    /// the same id is a no-op.
    pub fn disconnect(&self, id: Uuid) {
        let mut st = self.state.lock();
        if !st.sessions.contains_key(&id) {
            return;
        }
        let left = st.detach(id);
        if let Some(session) = st.sessions.remove(&id) {
            session.handle.close();
        }
        if left.is_some() {
            let list = st.channel_list();
            st.broadcast_all(&ServerMessage::Channels { list });
        }
        log::info!("[Signal] Session {} disconnected ({} total)", id, st.sessions.len());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Signalling
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatches one parsed signalling message.
    ///
    /// Failures are reported back to the sender as `error{message}` frames
    /// and never propagate: a bad request cannot disturb registry state or
    /// any other session.
    pub fn handle_message(self: &Arc<Self>, id: Uuid, msg: ClientMessage) {
        let result = match msg {
            ClientMessage::Register { name } => self.register(id, &name),
            ClientMessage::CreateChannel { channel } => self.create_channel(id, &channel),
            // A join while already in a channel behaves as a switch; both
            // validate the target before leaving the source.
            ClientMessage::Join { channel } | ClientMessage::Switch { channel } => {
                self.join(id, &channel)
            }
            ClientMessage::Leave => self.leave(id),
            ClientMessage::CloseChannel { channel } => self.close_channel(id, &channel),
            ClientMessage::ListChannels => self.list_channels(id),
            ClientMessage::Talking { talking } => self.set_talking(id, talking),
            ClientMessage::Mute { muted } => self.set_muted(id, muted),
            ClientMessage::Ping => self.ping(id),
        };
        if let Err(err) = result {
            log::debug!("[Signal] Session {}: {}", id, err);
            self.send_error(id, err.to_string());
        }
    }

    /// Sends an `error{message}` frame to one session.
    pub fn send_error(&self, id: Uuid, message: impl Into<String>) {
        let st = self.state.lock();
        if let Some(session) = st.sessions.get(&id) {
            session.handle.send(ServerMessage::Error {
                message: message.into(),
            });
        }
    }

    fn register(&self, id: Uuid, raw: &str) -> RelayResult<()> {
        let name = raw.trim().to_string();
        if name.is_empty() {
            return Err(RelayError::EmptyName);
        }
        let mut st = self.state.lock();
        let Some(session) = st.sessions.get_mut(&id) else {
            return Ok(());
        };
        // Renames are allowed while idle; membership keys would go stale
        // if the name changed inside a channel.
        if session.channel.is_some() && session.name.as_deref() != Some(name.as_str()) {
            return Err(RelayError::RenameInChannel);
        }
        session.name = Some(name.clone());
        let handle = session.handle.clone();
        let channels = st.channel_list();
        handle.send(ServerMessage::Registered {
            name: name.clone(),
            channels,
        });
        log::info!("[Signal] Session {} registered as '{}'", id, name);
        Ok(())
    }

    fn create_channel(&self, id: Uuid, raw: &str) -> RelayResult<()> {
        let mut st = self.state.lock();
        let owner = st.require_name(id)?;
        let name = raw.trim().to_string();
        if name.is_empty() {
            return Err(RelayError::EmptyName);
        }
        if st.channels.contains_key(&name) {
            return Err(RelayError::AlreadyExists(name));
        }
        st.channels.insert(name.clone(), Channel::new(owner.clone()));
        st.broadcast_all(&ServerMessage::ChannelCreated {
            channel: name.clone(),
            owner: owner.clone(),
        });
        let list = st.channel_list();
        st.broadcast_all(&ServerMessage::Channels { list });
        log::info!("[Signal] Channel '{}' created by '{}'", name, owner);
        Ok(())
    }

    fn join(self: &Arc<Self>, id: Uuid, raw: &str) -> RelayResult<()> {
        let target = raw.trim().to_string();
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let name = st.require_name(id)?;
        if target.is_empty() {
            return Err(RelayError::NoSuchChannel(target));
        }

        let Some(session) = st.sessions.get(&id) else {
            return Ok(());
        };
        // Rejoining the current channel leaves membership untouched; the
        // fresh `joined` reply lets an out-of-sync client recover.
        if session.channel.as_deref() == Some(target.as_str()) {
            if let Some(channel) = st.channels.get(&target) {
                let mut users: Vec<String> = channel
                    .members
                    .keys()
                    .filter(|n| n.as_str() != name)
                    .cloned()
                    .collect();
                users.sort();
                session.handle.send(ServerMessage::Joined {
                    channel: target,
                    owner: channel.owner.clone(),
                    users,
                });
            }
            return Ok(());
        }

        // Validate the target before leaving the source, so a failed switch
        // changes nothing and the session is never a member of two channels.
        let channel = st
            .channels
            .get(&target)
            .ok_or_else(|| RelayError::NoSuchChannel(target.clone()))?;
        if channel.members.contains_key(&name) {
            return Err(RelayError::NameInUse(target.clone()));
        }
        let owner = channel.owner.clone();

        st.detach(id);

        let Some(session) = st.sessions.get_mut(&id) else {
            return Ok(());
        };
        session.channel = Some(target.clone());
        let handle = session.handle.clone();

        let Some(channel) = st.channels.get_mut(&target) else {
            return Ok(());
        };
        channel
            .members
            .insert(name.clone(), Membership::new(id, handle.clone()));
        let mut users: Vec<String> = channel
            .members
            .keys()
            .filter(|n| n.as_str() != name)
            .cloned()
            .collect();
        users.sort();
        if channel.members.len() == 1 {
            let token = CancellationToken::new();
            channel.mixer = Some(token.clone());
            mixer::spawn(Arc::clone(self), target.clone(), token);
        }

        // The joiner's own snapshot precedes the broadcast others see.
        handle.send(ServerMessage::Joined {
            channel: target.clone(),
            owner,
            users,
        });
        st.broadcast_channel(
            &target,
            &ServerMessage::UserJoined { name: name.clone() },
            Some(&name),
        );
        let list = st.channel_list();
        st.broadcast_all(&ServerMessage::Channels { list });
        log::info!("[Signal] '{}' joined channel '{}'", name, target);
        Ok(())
    }

    fn leave(&self, id: Uuid) -> RelayResult<()> {
        let mut st = self.state.lock();
        let Some(session) = st.sessions.get(&id) else {
            return Ok(());
        };
        if session.name.is_none() {
            return Ok(());
        }
        let left = st.detach(id);
        if let Some(session) = st.sessions.get(&id) {
            session.handle.send(ServerMessage::Left);
        }
        if let Some(channel) = left {
            let list = st.channel_list();
            st.broadcast_all(&ServerMessage::Channels { list });
            log::info!("[Signal] Session {} left channel '{}'", id, channel);
        }
        Ok(())
    }

    fn close_channel(&self, id: Uuid, raw: &str) -> RelayResult<()> {
        let mut st = self.state.lock();
        let requester = st.require_name(id)?;
        let name = raw.trim();
        let channel = st
            .channels
            .get(name)
            .ok_or_else(|| RelayError::NoSuchChannel(name.to_string()))?;
        if channel.owner != requester {
            return Err(RelayError::NotOwner);
        }
        st.close_channel(name)
    }

    fn list_channels(&self, id: Uuid) -> RelayResult<()> {
        let st = self.state.lock();
        let Some(session) = st.sessions.get(&id) else {
            return Ok(());
        };
        if session.name.is_some() {
            session.handle.send(ServerMessage::Channels {
                list: st.channel_list(),
            });
        }
        Ok(())
    }

    fn set_talking(&self, id: Uuid, talking: bool) -> RelayResult<()> {
        let mut st = self.state.lock();
        let Some(session) = st.sessions.get(&id) else {
            return Ok(());
        };
        let (Some(name), Some(channel)) = (session.name.clone(), session.channel.clone()) else {
            return Ok(());
        };
        if let Some(ch) = st.channels.get_mut(&channel) {
            if let Some(member) = ch.members.get_mut(&name) {
                member.talking = talking;
            }
        }
        st.broadcast_channel(
            &channel,
            &ServerMessage::Talking {
                name: name.clone(),
                talking,
            },
            Some(&name),
        );
        Ok(())
    }

    fn set_muted(&self, id: Uuid, muted: bool) -> RelayResult<()> {
        let mut st = self.state.lock();
        let Some(session) = st.sessions.get(&id) else {
            return Ok(());
        };
        let (Some(name), Some(channel)) = (session.name.clone(), session.channel.clone()) else {
            return Ok(());
        };
        let handle = session.handle.clone();
        if let Some(ch) = st.channels.get_mut(&channel) {
            if let Some(member) = ch.members.get_mut(&name) {
                member.muted = muted;
            }
        }
        handle.send(ServerMessage::Muted {
            muted,
            source: None,
        });
        Ok(())
    }

    fn ping(&self, id: Uuid) -> RelayResult<()> {
        let mut st = self.state.lock();
        if let Some(session) = st.sessions.get_mut(&id) {
            session.last_ping_at = Instant::now();
            session.handle.send(ServerMessage::Pong);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Audio Ingress
    // ─────────────────────────────────────────────────────────────────────────

    /// Accepts one inbound binary frame.
    ///
    /// Silently dropped unless the sender is in a channel, unmuted, talking,
    /// and the frame is exactly 640 bytes. Queue overflow drops the frame.
    pub fn ingest_frame(&self, id: Uuid, data: Bytes) {
        if data.len() != FRAME_BYTES {
            return;
        }
        let mut st = self.state.lock();
        let Some(session) = st.sessions.get(&id) else {
            return;
        };
        let (Some(name), Some(channel)) = (session.name.clone(), session.channel.clone()) else {
            return;
        };
        if let Some(ch) = st.channels.get_mut(&channel) {
            if let Some(member) = ch.members.get_mut(&name) {
                if !member.muted && member.talking && !member.queue.push(data) {
                    log::trace!("[Audio] Jitter buffer full for '{}', frame dropped", name);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admin Surface
    // ─────────────────────────────────────────────────────────────────────────

    /// Full state snapshot for the admin API, sessions sorted by name.
    pub fn snapshot(&self) -> StatusSnapshot {
        let st = self.state.lock();
        let mut clients: Vec<ClientStatus> = st
            .sessions
            .values()
            .map(|session| {
                let member = session
                    .name
                    .as_ref()
                    .zip(session.channel.as_ref())
                    .and_then(|(name, channel)| st.channels.get(channel)?.members.get(name));
                ClientStatus {
                    name: session.name.clone(),
                    channel: session.channel.clone(),
                    muted: member.map(|m| m.muted).unwrap_or(false),
                    talking: member.map(|m| m.talking).unwrap_or(false),
                    queue_size: member.map(|m| m.queue.len()).unwrap_or(0),
                }
            })
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        StatusSnapshot {
            uptime: self.uptime_secs(),
            clients,
            channels: st.channel_list(),
        }
    }

    /// Creates a channel owned by the `"admin"` sentinel.
    pub fn admin_create_channel(&self, raw: &str) -> RelayResult<String> {
        let name = raw.trim().to_string();
        if name.is_empty() {
            return Err(RelayError::MissingField("channel"));
        }
        let mut st = self.state.lock();
        if st.channels.contains_key(&name) {
            return Err(RelayError::AlreadyExists(name));
        }
        st.channels
            .insert(name.clone(), Channel::new(ADMIN_OWNER.to_string()));
        st.broadcast_all(&ServerMessage::ChannelCreated {
            channel: name.clone(),
            owner: ADMIN_OWNER.to_string(),
        });
        let list = st.channel_list();
        st.broadcast_all(&ServerMessage::Channels { list });
        log::info!("[Admin] Channel '{}' created", name);
        Ok(name)
    }

    /// Deletes a channel without the owner check.
    pub fn admin_delete_channel(&self, name: &str) -> RelayResult<()> {
        let mut st = self.state.lock();
        st.close_channel(name.trim())?;
        log::info!("[Admin] Channel '{}' deleted", name.trim());
        Ok(())
    }

    /// Moves a client into a channel; the client sees a normal `joined`.
    pub fn admin_force_join(self: &Arc<Self>, client: &str, channel: &str) -> RelayResult<()> {
        let id = {
            let st = self.state.lock();
            st.find_by_name(client)
                .ok_or_else(|| RelayError::NoSuchClient(client.to_string()))?
        };
        self.join(id, channel)?;
        log::info!("[Admin] Forced '{}' into channel '{}'", client, channel);
        Ok(())
    }

    /// Detaches a client from its channel; the client sees a normal `left`.
    pub fn admin_force_leave(&self, client: &str) -> RelayResult<()> {
        let mut st = self.state.lock();
        let id = st
            .find_by_name(client)
            .ok_or_else(|| RelayError::NoSuchClient(client.to_string()))?;
        let left = st.detach(id);
        if let Some(session) = st.sessions.get(&id) {
            session.handle.send(ServerMessage::Left);
        }
        if left.is_some() {
            let list = st.channel_list();
            st.broadcast_all(&ServerMessage::Channels { list });
        }
        log::info!("[Admin] Forced '{}' out of its channel", client);
        Ok(())
    }

    /// Forces the mute flag; the client is notified with `source:"admin"`.
    pub fn admin_force_mute(&self, client: &str, muted: bool) -> RelayResult<()> {
        let mut st = self.state.lock();
        let id = st
            .find_by_name(client)
            .ok_or_else(|| RelayError::NoSuchClient(client.to_string()))?;
        let Some(session) = st.sessions.get(&id) else {
            return Err(RelayError::NoSuchClient(client.to_string()));
        };
        let handle = session.handle.clone();
        if let (Some(name), Some(channel)) = (session.name.clone(), session.channel.clone()) {
            if let Some(ch) = st.channels.get_mut(&channel) {
                if let Some(member) = ch.members.get_mut(&name) {
                    member.muted = muted;
                }
            }
        }
        handle.send(ServerMessage::Muted {
            muted,
            source: Some(ADMIN_OWNER.to_string()),
        });
        log::info!("[Admin] Forced mute={} for '{}'", muted, client);
        Ok(())
    }

    /// Removes a client: `kicked` notice, `user_left` broadcast, transport
    /// terminated, session gone.
    pub fn admin_kick(&self, client: &str) -> RelayResult<()> {
        let mut st = self.state.lock();
        let id = st
            .find_by_name(client)
            .ok_or_else(|| RelayError::NoSuchClient(client.to_string()))?;
        if let Some(session) = st.sessions.get(&id) {
            session.handle.send(ServerMessage::Kicked {
                message: KICKED_MESSAGE.to_string(),
            });
        }
        let left = st.detach(id);
        if let Some(session) = st.sessions.remove(&id) {
            session.handle.close();
        }
        if left.is_some() {
            let list = st.channel_list();
            st.broadcast_all(&ServerMessage::Channels { list });
        }
        log::info!("[Admin] Kicked '{}'", client);
        Ok(())
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{JITTER_CAPACITY, OUTBOUND_QUEUE_CAPACITY};
    use crate::protocol::ClientMessage as C;
    use tokio::sync::mpsc;

    fn relay() -> Arc<Relay> {
        Arc::new(Relay::new())
    }

    fn client(relay: &Arc<Relay>) -> (Uuid, mpsc::Receiver<Outbound>, CancellationToken) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let token = CancellationToken::new();
        let id = Uuid::new_v4();
        relay.connect(id, ClientHandle::new(tx, token.clone()));
        (id, rx, token)
    }

    fn registered(
        relay: &Arc<Relay>,
        name: &str,
    ) -> (Uuid, mpsc::Receiver<Outbound>, CancellationToken) {
        let (id, mut rx, token) = client(relay);
        relay.handle_message(id, C::Register { name: name.into() });
        drain(&mut rx);
        (id, rx, token)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(msg) = item {
                out.push(msg);
            }
        }
        out
    }

    fn audio_frame() -> Bytes {
        Bytes::from(vec![0u8; FRAME_BYTES])
    }

    fn mixer_running(relay: &Arc<Relay>, channel: &str) -> bool {
        relay
            .state
            .lock()
            .channels
            .get(channel)
            .map(|c| c.mixer_running())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn register_trims_and_replies() {
        let relay = relay();
        let (id, mut rx, _) = client(&relay);
        relay.handle_message(id, C::Register { name: "  alice  ".into() });
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs,
            vec![ServerMessage::Registered {
                name: "alice".into(),
                channels: vec![],
            }]
        );
    }

    #[tokio::test]
    async fn register_empty_name_rejected() {
        let relay = relay();
        let (id, mut rx, _) = client(&relay);
        relay.handle_message(id, C::Register { name: "   ".into() });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "Name cannot be empty".into()
            }]
        );
    }

    #[tokio::test]
    async fn create_requires_registration() {
        let relay = relay();
        let (id, mut rx, _) = client(&relay);
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "Not registered".into()
            }]
        );
    }

    #[tokio::test]
    async fn create_and_join_message_order() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");

        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs[0],
            ServerMessage::ChannelCreated {
                channel: "room".into(),
                owner: "a".into()
            }
        );
        assert!(matches!(msgs[1], ServerMessage::Channels { .. }));

        relay.handle_message(id, C::Join { channel: "room".into() });
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs[0],
            ServerMessage::Joined {
                channel: "room".into(),
                owner: "a".into(),
                users: vec![],
            }
        );
        assert!(matches!(msgs[1], ServerMessage::Channels { .. }));
    }

    #[tokio::test]
    async fn create_duplicate_rejected() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        drain(&mut rx);
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "Channel already exists: room".into()
            }]
        );
    }

    #[tokio::test]
    async fn join_missing_channel_rejected() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::Join { channel: "nowhere".into() });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "No such channel: nowhere".into()
            }]
        );
    }

    #[tokio::test]
    async fn duplicate_name_in_channel_rejected() {
        let relay = relay();
        let (a1, mut rx1, _) = registered(&relay, "alice");
        let (a2, mut rx2, _) = registered(&relay, "alice");
        relay.handle_message(a1, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a1, C::Join { channel: "room".into() });
        drain(&mut rx1);

        relay.handle_message(a2, C::Join { channel: "room".into() });
        let msgs = drain(&mut rx2);
        // The earlier channel_created/channels broadcasts also reached a2.
        assert!(msgs.contains(&ServerMessage::Error {
            message: "Name already in use in channel: room".into()
        }));
        assert_eq!(relay.snapshot().channels[0].user_count, 1);
    }

    #[tokio::test]
    async fn leave_returns_session_to_idle_and_channel_persists() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        relay.handle_message(id, C::Join { channel: "room".into() });
        drain(&mut rx);

        relay.handle_message(id, C::Leave);
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0], ServerMessage::Left);

        let snap = relay.snapshot();
        assert_eq!(snap.clients[0].channel, None);
        assert_eq!(snap.channels.len(), 1);
        assert_eq!(snap.channels[0].user_count, 0);
        assert!(!mixer_running(&relay, "room"));
    }

    #[tokio::test]
    async fn leave_notifies_remaining_members() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        relay.handle_message(b, C::Join { channel: "room".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_message(a, C::Leave);
        let msgs = drain(&mut rx_b);
        assert_eq!(
            msgs[0],
            ServerMessage::UserLeft {
                name: "a".into(),
                channel: "room".into()
            }
        );
        assert!(matches!(msgs[1], ServerMessage::Channels { .. }));
    }

    #[tokio::test]
    async fn switch_to_current_channel_is_a_noop() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        relay.handle_message(b, C::Join { channel: "room".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_message(b, C::Switch { channel: "room".into() });
        let msgs = drain(&mut rx_b);
        assert_eq!(
            msgs,
            vec![ServerMessage::Joined {
                channel: "room".into(),
                owner: "a".into(),
                users: vec!["a".into()],
            }]
        );
        // No user_left/user_joined churn reaches the other member.
        assert_eq!(drain(&mut rx_a), vec![]);
        assert_eq!(relay.snapshot().channels[0].user_count, 2);
    }

    #[tokio::test]
    async fn switch_moves_membership_between_channels() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "one".into() });
        relay.handle_message(a, C::CreateChannel { channel: "two".into() });
        relay.handle_message(a, C::Join { channel: "one".into() });
        relay.handle_message(b, C::Join { channel: "one".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_message(b, C::Switch { channel: "two".into() });
        let msgs = drain(&mut rx_b);
        assert_eq!(
            msgs[0],
            ServerMessage::Joined {
                channel: "two".into(),
                owner: "a".into(),
                users: vec![],
            }
        );
        // The source channel observed the departure.
        let msgs = drain(&mut rx_a);
        assert_eq!(
            msgs[0],
            ServerMessage::UserLeft {
                name: "b".into(),
                channel: "one".into()
            }
        );

        let snap = relay.snapshot();
        let one = snap.channels.iter().find(|c| c.name == "one").unwrap();
        let two = snap.channels.iter().find(|c| c.name == "two").unwrap();
        assert_eq!(one.users, vec!["a".to_string()]);
        assert_eq!(two.users, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn failed_switch_keeps_source_membership() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        relay.handle_message(a, C::CreateChannel { channel: "one".into() });
        relay.handle_message(a, C::Join { channel: "one".into() });
        drain(&mut rx_a);

        relay.handle_message(a, C::Switch { channel: "nowhere".into() });
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerMessage::Error {
                message: "No such channel: nowhere".into()
            }]
        );
        assert_eq!(relay.snapshot().clients[0].channel.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn close_by_non_owner_rejected() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_message(b, C::CloseChannel { channel: "room".into() });
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Error {
                message: "Only the channel owner can close this channel".into()
            }]
        );
        assert_eq!(relay.snapshot().channels.len(), 1);
    }

    #[tokio::test]
    async fn close_by_owner_detaches_members_and_deletes() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        relay.handle_message(b, C::Join { channel: "room".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_message(a, C::CloseChannel { channel: "room".into() });
        let msgs = drain(&mut rx_b);
        assert_eq!(
            msgs[0],
            ServerMessage::ChannelClosed {
                channel: "room".into()
            }
        );
        assert_eq!(
            msgs[1],
            ServerMessage::ChannelDeleted {
                channel: "room".into()
            }
        );

        let snap = relay.snapshot();
        assert!(snap.channels.is_empty());
        assert!(snap.clients.iter().all(|c| c.channel.is_none()));
    }

    #[tokio::test]
    async fn owner_is_set_once_and_survives_departure() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        relay.handle_message(b, C::Join { channel: "room".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        // Owner disconnects entirely; the channel and its owner persist.
        relay.disconnect(a);
        let snap = relay.snapshot();
        assert_eq!(snap.channels[0].owner, "a");
        assert_eq!(snap.channels[0].users, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn re_register_renames_when_idle() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::Register { name: "b".into() });
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs,
            vec![ServerMessage::Registered {
                name: "b".into(),
                channels: vec![],
            }]
        );
        assert!(relay.state.lock().find_by_name("b").is_some());
        assert!(relay.state.lock().find_by_name("a").is_none());
    }

    #[tokio::test]
    async fn re_register_in_channel_rejected() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        relay.handle_message(id, C::Join { channel: "room".into() });
        drain(&mut rx);

        relay.handle_message(id, C::Register { name: "b".into() });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "Cannot change name while in a channel".into()
            }]
        );
    }

    #[tokio::test]
    async fn mixer_runs_iff_channel_nonempty() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        assert!(!mixer_running(&relay, "room"));

        relay.handle_message(id, C::Join { channel: "room".into() });
        assert!(mixer_running(&relay, "room"));

        relay.handle_message(id, C::Leave);
        assert!(!mixer_running(&relay, "room"));

        relay.handle_message(id, C::Join { channel: "room".into() });
        assert!(mixer_running(&relay, "room"));
        drain(&mut rx);
    }

    #[tokio::test]
    async fn ingest_respects_push_to_talk_gate() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        relay.handle_message(id, C::Join { channel: "room".into() });
        drain(&mut rx);

        // Not talking: dropped.
        relay.ingest_frame(id, audio_frame());
        assert_eq!(relay.snapshot().clients[0].queue_size, 0);

        relay.handle_message(id, C::Talking { talking: true });
        relay.ingest_frame(id, audio_frame());
        assert_eq!(relay.snapshot().clients[0].queue_size, 1);

        // Wrong lengths: dropped, queue unchanged.
        relay.ingest_frame(id, Bytes::from(vec![0u8; FRAME_BYTES - 1]));
        relay.ingest_frame(id, Bytes::from(vec![0u8; FRAME_BYTES + 1]));
        assert_eq!(relay.snapshot().clients[0].queue_size, 1);

        // Muted: dropped.
        relay.handle_message(id, C::Mute { muted: true });
        relay.ingest_frame(id, audio_frame());
        assert_eq!(relay.snapshot().clients[0].queue_size, 1);
    }

    #[tokio::test]
    async fn ingest_caps_queue_at_capacity() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        relay.handle_message(id, C::Join { channel: "room".into() });
        relay.handle_message(id, C::Talking { talking: true });
        drain(&mut rx);

        for _ in 0..JITTER_CAPACITY + 2 {
            relay.ingest_frame(id, audio_frame());
        }
        assert_eq!(relay.snapshot().clients[0].queue_size, JITTER_CAPACITY);
    }

    #[tokio::test]
    async fn talking_broadcast_excludes_sender() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        relay.handle_message(b, C::Join { channel: "room".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.handle_message(a, C::Talking { talking: true });
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Talking {
                name: "a".into(),
                talking: true
            }]
        );
        assert_eq!(drain(&mut rx_a), vec![]);
    }

    #[tokio::test]
    async fn mute_replies_without_source() {
        let relay = relay();
        let (id, mut rx, _) = registered(&relay, "a");
        relay.handle_message(id, C::CreateChannel { channel: "room".into() });
        relay.handle_message(id, C::Join { channel: "room".into() });
        drain(&mut rx);

        relay.handle_message(id, C::Mute { muted: true });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Muted {
                muted: true,
                source: None
            }]
        );
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let relay = relay();
        let (id, mut rx, _) = client(&relay);
        relay.handle_message(id, C::Ping);
        assert_eq!(drain(&mut rx), vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn admin_created_channel_uses_sentinel_owner() {
        let relay = relay();
        let (_, mut rx, _) = registered(&relay, "a");
        relay.admin_create_channel("ops").unwrap();
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs[0],
            ServerMessage::ChannelCreated {
                channel: "ops".into(),
                owner: "admin".into()
            }
        );
        assert_eq!(relay.snapshot().channels[0].owner, "admin");
        assert_eq!(
            relay.admin_create_channel("ops"),
            Err(RelayError::AlreadyExists("ops".into()))
        );
        assert_eq!(
            relay.admin_create_channel("  "),
            Err(RelayError::MissingField("channel"))
        );
    }

    #[tokio::test]
    async fn admin_delete_detaches_members() {
        let relay = relay();
        let (a, mut rx_a, _) = registered(&relay, "a");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        drain(&mut rx_a);

        relay.admin_delete_channel("room").unwrap();
        let msgs = drain(&mut rx_a);
        assert_eq!(
            msgs[0],
            ServerMessage::ChannelClosed {
                channel: "room".into()
            }
        );
        assert!(relay.snapshot().channels.is_empty());
        assert_eq!(
            relay.admin_delete_channel("room"),
            Err(RelayError::NoSuchChannel("room".into()))
        );
    }

    #[tokio::test]
    async fn admin_force_join_and_leave() {
        let relay = relay();
        let (_, mut rx, _) = registered(&relay, "a");
        relay.admin_create_channel("ops").unwrap();
        drain(&mut rx);

        relay.admin_force_join("a", "ops").unwrap();
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs[0],
            ServerMessage::Joined {
                channel: "ops".into(),
                owner: "admin".into(),
                users: vec![],
            }
        );

        relay.admin_force_leave("a").unwrap();
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0], ServerMessage::Left);
        assert_eq!(relay.snapshot().clients[0].channel, None);

        assert_eq!(
            relay.admin_force_join("ghost", "ops"),
            Err(RelayError::NoSuchClient("ghost".into()))
        );
        assert_eq!(
            relay.admin_force_join("a", "nowhere"),
            Err(RelayError::NoSuchChannel("nowhere".into()))
        );
    }

    #[tokio::test]
    async fn admin_force_mute_notifies_with_source() {
        let relay = relay();
        let (a, mut rx, _) = registered(&relay, "a");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        drain(&mut rx);

        relay.admin_force_mute("a", true).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Muted {
                muted: true,
                source: Some("admin".into())
            }]
        );
        assert!(relay.snapshot().clients[0].muted);
    }

    #[tokio::test]
    async fn admin_kick_removes_session_and_closes_transport() {
        let relay = relay();
        let (a, mut rx_a, token_a) = registered(&relay, "a");
        let (b, mut rx_b, _) = registered(&relay, "b");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        relay.handle_message(b, C::Join { channel: "room".into() });
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.admin_kick("a").unwrap();
        let msgs = drain(&mut rx_a);
        assert_eq!(
            msgs[0],
            ServerMessage::Kicked {
                message: "Disconnected by an administrator".into()
            }
        );
        let msgs = drain(&mut rx_b);
        assert_eq!(
            msgs[0],
            ServerMessage::UserLeft {
                name: "a".into(),
                channel: "room".into()
            }
        );
        assert!(token_a.is_cancelled());
        assert_eq!(relay.session_count(), 1);

        // Disconnect after kick is a no-op.
        relay.disconnect(a);
        assert_eq!(relay.session_count(), 1);
    }

    #[tokio::test]
    async fn snapshot_reports_membership_flags() {
        let relay = relay();
        let (a, mut rx, _) = registered(&relay, "a");
        relay.handle_message(a, C::CreateChannel { channel: "room".into() });
        relay.handle_message(a, C::Join { channel: "room".into() });
        relay.handle_message(a, C::Talking { talking: true });
        relay.ingest_frame(a, audio_frame());
        drain(&mut rx);

        let snap = relay.snapshot();
        assert_eq!(snap.clients.len(), 1);
        let c = &snap.clients[0];
        assert_eq!(c.name.as_deref(), Some("a"));
        assert_eq!(c.channel.as_deref(), Some("room"));
        assert!(c.talking);
        assert!(!c.muted);
        assert_eq!(c.queue_size, 1);
    }
}
