//! Core relay state: the session table and channel registry.
//!
//! Both tables live in one [`RelayState`] struct guarded by a single
//! exclusive lock inside [`Relay`](super::Relay). Every mutation - message
//! handlers, mixer ticks, watchdog sweeps, admin calls - goes through that
//! lock, which is what makes the membership and ownership invariants hold
//! without per-channel locking.
//!
//! Outbound traffic is enqueued under the same lock through non-blocking
//! [`ClientHandle::send`] calls; a full or closed per-session queue drops
//! the item instead of stalling the caller.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::JitterBuffer;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ChannelInfo, ServerMessage};

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Path
// ─────────────────────────────────────────────────────────────────────────────

/// One item on a session's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A signalling message, serialized by the connection's writer task.
    Message(ServerMessage),
    /// A mixed 640-byte PCM frame, sent as a binary WebSocket message.
    Frame(Bytes),
}

/// Non-owning handle to a session's transport.
///
/// Holds the sending half of the session's outbound queue plus the
/// connection's cancellation token. Memberships keep a clone of this handle
/// so the mixer can reach a listener without touching the session table.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ClientHandle {
    pub fn new(tx: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Enqueues a signalling message. Drops it when the queue is full or
    /// the connection is gone.
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.tx.try_send(Outbound::Message(msg));
    }

    /// Enqueues a mixed audio frame. Drops it when the queue is full or
    /// the connection is gone - the mixer never waits on a slow client.
    pub fn send_frame(&self, frame: Bytes) {
        if self.tx.try_send(Outbound::Frame(frame)).is_err() {
            log::trace!("[Mixer] Outbound queue full or closed, frame dropped");
        }
    }

    /// Signals the connection handler to terminate the transport.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Data Model
// ─────────────────────────────────────────────────────────────────────────────

/// One live connection.
///
/// Created on connect; the name is set by the first `register`; destroyed
/// on disconnect or watchdog eviction.
pub struct Session {
    pub name: Option<String>,
    /// Name of the channel this session is currently joined to, if any.
    pub channel: Option<String>,
    pub connected_at: Instant,
    /// Refreshed only by `ping`; starts at `connected_at`.
    pub last_ping_at: Instant,
    pub handle: ClientHandle,
}

impl Session {
    pub fn new(handle: ClientHandle) -> Self {
        let now = Instant::now();
        Self {
            name: None,
            channel: None,
            connected_at: now,
            last_ping_at: now,
            handle,
        }
    }
}

/// A session's seat inside one channel.
pub struct Membership {
    /// Back-reference to the owning session. Non-owning: the session is
    /// removed independently and must take this membership with it.
    pub session_id: Uuid,
    pub handle: ClientHandle,
    pub queue: JitterBuffer,
    pub talking: bool,
    pub muted: bool,
}

impl Membership {
    pub fn new(session_id: Uuid, handle: ClientHandle) -> Self {
        Self {
            session_id,
            handle,
            queue: JitterBuffer::new(),
            talking: false,
            muted: false,
        }
    }
}

/// A named conference channel.
///
/// Channels survive becoming empty; only `close_channel` or an admin delete
/// removes the entry. The owner never changes once set.
pub struct Channel {
    pub owner: String,
    pub members: HashMap<String, Membership>,
    /// Cancellation token of the running mix task; `Some` iff members is
    /// non-empty.
    pub mixer: Option<CancellationToken>,
}

impl Channel {
    pub fn new(owner: String) -> Self {
        Self {
            owner,
            members: HashMap::new(),
            mixer: None,
        }
    }

    pub fn mixer_running(&self) -> bool {
        self.mixer.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Combined State
// ─────────────────────────────────────────────────────────────────────────────

/// The session table and channel registry, mutated only under the relay lock.
#[derive(Default)]
pub struct RelayState {
    pub sessions: HashMap<Uuid, Session>,
    pub channels: HashMap<String, Channel>,
}

impl RelayState {
    /// Returns the session's registered name, or `NotRegistered`.
    pub fn require_name(&self, id: Uuid) -> RelayResult<String> {
        self.sessions
            .get(&id)
            .and_then(|s| s.name.clone())
            .ok_or(RelayError::NotRegistered)
    }

    /// First session registered under `name`, in table iteration order.
    /// Names are not globally unique; duplicates resolve arbitrarily.
    pub fn find_by_name(&self, name: &str) -> Option<Uuid> {
        self.sessions
            .iter()
            .find(|(_, s)| s.name.as_deref() == Some(name))
            .map(|(id, _)| *id)
    }

    /// Current channel list, sorted by name for stable output.
    pub fn channel_list(&self) -> Vec<ChannelInfo> {
        let mut list: Vec<ChannelInfo> = self
            .channels
            .iter()
            .map(|(name, channel)| {
                let mut users: Vec<String> = channel.members.keys().cloned().collect();
                users.sort();
                ChannelInfo {
                    name: name.clone(),
                    owner: channel.owner.clone(),
                    user_count: users.len(),
                    users,
                }
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Enqueues `msg` to every registered session.
    pub fn broadcast_all(&self, msg: &ServerMessage) {
        for session in self.sessions.values() {
            if session.name.is_some() {
                session.handle.send(msg.clone());
            }
        }
    }

    /// Enqueues `msg` to every member of `channel`, optionally skipping one
    /// member by name.
    pub fn broadcast_channel(&self, channel: &str, msg: &ServerMessage, except: Option<&str>) {
        if let Some(ch) = self.channels.get(channel) {
            for (name, member) in &ch.members {
                if except != Some(name.as_str()) {
                    member.handle.send(msg.clone());
                }
            }
        }
    }

    /// Detaches a session from its current channel, if any.
    ///
    /// Removes the membership, stops the mixer when the channel empties,
    /// and broadcasts `user_left` to the remaining members. The channel
    /// entry itself always survives. Returns the channel that was left.
    pub fn detach(&mut self, id: Uuid) -> Option<String> {
        let session = self.sessions.get_mut(&id)?;
        let channel_name = session.channel.take()?;
        let name = session.name.clone().unwrap_or_default();

        let mut notify_remaining = false;
        if let Some(channel) = self.channels.get_mut(&channel_name) {
            channel.members.remove(&name);
            if channel.members.is_empty() {
                if let Some(token) = channel.mixer.take() {
                    token.cancel();
                    log::info!("[Mixer] Stopped for empty channel '{}'", channel_name);
                }
            } else {
                notify_remaining = true;
            }
        }
        if notify_remaining {
            self.broadcast_channel(
                &channel_name,
                &ServerMessage::UserLeft {
                    name,
                    channel: channel_name.clone(),
                },
                None,
            );
        }
        Some(channel_name)
    }

    /// Removes a channel outright: members are detached with a
    /// `channel_closed` notice, the mixer is stopped, and the deletion is
    /// broadcast. Shared by owner close and admin delete.
    pub fn close_channel(&mut self, name: &str) -> RelayResult<()> {
        let mut channel = self
            .channels
            .remove(name)
            .ok_or_else(|| RelayError::NoSuchChannel(name.to_string()))?;

        if let Some(token) = channel.mixer.take() {
            token.cancel();
            log::info!("[Mixer] Stopped for closed channel '{}'", name);
        }
        for (_, membership) in channel.members.drain() {
            if let Some(session) = self.sessions.get_mut(&membership.session_id) {
                session.channel = None;
            }
            membership.handle.send(ServerMessage::ChannelClosed {
                channel: name.to_string(),
            });
        }

        self.broadcast_all(&ServerMessage::ChannelDeleted {
            channel: name.to_string(),
        });
        let list = self.channel_list();
        self.broadcast_all(&ServerMessage::Channels { list });
        log::info!("[Signal] Channel '{}' closed", name);
        Ok(())
    }
}
