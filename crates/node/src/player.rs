//! Per-guild players: a track queue on top of a node's player commands.
//!
//! [`Players`] is an [`EventHandler`]: hand it to the pool's nodes and it
//! routes each guild's track events and position updates to that guild's
//! [`Player`], which starts the next queued track when one finishes.  Feed
//! it the chat gateway's frames through [`Players::on_gateway_event`] and it
//! also forwards the voice handshake to the guild's node.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use lp_protocol::{
    ChannelId, Command, GuildId, IncomingOp, Payload, PlayerUpdate, TrackEndReason, TrackEvent,
    UserId, VoiceDispatch,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::node::{Node, WeakNode};
use crate::pool::{NodePool, WeakNodePool};
use crate::types::{EventHandler, PoolError};
use crate::voice::{join_voice, leave_voice, VoiceProgress, VoiceSessions, VoiceStateTracker};

/// Highest volume a node accepts.
pub const MAX_VOLUME: i32 = 150;
const DEFAULT_VOLUME: i32 = 100;

/// A playable track as returned by a node's track search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Opaque track identifier sent back in `play`.
    pub encoded: String,
    /// Length in milliseconds; `None` for streams and unknown lengths.
    pub length_ms: Option<i64>,
    pub seekable: bool,
}

impl Track {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
            length_ms: None,
            seekable: false,
        }
    }

    /// A track that can be seeked anywhere within `length_ms`.
    pub fn seekable(encoded: impl Into<String>, length_ms: i64) -> Self {
        Self {
            encoded: encoded.into(),
            length_ms: Some(length_ms),
            seekable: true,
        }
    }
}

struct PlayerInner {
    /// Weak: the node's handler owns this player.
    node: WeakNode,
    channel: Option<ChannelId>,
    queue: VecDeque<Track>,
    current: Option<Track>,
    position: i64,
    paused: bool,
    playing: bool,
    repeat: bool,
    volume: i32,
    metadata: HashMap<String, Value>,
}

impl PlayerInner {
    fn send(&self, command: Command) {
        match self.node.upgrade() {
            Some(node) => node.send(command),
            None => tracing::warn!(op = command.op(), "player's node is gone, command dropped"),
        }
    }

    fn play_next(&mut self, guild_id: GuildId) {
        if self.repeat {
            if let Some(current) = self.current.take() {
                self.queue.push_back(current);
            }
        }
        self.current = None;
        self.position = 0;
        self.paused = false;

        match self.queue.pop_front() {
            Some(track) => {
                self.playing = true;
                self.send(Command::play(guild_id, track.encoded.as_str()));
                self.current = Some(track);
            }
            None => self.stop(guild_id),
        }
    }

    fn stop(&mut self, guild_id: GuildId) {
        self.send(Command::stop(guild_id));
        self.queue.clear();
        self.current = None;
        self.position = 0;
        self.paused = false;
        self.playing = false;
    }
}

/// Playback state and queue of one guild.  Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct Player {
    guild_id: GuildId,
    inner: Arc<Mutex<PlayerInner>>,
}

impl Player {
    fn new(guild_id: GuildId, node: &Node, channel: Option<ChannelId>) -> Self {
        Self {
            guild_id,
            inner: Arc::new(Mutex::new(PlayerInner {
                node: node.downgrade(),
                channel,
                queue: VecDeque::new(),
                current: None,
                position: 0,
                paused: false,
                playing: false,
                repeat: false,
                volume: DEFAULT_VOLUME,
                metadata: HashMap::new(),
            })),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// The node playing this guild; `None` once that node is dropped.
    pub fn node(&self) -> Option<Node> {
        self.inner.lock().node.upgrade()
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.inner.lock().channel
    }

    pub fn current(&self) -> Option<Track> {
        self.inner.lock().current.clone()
    }

    pub fn queue(&self) -> Vec<Track> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Last reported position in the current track, in milliseconds.
    pub fn position(&self) -> i64 {
        self.inner.lock().position
    }

    /// Playing and not paused.
    pub fn is_playing(&self) -> bool {
        let inner = self.inner.lock();
        inner.playing && !inner.paused
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn volume(&self) -> i32 {
        self.inner.lock().volume
    }

    pub fn repeat(&self) -> bool {
        self.inner.lock().repeat
    }

    /// With repeat on, a track that ends goes back to the end of the queue.
    pub fn set_repeat(&self, repeat: bool) {
        self.inner.lock().repeat = repeat;
    }

    pub fn store(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().metadata.insert(key.into(), value);
    }

    pub fn fetch(&self, key: &str) -> Option<Value> {
        self.inner.lock().metadata.get(key).cloned()
    }

    /// Append `track` to the queue.  Does not start playback.
    pub fn add(&self, track: Track) {
        self.inner.lock().queue.push_back(track);
    }

    /// Start the next queued track, replacing the current one.  An empty
    /// queue stops playback.
    pub fn play(&self) {
        self.inner.lock().play_next(self.guild_id);
    }

    /// Stop playback and clear the queue.
    pub fn stop(&self) {
        self.inner.lock().stop(self.guild_id);
    }

    pub fn skip(&self) {
        self.play();
    }

    pub fn pause(&self, pause: bool) {
        let mut inner = self.inner.lock();
        inner.send(Command::pause(self.guild_id, pause));
        inner.paused = pause;
    }

    /// Set the volume, clamped to `0..=MAX_VOLUME`.
    pub fn set_volume(&self, volume: i32) {
        let mut inner = self.inner.lock();
        inner.volume = volume.clamp(0, MAX_VOLUME);
        inner.send(Command::volume(self.guild_id, inner.volume));
    }

    /// Seek within the current track, clamped to its length.  Returns
    /// `false` (and sends nothing) when there is no seekable track.
    pub fn seek(&self, position: i64) -> bool {
        let inner = self.inner.lock();
        let Some(length) = inner
            .current
            .as_ref()
            .filter(|t| t.seekable)
            .and_then(|t| t.length_ms)
        else {
            return false;
        };
        inner.send(Command::seek(self.guild_id, position.clamp(0, length.max(0))));
        true
    }

    fn handle_event(&self, event: &TrackEvent) {
        let TrackEvent::End { reason, .. } = event else {
            tracing::debug!(guild = %self.guild_id, kind = ?event.kind(), "track problem reported");
            return;
        };
        let mut inner = self.inner.lock();
        match reason {
            Some(reason) if reason.may_start_next() => inner.play_next(self.guild_id),
            // The replacing track is already playing.
            Some(TrackEndReason::Replaced) => {}
            _ => inner.playing = false,
        }
    }

    fn handle_update(&self, update: &PlayerUpdate) {
        let mut inner = self.inner.lock();
        if update.state.position > inner.position {
            inner.paused = false;
            inner.playing = true;
        }
        inner.position = update.state.position;
    }

    fn move_to(&self, node: &Node, channel: ChannelId) {
        let mut inner = self.inner.lock();
        inner.node = node.downgrade();
        inner.channel = Some(channel);
    }
}

/// Registry of the client's players, one per guild it is in voice in.
pub struct Players {
    pool: WeakNodePool,
    voice: VoiceStateTracker,
    players: RwLock<HashMap<GuildId, Player>>,
    listener: Option<Arc<dyn EventHandler>>,
}

impl Players {
    /// `user_id` is the client's own account; voice states of other members
    /// are ignored.
    pub fn new(pool: &NodePool, user_id: UserId) -> Self {
        Self {
            pool: pool.downgrade(),
            voice: VoiceStateTracker::new(user_id),
            players: RwLock::new(HashMap::new()),
            listener: None,
        }
    }

    /// Also pass every node frame on to `listener`, after routing.
    pub fn with_listener(mut self, listener: Arc<dyn EventHandler>) -> Self {
        self.listener = Some(listener);
        self
    }

    fn pool(&self) -> Result<NodePool, PoolError> {
        self.pool.upgrade().ok_or(PoolError::NoNodesAvailable)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Player> {
        self.players.read().get(&guild_id).cloned()
    }

    pub fn remove(&self, guild_id: GuildId) -> Option<Player> {
        self.players.write().remove(&guild_id)
    }

    pub fn len(&self) -> usize {
        self.players.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.read().is_empty()
    }

    /// Join `channel`, creating the guild's player or moving the existing
    /// one.
    pub async fn connect(
        &self,
        sessions: &dyn VoiceSessions,
        guild_id: GuildId,
        channel: ChannelId,
    ) -> Result<Player, PoolError> {
        let pool = self.pool()?;
        let node = join_voice(&pool, sessions, guild_id, channel).await?;

        let mut players = self.players.write();
        let player = players
            .entry(guild_id)
            .or_insert_with(|| Player::new(guild_id, &node, Some(channel)));
        player.move_to(&node, channel);
        Ok(player.clone())
    }

    /// Ask the gateway to leave voice in `guild_id`.  The player goes away
    /// once the gateway confirms the leave.
    pub async fn disconnect(
        &self,
        sessions: &dyn VoiceSessions,
        guild_id: GuildId,
    ) -> Result<(), PoolError> {
        leave_voice(sessions, guild_id).await
    }

    /// Leave voice in every guild with a player.  Failures are logged.
    pub async fn disconnect_all(&self, sessions: &dyn VoiceSessions) {
        let guilds: Vec<GuildId> = self.players.read().keys().copied().collect();
        for guild_id in guilds {
            if let Err(e) = leave_voice(sessions, guild_id).await {
                tracing::warn!(guild = %guild_id, error = %e, "voice leave failed");
            }
        }
        tracing::debug!("players disconnected");
    }

    /// Feed one chat-gateway frame.  Non-voice dispatches are ignored.
    ///
    /// The client's own join creates the guild's player if it has none, a
    /// leave removes it, and once both halves of the voice handshake are in
    /// the guild's node gets a `voiceUpdate`.
    pub fn on_gateway_event(&self, frame: &Value) -> Result<VoiceProgress, PoolError> {
        let Some(dispatch) = VoiceDispatch::from_gateway(frame)? else {
            return Ok(VoiceProgress::Ignored);
        };
        tracing::debug!(guild = %dispatch.guild_id(), "voice dispatch received");

        let joined = match &dispatch {
            VoiceDispatch::StateUpdate {
                guild_id,
                user_id,
                channel_id: Some(channel),
                ..
            } if *user_id == self.voice.user_id() => Some((*guild_id, *channel)),
            _ => None,
        };

        let progress = self.voice.apply(dispatch);
        match &progress {
            VoiceProgress::Left { guild_id } => {
                if self.remove(*guild_id).is_some() {
                    tracing::debug!(guild = %guild_id, "left voice, player removed");
                }
            }
            VoiceProgress::Ready {
                guild_id,
                session_id,
                event,
            } => {
                if let Some((guild, channel)) = joined {
                    self.ensure_player(guild, channel)?;
                }
                let node = match self.get(*guild_id).and_then(|p| p.node()) {
                    Some(node) => node,
                    None => self.pool()?.assign_or_get(*guild_id)?,
                };
                node.voice_update(*guild_id, session_id, event.clone());
            }
            VoiceProgress::Pending => {
                if let Some((guild, channel)) = joined {
                    self.ensure_player(guild, channel)?;
                }
            }
            VoiceProgress::Ignored => {}
        }
        Ok(progress)
    }

    fn ensure_player(&self, guild_id: GuildId, channel: ChannelId) -> Result<(), PoolError> {
        if let Some(player) = self.get(guild_id) {
            player.inner.lock().channel = Some(channel);
            return Ok(());
        }
        tracing::debug!(guild = %guild_id, "voice joined without a player, creating one");
        let node = self.pool()?.assign_or_get(guild_id)?;
        self.players
            .write()
            .entry(guild_id)
            .or_insert_with(|| Player::new(guild_id, &node, Some(channel)));
        Ok(())
    }
}

impl EventHandler for Players {
    fn handle(&self, op: IncomingOp, payload: Payload, raw: &Value) {
        if let Some(guild_id) = payload.guild_id() {
            match (self.get(guild_id), &payload) {
                (Some(player), Payload::Event(event)) => player.handle_event(event),
                (Some(player), Payload::PlayerUpdate(update)) => player.handle_update(update),
                (None, _) => {
                    tracing::debug!(guild = %guild_id, op = %op, "frame for a guild with no player");
                }
                (Some(_), Payload::Stats(_)) => {}
            }
        }
        if let Some(listener) = &self.listener {
            listener.handle(op, payload, raw);
        }
    }
}
