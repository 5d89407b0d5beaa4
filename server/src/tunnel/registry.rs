//! Client registry: connected agents and in-flight exchange channels.
//!
//! Two tables, both owned here and mutated only through this type:
//!
//! - **agents**: routing id → live [`Agent`] (one per socket)
//! - **channels**: channel id → inbox of the exchange that owns it
//!
//! Lock order is always agents, then channels. Neither lock is held across
//! an `.await`; delivery clones the inbox sender first and then awaits its
//! capacity, which is what pauses the agent's socket reader when an exchange
//! falls behind.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::channel::{self, Allocation, PROTOCOL_CHANNEL};
use super::error::TunnelError;
use super::message::{Frame, Message};

/// Capacity of each agent's outbound socket queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of each exchange's inbox.
pub const INBOX_CAPACITY: usize = 64;

/// Longest accepted agent key.
const MAX_KEY_LEN: usize = 128;

/// Keys that collide with the gateway's own routes under the root prefix.
const RESERVED_KEYS: [&str; 2] = ["ws", "api"];

/// Connection state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Connecting,
    Connected,
    Closed,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

/// One authenticated tunnel endpoint bound to one socket.
pub struct Agent {
    /// Caller-chosen key. Never logged or sent over the tunnel.
    pub key: String,
    /// Checksum of `key`, used everywhere the agent must be named.
    pub id: String,
    /// Registration generation, distinguishes reconnects with the same key.
    conn: u64,
    tx: mpsc::Sender<Message>,
    state: AtomicU8,
    connected_since: Instant,
    /// Last inbound frame, as ms since `connected_since` (lock-free).
    last_seen_ms: AtomicU64,
    /// Tells the socket handler to stop when a reconnect replaces it.
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == AgentState::Connected && !self.tx.is_closed()
    }

    pub fn connected_since(&self) -> Instant {
        self.connected_since
    }

    /// Record that the socket delivered something (a frame or a ping).
    pub fn touch(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.connected_since.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Time since the socket last delivered anything.
    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.connected_since.elapsed().saturating_sub(last_seen)
    }

    /// Queue a message on this agent's socket, waiting for queue capacity.
    pub async fn send(&self, message: Message) -> Result<(), TunnelError> {
        self.tx.send(message).await.map_err(|_| {
            TunnelError::GatewayUnreachable(format!("Agent {} socket closed", self.id))
        })
    }

    /// Queue a message, giving up once `timeout` passes without capacity.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn send_within(&self, message: Message, timeout: Duration) -> Result<(), TunnelError> {
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => TunnelError::Timeout(timeout.as_millis() as u64),
                SendTimeoutError::Closed(_) => {
                    TunnelError::GatewayUnreachable(format!("Agent {} socket closed", self.id))
                }
            })
    }

    /// Queue a message without waiting. Used for best-effort notices.
    pub fn try_send(&self, message: Message) -> bool {
        self.tx.try_send(message).is_ok()
    }

    /// Resolves to `true` once this binding is replaced or closed.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct ChannelEntry {
    conn: u64,
    inbox: mpsc::Sender<Message>,
}

struct Inner {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    next_conn: AtomicU64,
}

/// Shared handle to the gateway's agent and channel tables.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<Inner>,
}

/// A channel opened for one exchange.
pub struct OpenChannel {
    pub allocation: Allocation,
    /// Messages the agent sends on this channel, in socket order.
    pub inbox: mpsc::Receiver<Message>,
    pub retirement: Retirement,
}

/// Removes a channel-table entry when retired or dropped.
pub struct Retirement {
    registry: ClientRegistry,
    channel_id: String,
}

impl Retirement {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn retire(self) {
        drop(self);
    }
}

impl Drop for Retirement {
    fn drop(&mut self) {
        self.registry.retire(&self.channel_id);
    }
}

/// Validate key format: alphanumeric, dash, underscore, dot, 1-128 chars,
/// and not one of the gateway's own path segments.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !RESERVED_KEYS.contains(&key)
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                agents: RwLock::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// Bind a socket's outbound queue to the routing id derived from `key`.
    ///
    /// A reconnect with the same key replaces the old binding: the old socket
    /// handler is signalled to stop and its open exchanges are failed. A
    /// different key that hashes to an occupied routing id is refused.
    pub fn register(
        &self,
        key: &str,
        tx: mpsc::Sender<Message>,
    ) -> Result<Arc<Agent>, TunnelError> {
        if !is_valid_key(key) {
            return Err(TunnelError::DuplicateOrInvalid(
                "Invalid agent key".to_string(),
            ));
        }
        let id = channel::routing_id(key);
        let (shutdown_tx, _) = watch::channel(false);
        let agent = Arc::new(Agent {
            key: key.to_string(),
            id: id.clone(),
            conn: self.inner.next_conn.fetch_add(1, Ordering::Relaxed),
            tx,
            state: AtomicU8::new(AgentState::Connecting as u8),
            connected_since: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            shutdown_tx,
        });

        let mut agents = write(&self.inner.agents);
        if let Some(old) = agents.get(&id) {
            if old.key != key {
                return Err(TunnelError::DuplicateOrInvalid(format!(
                    "Routing id {id} is bound to another agent"
                )));
            }
            warn!(agent = %id, "Agent re-registering while old connection exists, evicting old");
            old.set_state(AgentState::Closed);
            let _ = old.shutdown_tx.send(true);
            let failed = self.drop_channels_of(old.conn);
            if failed > 0 {
                info!(agent = %id, count = failed, "Failed exchanges of replaced connection");
            }
        }
        agent.set_state(AgentState::Connected);
        agents.insert(id, agent.clone());
        Ok(agent)
    }

    /// Connected agent for a routing id.
    pub fn lookup(&self, routing_id: &str) -> Option<Arc<Agent>> {
        read(&self.inner.agents)
            .get(routing_id)
            .filter(|a| a.is_connected())
            .cloned()
    }

    pub fn agents(&self) -> Vec<Arc<Agent>> {
        read(&self.inner.agents).values().cloned().collect()
    }

    /// Allocate a channel for a new exchange on `agent`.
    pub fn open_channel(&self, agent: &Agent) -> Result<OpenChannel, TunnelError> {
        let agents = read(&self.inner.agents);
        let bound = agents
            .get(&agent.id)
            .is_some_and(|a| a.conn == agent.conn && a.is_connected());
        if !bound {
            return Err(TunnelError::NoSuchAgent(format!(
                "Agent {} is not connected",
                agent.id
            )));
        }

        let mut channels = lock(&self.inner.channels);
        let allocation = channel::allocate(|c| channels.contains_key(c))?;
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        channels.insert(
            allocation.channel_id.clone(),
            ChannelEntry {
                conn: agent.conn,
                inbox: inbox_tx,
            },
        );
        drop(channels);
        drop(agents);

        let retirement = Retirement {
            registry: self.clone(),
            channel_id: allocation.channel_id.clone(),
        };
        Ok(OpenChannel {
            allocation,
            inbox,
            retirement,
        })
    }

    /// Remove a channel. Returns whether it was still open.
    pub fn retire(&self, channel_id: &str) -> bool {
        lock(&self.inner.channels).remove(channel_id).is_some()
    }

    pub fn is_open(&self, channel_id: &str) -> bool {
        lock(&self.inner.channels).contains_key(channel_id)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Open channels owned by this agent connection.
    pub fn open_channels(&self, agent: &Agent) -> usize {
        lock(&self.inner.channels)
            .values()
            .filter(|e| e.conn == agent.conn)
            .count()
    }

    /// Decode an inbound frame and deliver it to the exchange owning its channel.
    ///
    /// Undecodable frames are answered with a protocol `error` notice and
    /// otherwise ignored. Messages for unknown channels are dropped: late
    /// messages after an exchange ended are expected.
    pub async fn dispatch(&self, frame: &Frame, source: &Agent) {
        let message = match frame.decode() {
            Ok(m) => m,
            Err(e) => {
                warn!(agent = %source.id, error = %e, "Dropping unparsable frame");
                let notice = Message::error(PROTOCOL_CHANNEL, e.to_detail());
                let _ = source.send(notice).await;
                return;
            }
        };

        let inbox = {
            let channels = lock(&self.inner.channels);
            match channels.get(&message.channel) {
                Some(entry) if entry.conn == source.conn => entry.inbox.clone(),
                Some(_) => {
                    warn!(
                        agent = %source.id,
                        channel = %message.channel,
                        "Message for a channel of another agent (dropped)"
                    );
                    return;
                }
                None => {
                    debug!(
                        channel = %message.channel,
                        event = %message.event(),
                        "Message for closed or unknown channel (dropped)"
                    );
                    return;
                }
            }
        };

        if inbox.send(message).await.is_err() {
            debug!(agent = %source.id, "Exchange ended before delivery");
        }
    }

    /// Unbind a closed agent and fail its open exchanges.
    ///
    /// Dropping a channel's inbox sender is the failure signal: the exchange
    /// sees its inbox end and answers `502`. Returns the number failed.
    pub fn on_agent_closed(&self, agent: &Agent) -> usize {
        agent.set_state(AgentState::Closed);
        let mut agents = write(&self.inner.agents);
        if agents.get(&agent.id).is_some_and(|a| a.conn == agent.conn) {
            agents.remove(&agent.id);
        }
        let failed = self.drop_channels_of(agent.conn);
        drop(agents);
        if failed > 0 {
            info!(agent = %agent.id, count = failed, "Failed open exchanges of closed agent");
        }
        failed
    }

    /// Evict agents whose socket has been silent for longer than `timeout`,
    /// failing their open exchanges. Returns the evicted routing ids.
    ///
    /// One write-lock pass, so an agent touched concurrently is either seen
    /// fresh or evicted, never half-removed.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let mut agents = write(&self.inner.agents);
        let dead: Vec<Arc<Agent>> = agents
            .values()
            .filter(|a| a.idle_for() > timeout)
            .cloned()
            .collect();
        for agent in &dead {
            agents.remove(&agent.id);
            agent.set_state(AgentState::Closed);
            let _ = agent.shutdown_tx.send(true);
            let failed = self.drop_channels_of(agent.conn);
            warn!(agent = %agent.id, failed, "Evicted agent (heartbeat timeout)");
        }
        dead.iter().map(|a| a.id.clone()).collect()
    }

    /// Close every binding (gateway shutdown).
    pub fn close_all(&self) {
        let agents: Vec<Arc<Agent>> = write(&self.inner.agents).drain().map(|(_, a)| a).collect();
        for agent in &agents {
            agent.set_state(AgentState::Closed);
            let _ = agent.shutdown_tx.send(true);
        }
        lock(&self.inner.channels).clear();
    }

    fn drop_channels_of(&self, conn: u64) -> usize {
        let mut channels = lock(&self.inner.channels);
        let before = channels.len();
        channels.retain(|_, entry| entry.conn != conn);
        before - channels.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
