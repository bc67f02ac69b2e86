//! The "EXCHANGE" Layer - vehicle states over TCP inside a formed group
//!
//! Star topology around the coordinator:
//! - **Coordinator** listens, keeps one connection per participant, ingests what
//!   they send and relays each accepted record to every *other* participant
//! - **Participant** keeps one outbound connection to the coordinator, opened
//!   lazily and re-opened on the next send after a failure
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)           │
//! │ Big-endian u32   │ JSON-encoded VehicleState    │
//! └──────────────────┴──────────────────────────────┘
//! ```
//!
//! - **Oversized length**: connection closed
//! - **Undecodable payload**: logged and discarded, connection stays open
//! - **Read or write failure**: only that connection is closed; the role survives

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::convoy_peers::{IngestOutcome, PeerTable, SosLedger};
use crate::lock;
use crate::vehicle::VehicleState;

/// Port the coordinator listens on.
pub const DEFAULT_PORT: u16 = 8888;

/// Length prefix size in bytes.
const LENGTH_PREFIX: usize = 4;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Coordinator bind address (default: 0.0.0.0:8888)
    pub listen_addr: SocketAddr,

    /// Period of the own-state broadcast (default: 1000 ms)
    pub send_interval_ms: u64,

    /// Outbound connect timeout (default: 5000 ms)
    pub connect_timeout_ms: u64,

    /// Per-frame write timeout (default: 5000 ms)
    pub write_timeout_ms: u64,

    /// A connection silent for this long is closed (default: 15000 ms)
    pub read_idle_timeout_ms: u64,

    /// Largest accepted payload (default: 64 KiB)
    pub max_frame_bytes: usize,

    /// Coordinator forwards participants' records to each other (default: true)
    pub relay: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            send_interval_ms: 1_000,
            connect_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            read_idle_timeout_ms: 15_000,
            max_frame_bytes: 64 * 1024,
            relay: true,
        }
    }
}

impl ExchangeConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.read_idle_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed vehicle state: {0}")]
    Malformed(String),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected to a group")]
    NotConnected,
}

// ============================================================================
// WIRE CODEC
// ============================================================================

/// Serializes a state into one length-prefixed frame.
pub fn encode_frame(state: &VehicleState) -> Result<Vec<u8>, ExchangeError> {
    let payload =
        serde_json::to_vec(state).map_err(|e| ExchangeError::Malformed(e.to_string()))?;
    Ok(frame_payload(&payload))
}

/// Prefixes an already-encoded payload with its length.
pub fn frame_payload(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parses and validates a frame payload.
pub fn decode_state(payload: &[u8]) -> Result<VehicleState, ExchangeError> {
    let state: VehicleState =
        serde_json::from_slice(payload).map_err(|e| ExchangeError::Malformed(e.to_string()))?;

    if !state.is_valid() {
        return Err(ExchangeError::Malformed(format!(
            "out-of-range fields from {}",
            state.device_id
        )));
    }
    Ok(state)
}

/// Reads one frame payload. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>, ExchangeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(prefix) as usize;
    if size > max_frame_bytes {
        return Err(ExchangeError::FrameTooLarge {
            size,
            limit: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

// ============================================================================
// INBOUND PROCESSING
// ============================================================================

/// Outcome of one received payload.
#[derive(Debug)]
pub enum Inbound {
    /// Stored in the peer table, or a first-seen distress call that arrived
    /// behind a newer record (surfaced and relayed, not stored)
    Accepted {
        state: VehicleState,
        /// First sighting of this distress id
        new_sos: bool,
    },

    /// Well-formed but not stored (own echo, or older than what we hold)
    Ignored(IngestOutcome),

    Malformed(ExchangeError),
}

/// Decodes a payload and applies it to the peer table and SOS ledger.
pub fn accept_payload(
    payload: &[u8],
    peers: &mut PeerTable,
    sos: &mut SosLedger,
    now: Duration,
) -> Inbound {
    let state = match decode_state(payload) {
        Ok(state) => state,
        Err(e) => return Inbound::Malformed(e),
    };

    let outcome = peers.ingest(state.clone(), now);
    if outcome.accepted() {
        let new_sos = state.is_sos && sos.observe(&state);
        return Inbound::Accepted { state, new_sos };
    }

    // A distress call is never lost to ordering
    if outcome == IngestOutcome::Outdated && sos.observe(&state) {
        debug!("Surfacing late SOS from {}", state.device_id);
        return Inbound::Accepted { state, new_sos: true };
    }
    Inbound::Ignored(outcome)
}

// ============================================================================
// CONNECTION SET
// ============================================================================

pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

struct Connection {
    writer: Arc<tokio::sync::Mutex<FrameWriter>>,
    reader: Option<AbortHandle>,
}

#[derive(Default)]
struct ConnectionTable {
    next_id: u64,
    connections: BTreeMap<ConnectionId, Connection>,
}

/// Result of a fan-out write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,

    /// Connections closed because their write failed or timed out
    pub dropped: Vec<ConnectionId>,
}

/// The coordinator's accepted connections.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    inner: Arc<Mutex<ConnectionTable>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, writer: FrameWriter) -> ConnectionId {
        let mut table = lock(&self.inner);
        table.next_id += 1;
        let id = ConnectionId(table.next_id);
        table.connections.insert(
            id,
            Connection {
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                reader: None,
            },
        );
        id
    }

    /// Ties the connection's read task to it, so closing one aborts the other.
    pub fn attach_reader(&self, id: ConnectionId, reader: AbortHandle) {
        match lock(&self.inner).connections.get_mut(&id) {
            Some(connection) => connection.reader = Some(reader),
            None => reader.abort(),
        }
    }

    /// Removes a connection and aborts its read task.
    pub fn close(&self, id: ConnectionId) -> bool {
        let removed = lock(&self.inner).connections.remove(&id);
        match removed {
            Some(connection) => {
                if let Some(reader) = connection.reader {
                    reader.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Removes a connection whose read task is already finishing.
    pub fn release(&self, id: ConnectionId) -> bool {
        lock(&self.inner).connections.remove(&id).is_some()
    }

    pub fn clear(&self) {
        let drained = std::mem::take(&mut lock(&self.inner).connections);
        for connection in drained.into_values() {
            if let Some(reader) = connection.reader {
                reader.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        lock(&self.inner).connections.keys().copied().collect()
    }

    /// Writes `frame` to every connection except `except`.
    ///
    /// A connection whose write fails or exceeds `write_timeout` is closed and
    /// listed in the report; the rest still receive the frame.
    pub async fn broadcast(
        &self,
        frame: &[u8],
        except: Option<ConnectionId>,
        write_timeout: Duration,
    ) -> BroadcastReport {
        let targets: Vec<(ConnectionId, Arc<tokio::sync::Mutex<FrameWriter>>)> = lock(&self.inner)
            .connections
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(id, connection)| (*id, Arc::clone(&connection.writer)))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, writer) in targets {
            let result = timeout(write_timeout, async {
                let mut writer = writer.lock().await;
                write_frame(&mut *writer, frame).await
            })
            .await;

            match result {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    debug!("Dropping {:?} after write error: {}", id, e);
                    self.close(id);
                    report.dropped.push(id);
                }
                Err(_) => {
                    debug!("Dropping {:?} after write timeout", id);
                    self.close(id);
                    report.dropped.push(id);
                }
            }
        }
        report
    }
}

// ============================================================================
// EXCHANGE HUB
// ============================================================================

/// Monotonic clock used to stamp peer receipt times.
pub type Clock = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Notifications from the exchange to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    Received { state: VehicleState, new_sos: bool },
    ParticipantsChanged(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Idle,
    Coordinator { local_addr: SocketAddr },
    Participant { coordinator: SocketAddr },
}

/// Which side a read loop serves.
#[derive(Debug, Clone, Copy)]
enum ReadSide {
    /// Coordinator reading from an accepted participant
    Accepted(ConnectionId),

    /// Participant reading relays from the coordinator
    Outbound { generation: u64 },
}

struct Outbound {
    writer: FrameWriter,
    reader: AbortHandle,
    generation: u64,
}

struct HubInner {
    config: ExchangeConfig,
    peers: Arc<Mutex<PeerTable>>,
    sos: Arc<Mutex<SosLedger>>,
    clock: Clock,
    events: mpsc::UnboundedSender<ExchangeEvent>,
    mode: Mutex<LinkMode>,
    connections: ConnectionSet,
    outbound: tokio::sync::Mutex<Option<Outbound>>,
    generation: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
}

/// Socket side of the agent: listener, accepted connections and outbound link.
///
/// Cheap to clone; all clones drive the same sockets.
#[derive(Clone)]
pub struct ExchangeHub {
    inner: Arc<HubInner>,
}

impl ExchangeHub {
    pub fn new(
        config: ExchangeConfig,
        peers: Arc<Mutex<PeerTable>>,
        sos: Arc<Mutex<SosLedger>>,
        clock: Clock,
        events: mpsc::UnboundedSender<ExchangeEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                peers,
                sos,
                clock,
                events,
                mode: Mutex::new(LinkMode::Idle),
                connections: ConnectionSet::new(),
                outbound: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn mode(&self) -> LinkMode {
        *lock(&self.inner.mode)
    }

    pub fn participant_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Becomes the coordinator: binds the listener and starts accepting.
    pub async fn open_listener(&self) -> Result<SocketAddr, ExchangeError> {
        self.close_all().await;

        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        *lock(&self.inner.mode) = LinkMode::Coordinator { local_addr };

        lock(&self.inner.tasks).spawn(self.clone().accept_loop(listener));
        info!("Listening for participants on {}", local_addr);
        Ok(local_addr)
    }

    /// Becomes a participant of the group coordinated at `coordinator`.
    ///
    /// The connection is attempted right away in the background; a failure is
    /// retried by the next send.
    pub async fn open_participant(&self, coordinator: SocketAddr) {
        self.close_all().await;
        *lock(&self.inner.mode) = LinkMode::Participant { coordinator };

        let hub = self.clone();
        lock(&self.inner.tasks).spawn(async move {
            let mut outbound = hub.inner.outbound.lock().await;
            if let Err(e) = hub.ensure_connected(&mut outbound, coordinator).await {
                debug!("Initial connect to {} failed: {}", coordinator, e);
            }
        });
    }

    /// Closes the listener, every accepted connection and the outbound link.
    pub async fn close_all(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.mode), LinkMode::Idle);

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        drop(tasks);

        let had_participants = !self.inner.connections.is_empty();
        self.inner.connections.clear();

        if let Some(outbound) = self.inner.outbound.lock().await.take() {
            outbound.reader.abort();
        }

        if previous != LinkMode::Idle {
            info!("Closed exchange sockets ({:?})", previous);
        }
        if had_participants {
            self.notify_participants();
        }
    }

    /// Sends one state to the group: broadcast as coordinator, to the
    /// coordinator as participant. Returns the number of recipients.
    pub async fn send(&self, state: &VehicleState) -> Result<usize, ExchangeError> {
        let frame = encode_frame(state)?;

        match self.mode() {
            LinkMode::Idle => Err(ExchangeError::NotConnected),
            LinkMode::Coordinator { .. } => {
                let report = self
                    .inner
                    .connections
                    .broadcast(&frame, None, self.inner.config.write_timeout())
                    .await;
                if !report.dropped.is_empty() {
                    self.notify_participants();
                }
                Ok(report.delivered)
            }
            LinkMode::Participant { coordinator } => {
                self.send_outbound(coordinator, &frame).await?;
                Ok(1)
            }
        }
    }

    // ========== Private Helper Methods ==========

    async fn send_outbound(&self, coordinator: SocketAddr, frame: &[u8]) -> Result<(), ExchangeError> {
        let mut outbound = self.inner.outbound.lock().await;
        self.ensure_connected(&mut outbound, coordinator).await?;

        let Some(link) = outbound.as_mut() else {
            return Err(ExchangeError::NotConnected);
        };

        let write_timeout = self.inner.config.write_timeout();
        let error = match timeout(write_timeout, write_frame(&mut link.writer, frame)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ExchangeError::Io(e),
            Err(_) => ExchangeError::Timeout(write_timeout),
        };

        // Only the socket is dropped; the next send reconnects
        warn!("Send to coordinator failed: {}", error);
        if let Some(link) = outbound.take() {
            link.reader.abort();
        }
        Err(error)
    }

    async fn ensure_connected(
        &self,
        outbound: &mut Option<Outbound>,
        coordinator: SocketAddr,
    ) -> Result<(), ExchangeError> {
        if outbound.is_some() {
            return Ok(());
        }
        if self.mode() != (LinkMode::Participant { coordinator }) {
            return Err(ExchangeError::NotConnected);
        }

        let connect_timeout = self.inner.config.connect_timeout();
        let stream = timeout(connect_timeout, TcpStream::connect(coordinator))
            .await
            .map_err(|_| ExchangeError::Timeout(connect_timeout))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let reader = lock(&self.inner.tasks)
            .spawn(self.clone().read_loop(ReadSide::Outbound { generation }, read_half));

        info!("Connected to coordinator at {}", coordinator);
        *outbound = Some(Outbound {
            writer: Box::new(write_half),
            reader,
            generation,
        });
        Ok(())
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut readers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {}: {}", remote, e);
                        }
                        let (read_half, write_half) = stream.into_split();
                        let id = self.inner.connections.insert(Box::new(write_half));
                        let reader = readers.spawn(self.clone().read_loop(ReadSide::Accepted(id), read_half));
                        self.inner.connections.attach_reader(id, reader);

                        info!("Participant connected from {} ({:?})", remote, id);
                        self.notify_participants();
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = readers.join_next() => {}
            }
        }
    }

    async fn read_loop<R>(self, side: ReadSide, mut reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let idle = self.inner.config.read_idle_timeout();
        let max_frame = self.inner.config.max_frame_bytes;

        loop {
            let payload = match timeout(idle, read_frame(&mut reader, max_frame)).await {
                Ok(Ok(Some(payload))) => payload,
                Ok(Ok(None)) => {
                    debug!("{:?} closed by remote", side);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("{:?} read failed: {}", side, e);
                    break;
                }
                Err(_) => {
                    info!("{:?} silent for {:?}, closing", side, idle);
                    break;
                }
            };
            self.receive(&payload, side).await;
        }

        match side {
            ReadSide::Accepted(id) => {
                if self.inner.connections.release(id) {
                    self.notify_participants();
                }
            }
            ReadSide::Outbound { generation } => {
                let mut outbound = self.inner.outbound.lock().await;
                if outbound.as_ref().map(|o| o.generation) == Some(generation) {
                    *outbound = None;
                }
            }
        }
    }

    async fn receive(&self, payload: &[u8], side: ReadSide) {
        let now = (self.inner.clock)();
        let inbound = {
            let mut peers = lock(&self.inner.peers);
            let mut sos = lock(&self.inner.sos);
            accept_payload(payload, &mut peers, &mut sos, now)
        };

        match inbound {
            Inbound::Malformed(e) => warn!("Discarding frame: {}", e),
            Inbound::Ignored(outcome) => debug!("Frame ignored: {:?}", outcome),
            Inbound::Accepted { state, new_sos } => {
                if let ReadSide::Accepted(origin) = side {
                    if self.inner.config.relay {
                        let report = self
                            .inner
                            .connections
                            .broadcast(&frame_payload(payload), Some(origin), self.inner.config.write_timeout())
                            .await;
                        if !report.dropped.is_empty() {
                            self.notify_participants();
                        }
                    }
                }

                if self.inner.events.send(ExchangeEvent::Received { state, new_sos }).is_err() {
                    debug!("Exchange event receiver dropped");
                }
            }
        }
    }

    fn notify_participants(&self) {
        let count = self.inner.connections.len();
        if self.inner.events.send(ExchangeEvent::ParticipantsChanged(count)).is_err() {
            debug!("Exchange event receiver dropped");
        }
    }
}
