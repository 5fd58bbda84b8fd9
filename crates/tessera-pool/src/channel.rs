//! Frame Channel: one TCP connection multiplexing many requests by stream id.
//!
//! Each channel is driven by a single actor task that owns the stream-id
//! table, the pending slots and the write half of the socket. Senders talk to
//! it over an unbounded command queue; a separate reader task decodes inbound
//! frames and forwards them. The only state shared with other tasks is a set
//! of atomics the pool reads for selection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tessera_common::auth::Authenticator;
use tessera_common::config::PoolSettings;
use tessera_common::protocol::{
    Frame, Opcode, ProtocolError, ServerError, ServerErrorKind, EVENT_STREAM_ID, MAX_BODY_LEN,
};
use tessera_common::transport::FrameTransport;
use tessera_common::TesseraError;

use crate::stream_ids::StreamIdSet;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

const INBOUND_QUEUE: usize = 1024;

/// Per-channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_streams: usize,
    /// Bound on TCP connect plus handshake
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_orphan_requests: usize,
    pub close_drain_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for ChannelConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_streams: settings.max_streams_per_connection,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
            max_orphan_requests: settings.max_orphan_requests,
            close_drain_timeout: Duration::from_millis(settings.close_drain_timeout_ms),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("All {0} stream ids in use")]
    Busy(usize),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl ChannelError {
    /// Failures of the connection itself rather than of one request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChannelError::ChannelClosed(_)
                | ChannelError::Protocol(_)
                | ChannelError::ConnectFailed(_)
                | ChannelError::AuthenticationFailed(_)
        )
    }
}

impl From<TesseraError> for ChannelError {
    fn from(err: TesseraError) -> Self {
        match err {
            TesseraError::Protocol(e) => ChannelError::Protocol(e),
            TesseraError::Authentication(msg) => ChannelError::AuthenticationFailed(msg),
            other => ChannelError::ConnectFailed(other.to_string()),
        }
    }
}

type Slot = oneshot::Sender<Result<Frame, ChannelError>>;

enum Command {
    Send {
        request_id: u64,
        opcode: Opcode,
        body: Bytes,
        slot: Slot,
    },
    Abandon {
        request_id: u64,
    },
    Close {
        graceful: bool,
    },
}

enum Inbound {
    Frame(Frame),
    Closed(String),
}

struct Shared {
    id: u64,
    addr: SocketAddr,
    max_streams: usize,
    /// Stream ids reserved or held, orphans included
    in_flight: AtomicUsize,
    orphans: AtomicUsize,
    rejected: AtomicU64,
    closing: AtomicBool,
    closed: watch::Sender<Option<String>>,
    next_request: AtomicU64,
}

impl Shared {
    fn try_reserve(&self) -> bool {
        let max = self.max_streams;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }
}

/// A multiplexed connection to one node.
///
/// Cloning is cheap; every clone talks to the same actor.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel {
    /// Connects and performs the handshake, authenticating if the server asks.
    ///
    /// The whole sequence is bounded by `config.connect_timeout`. A channel
    /// is only returned once the server has answered READY or AUTH_SUCCESS.
    pub async fn connect(
        addr: SocketAddr,
        config: ChannelConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Channel, ChannelError> {
        let setup = async {
            let mut stream = FrameTransport::connect(addr, config.connect_timeout).await?;
            handshake(&mut stream, authenticator.as_deref()).await?;
            Ok::<_, ChannelError>(stream)
        };

        let stream = tokio::time::timeout(config.connect_timeout, setup)
            .await
            .map_err(|_| {
                ChannelError::ConnectFailed(format!(
                    "Connecting to {} timed out after {:?}",
                    addr, config.connect_timeout
                ))
            })??;

        Ok(Self::spawn(addr, stream, config))
    }

    fn spawn(addr: SocketAddr, stream: TcpStream, config: ChannelConfig) -> Channel {
        let (reader, writer) = stream.into_split();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (closed, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            max_streams: config.max_streams.clamp(1, i16::MAX as usize + 1),
            in_flight: AtomicUsize::new(0),
            orphans: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            closed,
            next_request: AtomicU64::new(0),
        });

        let reader_task = tokio::spawn(read_loop(reader, inbound_tx));
        let actor = ChannelActor {
            shared: shared.clone(),
            ids: StreamIdSet::new(shared.max_streams),
            config,
            writer,
            pending: HashMap::new(),
            requests: HashMap::new(),
            orphans: HashSet::new(),
            heartbeat: None,
            last_read: Instant::now(),
            drain_deadline: None,
        };
        tokio::spawn(actor.run(command_rx, inbound_rx, reader_task));

        debug!(node = %addr, channel = shared.id, "Channel established");
        Channel {
            shared,
            commands: command_tx,
        }
    }

    /// Sends a request frame.
    ///
    /// Fails immediately with [`ChannelError::Busy`] when every stream id is
    /// taken, and with [`ChannelError::ChannelClosed`] once the channel is
    /// closing or closed.
    pub fn send(&self, opcode: Opcode, body: Bytes) -> Result<ResponseHandle, ChannelError> {
        if let Some(reason) = self.shared.close_reason() {
            return Err(ChannelError::ChannelClosed(reason));
        }
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(ChannelError::ChannelClosed("channel is closing".to_string()));
        }
        if !self.shared.try_reserve() {
            return Err(ChannelError::Busy(self.shared.max_streams));
        }

        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        let command = Command::Send {
            request_id,
            opcode,
            body,
            slot,
        };
        if self.commands.send(command).is_err() {
            self.shared.release();
            return Err(ChannelError::ChannelClosed(
                self.shared
                    .close_reason()
                    .unwrap_or_else(|| "channel task ended".to_string()),
            ));
        }

        Ok(ResponseHandle {
            request_id,
            rx,
            commands: self.commands.clone(),
            settled: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn max_streams(&self) -> usize {
        self.shared.max_streams
    }

    /// Stream ids held, orphans included.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Free stream ids; zero once the channel stops accepting requests.
    pub fn available(&self) -> usize {
        if !self.is_usable() {
            return 0;
        }
        self.shared.max_streams.saturating_sub(self.in_flight())
    }

    pub fn orphan_count(&self) -> usize {
        self.shared.orphans.load(Ordering::Acquire)
    }

    /// Responses dropped because their stream id was not in use.
    pub fn rejected_frames(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    pub fn is_usable(&self) -> bool {
        !self.is_closed() && !self.shared.closing.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason()
    }

    /// Refuses new requests and closes once in-flight requests have drained
    /// or the drain timeout elapsed. Idempotent.
    pub fn close(&self) {
        if !self.shared.closing.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Close { graceful: true });
        }
    }

    /// Closes at once, failing every pending request. Idempotent.
    pub fn force_close(&self) {
        self.shared.closing.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Close { graceful: false });
    }

    /// Resolves once the channel is closed.
    ///
    /// The future does not keep the channel alive.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.closed.subscribe();
        async move {
            let _ = rx.wait_for(Option::is_some).await;
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("addr", &self.shared.addr)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The pending response of one request.
///
/// Dropping the handle before the response arrived cancels the request: its
/// stream id stays reserved until the late response is discarded.
pub struct ResponseHandle {
    request_id: u64,
    rx: oneshot::Receiver<Result<Frame, ChannelError>>,
    commands: mpsc::UnboundedSender<Command>,
    settled: bool,
}

impl ResponseHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Waits for the response. On timeout the slot is released and the
    /// stream id orphaned.
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame, ChannelError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => {
                self.settled = true;
                result
            }
            Ok(Err(_)) => {
                self.settled = true;
                Err(ChannelError::ChannelClosed("channel task ended".to_string()))
            }
            Err(_) => {
                self.abandon();
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    pub fn cancel(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if !self.settled {
            self.settled = true;
            let _ = self.commands.send(Command::Abandon {
                request_id: self.request_id,
            });
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// STARTUP, then READY or the authentication exchange, on stream 0.
async fn handshake<S>(stream: &mut S, authenticator: Option<&dyn Authenticator>) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    FrameTransport::write_frame(stream, &Frame::request(0, Opcode::Startup, Bytes::new())).await?;

    loop {
        let frame = FrameTransport::read_frame(stream)
            .await?
            .ok_or_else(|| ChannelError::ConnectFailed("Connection closed during handshake".to_string()))?;

        match frame.opcode {
            Opcode::Ready => return Ok(()),
            Opcode::Authenticate => {
                let auth = authenticator.ok_or_else(|| {
                    ChannelError::AuthenticationFailed(
                        "Server requires authentication but no credentials are configured".to_string(),
                    )
                })?;
                let class = String::from_utf8_lossy(&frame.body);
                let token = auth.initial_response(&class)?;
                FrameTransport::write_frame(stream, &Frame::request(0, Opcode::AuthResponse, token)).await?;
            }
            Opcode::AuthChallenge => {
                let auth = authenticator.ok_or_else(|| {
                    ChannelError::Protocol(ProtocolError::UnexpectedOpcode(Opcode::AuthChallenge, "READY"))
                })?;
                let token = auth.evaluate_challenge(&frame.body)?;
                FrameTransport::write_frame(stream, &Frame::request(0, Opcode::AuthResponse, token)).await?;
            }
            Opcode::AuthSuccess => {
                if let Some(auth) = authenticator {
                    auth.on_success(&frame.body);
                }
                return Ok(());
            }
            Opcode::Error => {
                let error = ServerError::decode(&frame.body)?;
                return Err(match error.kind {
                    ServerErrorKind::BadCredentials => ChannelError::AuthenticationFailed(error.message),
                    _ => ChannelError::ConnectFailed(error.to_string()),
                });
            }
            other => {
                return Err(ChannelError::Protocol(ProtocolError::UnexpectedOpcode(
                    other,
                    "READY or AUTHENTICATE",
                )))
            }
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::Sender<Inbound>) {
    loop {
        let message = match FrameTransport::read_frame(&mut reader).await {
            Ok(Some(frame)) => Inbound::Frame(frame),
            Ok(None) => Inbound::Closed("connection closed by peer".to_string()),
            Err(e) => Inbound::Closed(format!("read failed: {}", e)),
        };
        let last = matches!(message, Inbound::Closed(_));
        if inbound.send(message).await.is_err() || last {
            return;
        }
    }
}

struct ChannelActor {
    shared: Arc<Shared>,
    config: ChannelConfig,
    writer: OwnedWriteHalf,
    ids: StreamIdSet,
    /// stream id -> (request id, slot)
    pending: HashMap<i16, (u64, Slot)>,
    /// request id -> stream id
    requests: HashMap<u64, i16>,
    orphans: HashSet<i16>,
    /// Outstanding heartbeat: stream id and reply deadline
    heartbeat: Option<(i16, Instant)>,
    last_read: Instant,
    drain_deadline: Option<Instant>,
}

impl ChannelActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::Receiver<Inbound>,
        reader: JoinHandle<()>,
    ) {
        let reason = loop {
            let wake = self.next_wake();
            let outcome = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => Some("all channel handles dropped".to_string()),
                },
                message = inbound.recv() => match message {
                    Some(Inbound::Frame(frame)) => self.on_frame(frame),
                    Some(Inbound::Closed(reason)) => Some(reason),
                    None => Some("reader task ended".to_string()),
                },
                _ = tokio::time::sleep_until(wake) => self.on_tick().await,
            };

            if let Some(reason) = outcome {
                break reason;
            }
            if self.drain_deadline.is_some() && self.pending.is_empty() {
                break "closed by client".to_string();
            }
        };

        reader.abort();
        self.shutdown(reason, &mut commands).await;
    }

    fn next_wake(&self) -> Instant {
        let wake = match self.heartbeat {
            Some((_, deadline)) => deadline,
            None => self.last_read + self.config.heartbeat_interval,
        };
        match self.drain_deadline {
            Some(deadline) => wake.min(deadline),
            None => wake,
        }
    }

    fn free_stream(&mut self, stream: i16) {
        if self.ids.release(stream) {
            self.shared.release();
        }
    }

    fn sync_orphan_count(&self) {
        self.shared.orphans.store(self.orphans.len(), Ordering::Release);
    }

    async fn on_command(&mut self, command: Command) -> Option<String> {
        match command {
            Command::Send {
                request_id,
                opcode,
                body,
                slot,
            } => {
                if self.drain_deadline.is_some() {
                    self.shared.release();
                    let _ = slot.send(Err(ChannelError::ChannelClosed("channel is closing".to_string())));
                    return None;
                }
                if body.len() > MAX_BODY_LEN {
                    self.shared.release();
                    let _ = slot.send(Err(ProtocolError::FrameTooLarge(body.len(), MAX_BODY_LEN).into()));
                    return None;
                }
                let Some(stream) = self.ids.acquire() else {
                    // the reservation counter never lets this happen
                    self.shared.release();
                    let _ = slot.send(Err(ChannelError::Busy(self.shared.max_streams)));
                    return None;
                };

                self.pending.insert(stream, (request_id, slot));
                self.requests.insert(request_id, stream);

                let frame = Frame::request(stream, opcode, body);
                if let Err(e) = FrameTransport::write_frame(&mut self.writer, &frame).await {
                    return Some(format!("write failed: {}", e));
                }
                None
            }
            Command::Abandon { request_id } => {
                let stream = self.requests.remove(&request_id)?;
                self.pending.remove(&stream);
                self.orphans.insert(stream);
                self.sync_orphan_count();
                debug!(node = %self.shared.addr, stream, "Request abandoned, stream id orphaned");

                let limit = self.orphan_limit();
                if self.orphans.len() > limit {
                    warn!(
                        node = %self.shared.addr,
                        orphans = self.orphans.len(),
                        limit,
                        "Too many orphaned stream ids, closing channel"
                    );
                    return Some(format!(
                        "{} orphaned stream ids exceed the limit of {}",
                        self.orphans.len(),
                        limit
                    ));
                }
                None
            }
            Command::Close { graceful: true } => {
                if self.drain_deadline.is_none() {
                    self.drain_deadline = Some(Instant::now() + self.config.close_drain_timeout);
                }
                None
            }
            Command::Close { graceful: false } => Some("force closed by client".to_string()),
        }
    }

    /// Orphans tolerated before the channel is closed; always fewer than
    /// its stream ids.
    fn orphan_limit(&self) -> usize {
        self.config
            .max_orphan_requests
            .min(self.shared.max_streams.saturating_sub(1))
    }

    fn on_frame(&mut self, frame: Frame) -> Option<String> {
        self.last_read = Instant::now();

        if !frame.is_response() {
            return Some(format!("peer sent a request frame ({:?})", frame.opcode));
        }
        if frame.stream == EVENT_STREAM_ID {
            debug!(node = %self.shared.addr, opcode = ?frame.opcode, "Ignoring server event");
            return None;
        }
        if let Some((stream, _)) = self.heartbeat {
            if stream == frame.stream {
                self.heartbeat = None;
                self.free_stream(stream);
                return None;
            }
        }

        if let Some((request_id, slot)) = self.pending.remove(&frame.stream) {
            self.requests.remove(&request_id);
            self.free_stream(frame.stream);
            let _ = slot.send(Ok(frame));
        } else if self.orphans.remove(&frame.stream) {
            self.sync_orphan_count();
            self.free_stream(frame.stream);
            debug!(node = %self.shared.addr, stream = frame.stream, "Discarded late response");
        } else {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                node = %self.shared.addr,
                stream = frame.stream,
                opcode = ?frame.opcode,
                "Rejected response on unknown stream id"
            );
        }
        None
    }

    async fn on_tick(&mut self) -> Option<String> {
        let now = Instant::now();

        if let Some((_, deadline)) = self.heartbeat {
            if now >= deadline {
                warn!(node = %self.shared.addr, "Heartbeat not answered, closing channel");
                return Some(format!(
                    "heartbeat not answered within {:?}",
                    self.config.heartbeat_timeout
                ));
            }
            return None;
        }
        if let Some(deadline) = self.drain_deadline {
            if now >= deadline {
                return Some(format!(
                    "{} requests still pending after drain timeout",
                    self.pending.len()
                ));
            }
        }
        if now < self.last_read + self.config.heartbeat_interval || self.drain_deadline.is_some() {
            return None;
        }

        let stream = if self.shared.try_reserve() {
            self.ids.acquire()
        } else {
            None
        };
        let Some(stream) = stream else {
            // saturated; try again after another interval
            self.last_read = now;
            return None;
        };

        let frame = Frame::request(stream, Opcode::Options, Bytes::new());
        if let Err(e) = FrameTransport::write_frame(&mut self.writer, &frame).await {
            return Some(format!("heartbeat write failed: {}", e));
        }
        self.heartbeat = Some((stream, now + self.config.heartbeat_timeout));
        None
    }

    async fn shutdown(mut self, reason: String, commands: &mut mpsc::UnboundedReceiver<Command>) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });

        for (stream, (_, slot)) in std::mem::take(&mut self.pending) {
            self.free_stream(stream);
            let _ = slot.send(Err(ChannelError::ChannelClosed(reason.clone())));
        }
        self.requests.clear();
        for stream in std::mem::take(&mut self.orphans) {
            self.free_stream(stream);
        }
        self.sync_orphan_count();
        if let Some((stream, _)) = self.heartbeat.take() {
            self.free_stream(stream);
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Send { slot, .. } = command {
                self.shared.release();
                let _ = slot.send(Err(ChannelError::ChannelClosed(reason.clone())));
            }
        }

        let _ = self.writer.shutdown().await;
        info!(node = %self.shared.addr, channel = self.shared.id, reason = %reason, "Channel closed");
    }
}
