use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_common::auth::Authenticator;
use tessera_common::config::PoolSettings;

use crate::channel::{Channel, ChannelConfig};
use crate::reconnect::ReconnectionSchedule;

/// Connection pool configuration.
///
/// # Fields
///
/// - `size`: number of channels the pool keeps open to its node
/// - `channel`: settings handed to every channel the pool opens
/// - `reconnect_base_delay` / `reconnect_max_delay`: bounds of the
///   exponential reconnection backoff
///
/// # Example
///
/// ```rust
/// use tessera_common::config::PoolSettings;
/// use tessera_pool::PoolConfig;
///
/// let settings = PoolSettings { local_size: 4, ..Default::default() };
/// assert_eq!(PoolConfig::from_settings(&settings, true).size, 4);
/// assert_eq!(PoolConfig::from_settings(&settings, false).size, 1);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub channel: ChannelConfig,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl PoolConfig {
    /// Builds the configuration for a local or a remote node.
    pub fn from_settings(settings: &PoolSettings, local: bool) -> Self {
        Self {
            size: if local { settings.local_size } else { settings.remote_size }.max(1),
            channel: ChannelConfig::from(settings),
            reconnect_base_delay: Duration::from_millis(settings.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default(), true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// First connection attempt still running
    Initializing,
    /// At least one usable channel
    Ready,
    /// No usable channel; reconnection is in progress
    Unavailable,
    Closed,
}

/// Health transitions, emitted only when the usable-channel count crosses zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("No usable connection to {addr}: {reason}")]
    Unavailable { addr: SocketAddr, reason: String },

    #[error("All connections to {0} are saturated")]
    Busy(SocketAddr),

    #[error("Pool for {0} is closed")]
    Closed(SocketAddr),
}

struct PoolInner {
    addr: SocketAddr,
    config: PoolConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    channels: RwLock<Vec<Channel>>,
    state: watch::Sender<PoolState>,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
    last_error: Mutex<Option<String>>,
    closed: AtomicBool,
    /// Channels taken out of service by a close, kept so a later forced
    /// close still reaches channels that are draining
    closing: Mutex<Vec<Channel>>,
    /// Wakes the manager when a channel is lost
    wake: Notify,
    /// Interrupts the manager's backoff sleep on close
    shutdown: Notify,
    manager: Mutex<Option<JoinHandle<()>>>,
}

/// Pool of multiplexed channels to one node.
///
/// A background manager task keeps the pool at its target size, reconnecting
/// with exponential backoff plus jitter after failures. Selection hands out
/// the channel with the most free stream ids.
///
/// The pool must be shut down with [`close`](Self::close) or
/// [`force_close`](Self::force_close); dropping the handle leaves the manager
/// running.
///
/// # Example
///
/// ```rust,no_run
/// use tessera_pool::{ConnectionPool, PoolConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new("127.0.0.1:9042".parse()?, PoolConfig::default(), None, None);
///
/// let channel = pool.acquire().await?;
/// println!("using channel {} ({} free streams)", channel.id(), channel.available());
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool and starts connecting in the background.
    ///
    /// Must be called from within a tokio runtime. Health transitions are
    /// sent to `events` when given.
    pub fn new(
        addr: SocketAddr,
        config: PoolConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
        events: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        let (state, _) = watch::channel(PoolState::Initializing);
        let inner = Arc::new(PoolInner {
            addr,
            config,
            authenticator,
            channels: RwLock::new(Vec::new()),
            state,
            events,
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
            closing: Mutex::new(Vec::new()),
            wake: Notify::new(),
            shutdown: Notify::new(),
            manager: Mutex::new(None),
        });

        let manager = tokio::spawn(manage(inner.clone()));
        *inner.manager.lock().unwrap_or_else(PoisonError::into_inner) = Some(manager);

        debug!(node = %addr, size = inner.config.size, "Connection pool created");
        Self { inner }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Returns the least-busy usable channel.
    ///
    /// Waits while the first connection is still being established; after
    /// that it never waits.
    pub async fn acquire(&self) -> Result<Channel, PoolError> {
        let mut state = self.inner.state.subscribe();
        let current = *state
            .wait_for(|s| *s != PoolState::Initializing)
            .await
            .map_err(|_| PoolError::Closed(self.inner.addr))?;

        if current == PoolState::Closed {
            return Err(PoolError::Closed(self.inner.addr));
        }
        self.try_acquire()
    }

    /// Non-waiting variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> Result<Channel, PoolError> {
        if self.inner.is_closed() {
            return Err(PoolError::Closed(self.inner.addr));
        }

        let channels = self.inner.channels.read().unwrap_or_else(PoisonError::into_inner);
        let best = channels
            .iter()
            .filter(|c| c.is_usable())
            .max_by_key(|c| c.available());

        match best {
            None => Err(PoolError::Unavailable {
                addr: self.inner.addr,
                reason: self
                    .inner
                    .last_error()
                    .unwrap_or_else(|| "no live connections".to_string()),
            }),
            Some(channel) if channel.available() == 0 => Err(PoolError::Busy(self.inner.addr)),
            Some(channel) => Ok(channel.clone()),
        }
    }

    pub fn state(&self) -> PoolState {
        *self.inner.state.borrow()
    }

    /// Resolves once the pool leaves `Initializing`.
    pub async fn ready(&self) -> PoolState {
        let mut state = self.inner.state.subscribe();
        let result = state.wait_for(|s| *s != PoolState::Initializing).await;
        result.map(|s| *s).unwrap_or(PoolState::Closed)
    }

    /// Usable channels.
    pub fn size(&self) -> usize {
        self.inner.usable(&self.inner.channels.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Stream ids held across all channels.
    pub fn in_flight(&self) -> usize {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Channel::in_flight)
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stops reconnection and closes every channel gracefully.
    ///
    /// Completes once all channels have closed. Idempotent.
    pub async fn close(&self) {
        let channels = self.inner.begin_close();
        for channel in &channels {
            channel.close();
        }
        join_all(channels.iter().map(Channel::closed)).await;
        debug!(node = %self.inner.addr, channels = channels.len(), "Connection pool closed");
    }

    /// Stops reconnection and force-closes every channel, including those
    /// a graceful [`close`](Self::close) is still draining.
    pub fn force_close(&self) {
        self.inner.begin_close();
        let closing = self.inner.closing.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for channel in closing {
            channel.force_close();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn usable(&self, channels: &[Channel]) -> usize {
        channels.iter().filter(|c| c.is_usable()).count()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Marks the pool closed and takes its channels.
    fn begin_close(&self) -> Vec<Channel> {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        let channels = std::mem::take(&mut *self.channels.write().unwrap_or_else(PoisonError::into_inner));
        self.closing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(channels.iter().cloned());
        self.state.send_replace(PoolState::Closed);

        if first {
            self.shutdown.notify_one();
            self.wake.notify_one();
            if let Some(manager) = self.manager.lock().unwrap_or_else(PoisonError::into_inner).take() {
                manager.abort();
            }
            info!(node = %self.addr, "Closing connection pool");
        }
        channels
    }

    /// Applies a health transition, emitting Up/Down when it crosses zero.
    ///
    /// Callers hold the channel list lock so transitions follow list changes
    /// in order.
    fn transition(&self, next: PoolState) {
        let addr = self.addr;
        let events = &self.events;
        self.state.send_if_modified(|state| {
            if *state == next || *state == PoolState::Closed {
                return false;
            }
            let event = match next {
                PoolState::Ready => {
                    info!(node = %addr, "Connection pool is up");
                    Some(PoolEvent::Up(addr))
                }
                PoolState::Unavailable => {
                    warn!(node = %addr, "Connection pool has no usable channels");
                    Some(PoolEvent::Down(addr))
                }
                _ => None,
            };
            if let (Some(event), Some(events)) = (event, events) {
                let _ = events.send(event);
            }
            *state = next;
            true
        });
    }

    fn add_channel(self: &Arc<Self>, channel: Channel) {
        {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                channel.force_close();
                return;
            }
            channels.push(channel.clone());
            debug!(node = %self.addr, channel = channel.id(), size = channels.len(), "Channel added to pool");
            self.transition(PoolState::Ready);
        }

        let pool: Weak<PoolInner> = Arc::downgrade(self);
        let id = channel.id();
        let closed = channel.closed();
        tokio::spawn(async move {
            closed.await;
            if let Some(pool) = pool.upgrade() {
                pool.on_channel_closed(id);
            }
        });
    }

    fn on_channel_closed(&self, id: u64) {
        if self.is_closed() {
            return;
        }
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|c| c.id() != id);
        let usable = self.usable(&channels);
        debug!(node = %self.addr, channel = id, usable, "Channel removed from pool");

        if usable == 0 {
            self.transition(PoolState::Unavailable);
        }
        self.wake.notify_one();
    }

    fn on_connect_failed(&self, error: String) {
        let channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        if self.usable(&channels) == 0 {
            self.transition(PoolState::Unavailable);
        }
    }
}

/// Keeps the pool at its target size until it is closed.
async fn manage(inner: Arc<PoolInner>) {
    let mut schedule = ReconnectionSchedule::new(inner.config.reconnect_base_delay, inner.config.reconnect_max_delay);

    loop {
        if inner.is_closed() {
            return;
        }

        let live = inner.channels.read().unwrap_or_else(PoisonError::into_inner).len();
        if live >= inner.config.size {
            inner.wake.notified().await;
            continue;
        }

        match Channel::connect(inner.addr, inner.config.channel.clone(), inner.authenticator.clone()).await {
            Ok(channel) => {
                schedule.reset();
                inner.add_channel(channel);
            }
            Err(e) => {
                let delay = schedule.next_delay();
                warn!(
                    node = %inner.addr,
                    error = %e,
                    attempt = schedule.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Connection attempt failed"
                );
                inner.on_connect_failed(e.to_string());

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.shutdown.notified() => return,
                }
            }
        }
    }
}
