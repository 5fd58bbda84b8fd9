use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use tessera_common::config::{ContactPoint, DriverConfig};
use tessera_common::protocol::{ExecutionOptions, Request, Result, TesseraError};
use tessera_common::transport::{PassThroughCodec, PayloadCodec};
use tessera_metrics::{MetricsRegistry, MetricsSnapshot};
use tessera_orchestrator::{
    DefaultLoadBalancingPolicy, ExecutionErrorKind, ExecutionOutcome, ExecutionProfile, LoadBalancingPolicy, Node,
    NodeStateEvent, NodeTracker, Orchestrator, ProfileRegistry,
};
use tessera_runtime::{Scheduler, SchedulerConfig, ShutdownGroup, ShutdownReport};

use crate::response::ResponseFuture;

/// Extra time granted on top of the connect timeout for the first
/// connection to every contact point.
const CONNECT_GRACE: Duration = Duration::from_secs(1);

/// Builds a [`Session`] with custom policies.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tessera_client::SessionBuilder;
/// use tessera_common::config::{ContactPoint, DriverConfig};
/// use tessera_orchestrator::{ConstantSpeculativeExecution, ExecutionProfile};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = DriverConfig::new(vec![ContactPoint::new("127.0.0.1:9042".parse()?)]);
/// let session = SessionBuilder::new(config)
///     .profile(
///         ExecutionProfile::default()
///             .with_speculative_policy(Arc::new(ConstantSpeculativeExecution::new(Duration::from_millis(50), 2))),
///     )
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    config: DriverConfig,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    codec: Arc<dyn PayloadCodec>,
    profiles: Vec<ExecutionProfile>,
}

impl SessionBuilder {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            load_balancing: Arc::new(DefaultLoadBalancingPolicy::new()),
            codec: Arc::new(PassThroughCodec),
            profiles: Vec::new(),
        }
    }

    pub fn load_balancing_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.load_balancing = policy;
        self
    }

    pub fn payload_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Adds a profile, replacing any configured profile of the same name.
    pub fn profile(mut self, profile: ExecutionProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Validates the configuration and connects to every contact point.
    ///
    /// Fails when none of them can be reached.
    pub async fn connect(self) -> Result<Session> {
        let config = self.config;
        config.validate()?;

        let scheduler = Scheduler::new(SchedulerConfig {
            worker_pool_size: config.scheduler.worker_pool_size,
        })
        .map_err(|e| TesseraError::Connection(e.to_string()))?;

        let tracker = NodeTracker::new(&config);
        let connect_timeout = Duration::from_millis(config.pool.connect_timeout_ms) + CONNECT_GRACE;
        let up = tracker.connect_all(connect_timeout).await;

        if up == 0 {
            for pool in tracker.pools() {
                pool.force_close();
            }
            tracker.shutdown();
            scheduler.shutdown(Duration::ZERO).await;
            return Err(TesseraError::Connection(format!(
                "none of the {} contact points could be reached",
                config.contact_points.len()
            )));
        }

        let mut profiles = ProfileRegistry::from_config(&config);
        for profile in self.profiles {
            profiles.insert(profile);
        }

        let metrics = Arc::new(MetricsRegistry::new());
        let orchestrator = Orchestrator::new(tracker, self.load_balancing, self.codec, profiles, metrics.clone());

        info!(
            nodes = config.contact_points.len(),
            up,
            local_datacenter = ?config.local_datacenter,
            "Session connected"
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                config,
                orchestrator,
                scheduler,
                metrics,
                closed: AtomicBool::new(false),
                shutdown: OnceCell::new(),
            }),
        })
    }
}

struct SessionInner {
    config: DriverConfig,
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
    metrics: Arc<MetricsRegistry>,
    closed: AtomicBool,
    shutdown: OnceCell<ShutdownReport>,
}

/// Entry point for executing requests against a cluster.
///
/// Cheap to clone; every clone shares the same pools, scheduler and metrics.
/// A session must be shut down with [`close`](Self::close).
///
/// # Example
///
/// ```rust,no_run
/// use tessera_client::Session;
/// use tessera_common::config::{ContactPoint, DriverConfig};
/// use tessera_common::protocol::{ExecutionOptions, Request};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = DriverConfig::new(vec![ContactPoint::new("127.0.0.1:9042".parse()?)]);
/// let session = Session::connect(config).await?;
///
/// let result = session
///     .execute(Request::query("SELECT * FROM users"), ExecutionOptions::new().with_idempotent(true))
///     .await?;
/// println!("{} bytes from {}", result.response.body.len(), result.coordinator);
///
/// let report = session.close().await;
/// println!("shutdown: {}", report);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub async fn connect(config: DriverConfig) -> Result<Self> {
        SessionBuilder::new(config).connect().await
    }

    pub fn builder(config: DriverConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Submits a request and returns its pending outcome.
    ///
    /// The request runs on the session's worker pool whether or not the
    /// returned future is polled; dropping the future cancels it. A request
    /// queued behind a saturated worker pool still fails at its deadline.
    pub fn submit(&self, request: Request, options: ExecutionOptions) -> ResponseFuture {
        let orchestrator = &self.inner.orchestrator;
        let (ctx, rx) = orchestrator.begin(&options);
        let response = ResponseFuture::new(&ctx, rx);

        if self.is_closed() {
            let _ = ctx.fail(ExecutionErrorKind::SessionClosed);
            return response;
        }

        // the deadline and cancellation hold while the run waits for a worker
        let run = orchestrator.clone().run(ctx.clone(), request, options);
        let give_up = orchestrator.clone().give_up(ctx.clone());
        if let Err(e) = self.inner.scheduler.spawn_or_give_up(run, give_up) {
            debug!(error = %e, "Request rejected by the scheduler");
            let _ = ctx.fail(ExecutionErrorKind::SessionClosed);
        }
        response
    }

    /// Submits a request and waits for its outcome.
    pub async fn execute(&self, request: Request, options: ExecutionOptions) -> ExecutionOutcome {
        self.submit(request, options).await
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.tracker().nodes()
    }

    /// Excludes a node from query plans until its pool reconnects or
    /// [`mark_node_up`](Self::mark_node_up) is called.
    pub fn mark_node_down(&self, addr: SocketAddr) -> bool {
        self.tracker().mark_down(addr)
    }

    /// Refused while the node's pool has no usable connection.
    pub fn mark_node_up(&self, addr: SocketAddr) -> bool {
        self.tracker().mark_up(addr)
    }

    pub fn add_node(&self, contact: ContactPoint) -> Arc<Node> {
        self.tracker().add_node(contact)
    }

    /// Removes a node and closes its pool.
    pub async fn remove_node(&self, addr: SocketAddr) -> bool {
        let removed = self.tracker().remove_node(addr).await;
        if removed {
            self.inner.metrics.remove_node(&addr.to_string());
        }
        removed
    }

    /// Node state transitions from now on.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<NodeStateEvent> {
        self.tracker().subscribe()
    }

    /// Runs `callback` on the worker pool for every node state transition,
    /// until the session closes.
    pub fn on_node_event<F>(&self, callback: F)
    where
        F: Fn(NodeStateEvent) + Send + Sync + 'static,
    {
        let mut events = self.tracker().subscribe();
        let scheduler = self.inner.scheduler.clone();
        let callback = Arc::new(callback);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let callback = callback.clone();
                if scheduler.schedule(Duration::ZERO, move || callback(event)).is_err() {
                    return;
                }
            }
        });
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shuts the session down.
    ///
    /// New submissions fail with `SessionClosed` at once. Running requests
    /// get the configured quiet period to finish, then the worker pool is
    /// stopped and every pool closed. Whatever is still open when the
    /// shutdown timeout elapses is force-closed.
    ///
    /// Concurrent and repeated calls wait for the same shutdown and return
    /// the same report.
    pub async fn close(&self) -> ShutdownReport {
        self.inner
            .shutdown
            .get_or_init(|| self.shutdown())
            .await
            .clone()
    }

    async fn shutdown(&self) -> ShutdownReport {
        self.inner.closed.store(true, Ordering::Release);
        let settings = &self.inner.config.scheduler;
        info!(
            quiet_period = ?settings.quiet_period(),
            timeout = ?settings.shutdown_timeout(),
            "Closing session"
        );

        let mut group = ShutdownGroup::new(settings.shutdown_timeout());

        let scheduler = self.inner.scheduler.clone();
        let quiet_period = settings.quiet_period();
        group.add("scheduler", async move {
            let outcome = scheduler.shutdown(quiet_period).await;
            if outcome.is_clean() {
                Ok(())
            } else {
                Err(format!("{} tasks aborted after the quiet period", outcome.aborted_tasks))
            }
        });

        let pools = self.tracker().pools();
        for pool in &pools {
            let pool = pool.clone();
            let scheduler = self.inner.scheduler.clone();
            group.add(format!("pool {}", pool.addr()), async move {
                // requests still running need their channels
                scheduler.terminated().await;
                pool.close().await;
                Ok(())
            });
        }

        let report = group.wait().await;

        if !report.timed_out.is_empty() {
            warn!(timed_out = ?report.timed_out, "Shutdown timeout elapsed, force closing pools");
            for pool in &pools {
                pool.force_close();
            }
        }
        self.tracker().shutdown();

        info!(%report, "Session closed");
        report
    }

    fn tracker(&self) -> &Arc<NodeTracker> {
        self.inner.orchestrator.tracker()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.nodes().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
