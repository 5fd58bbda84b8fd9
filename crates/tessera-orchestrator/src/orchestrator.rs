//! Request execution.
//!
//! The [`Orchestrator`] drives one request from submission to its single
//! terminal outcome. It walks a query plan, acquires a channel from each
//! node's pool, sends the statement and applies the retry policy to every
//! failed attempt. For idempotent statements it may start speculative
//! executions that run concurrently with the first one; the first execution
//! to reach a terminal outcome wins and the others are dropped, which
//! releases their stream ids (late responses are discarded by the channel).
//!
//! The request's absolute deadline and its cancellation signal override
//! everything else: when either fires, every outstanding attempt is dropped
//! and the context fails with `OverallTimeout` or `Cancelled`.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::{debug, info_span, warn, Instrument};

use tessera_common::protocol::{ExecutionOptions, Opcode, Request, Response, ServerError};
use tessera_common::transport::{EncodeContext, PayloadCodec};
use tessera_metrics::MetricsRegistry;
use tessera_pool::{ChannelError, ResponseHandle};

use crate::context::{AttemptOutcome, AttemptRecord, ExecutionContext, ExecutionOutcome, ExecutionPhase};
use crate::error::{AttemptError, ExecutionError, ExecutionErrorKind};
use crate::load_balancer::{LoadBalancingPolicy, PlanHint, QueryPlan};
use crate::node::Node;
use crate::node_tracker::NodeTracker;
use crate::profile::{ExecutionProfile, ProfileRegistry};
use crate::retry::RetryDecision;

fn micros(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}

/// How one execution (the initial one or a speculative one) ended.
enum ExecutionEnd {
    Success { node: SocketAddr, response: Response },
    Ignored { node: SocketAddr },
    Rethrow { node: SocketAddr, error: AttemptError },
    /// The plan ran out of nodes
    Exhausted,
    /// The deadline passed before the next attempt could start
    Expired,
}

enum Terminal {
    Execution(ExecutionEnd),
    DeadlineReached,
    Cancelled,
}

/// State shared by every execution of one request.
struct RunState {
    orchestrator: Arc<Orchestrator>,
    ctx: Arc<ExecutionContext>,
    profile: ExecutionProfile,
    opcode: Opcode,
    body: Bytes,
    returns_rows: bool,
    idempotent: bool,
    plan: Mutex<QueryPlan>,
    node_errors: Mutex<Vec<(SocketAddr, String)>>,
    attempts: AtomicUsize,
    retries: AtomicU32,
}

impl RunState {
    fn next_node(&self) -> Option<Arc<Node>> {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner).next()
    }

    fn plan_exhausted(&self) -> bool {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner).is_exhausted()
    }

    fn node_errors(&self) -> Vec<(SocketAddr, String)> {
        self.node_errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn send_to(&self, node: &Node) -> Result<ResponseHandle, String> {
        let pool = self
            .orchestrator
            .tracker
            .pool(node)
            .ok_or_else(|| format!("node is {}", node.state()))?;
        let channel = pool.acquire().await.map_err(|e| e.to_string())?;
        channel.send(self.opcode, self.body.clone()).map_err(|e| e.to_string())
    }

    /// Sends the request to `preferred` if given, then to the following plan
    /// nodes until one accepts it. Unusable nodes are recorded, not traced.
    async fn send_next(&self, preferred: Option<Arc<Node>>) -> Option<(Arc<Node>, ResponseHandle)> {
        let mut candidate = preferred;
        loop {
            let node = match candidate.take() {
                Some(node) => node,
                None => self.next_node()?,
            };
            match self.send_to(&node).await {
                Ok(handle) => return Some((node, handle)),
                Err(reason) => {
                    debug!(node = %node.addr(), %reason, "Node unusable, moving to the next one");
                    self.node_errors
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((node.addr(), reason));
                }
            }
        }
    }

    async fn await_response(&self, handle: ResponseHandle) -> Result<Response, AttemptError> {
        let frame = handle
            .wait(self.profile.attempt_timeout)
            .await
            .map_err(|e| match e {
                ChannelError::Timeout(after) => AttemptError::Timeout(after),
                other => AttemptError::Transport(other.to_string()),
            })?;

        if frame.opcode == Opcode::Error {
            return Err(match ServerError::decode(&frame.body) {
                Ok(error) => AttemptError::Server(error),
                Err(e) => AttemptError::Transport(e.to_string()),
            });
        }
        self.orchestrator
            .codec
            .decode(frame)
            .map_err(|e| AttemptError::Transport(e.to_string()))
    }

    fn decide(&self, error: &AttemptError, same_node_retries: u32) -> RetryDecision {
        let kind = error.retry_kind();
        if kind.is_fatal() {
            return RetryDecision::Rethrow;
        }

        let retries = self.retries.load(Ordering::Acquire);
        match self.profile.retry_policy.decide(&kind, retries, self.idempotent) {
            RetryDecision::RetrySameNode
                if error.is_transport() || same_node_retries >= self.profile.max_same_node_retries =>
            {
                RetryDecision::RetryNextNode
            }
            RetryDecision::Ignore if self.returns_rows => RetryDecision::Rethrow,
            decision => decision,
        }
    }

    async fn execute(self: Arc<Self>, execution: usize) -> ExecutionEnd {
        let metrics = &self.orchestrator.metrics;
        let mut same_node: Option<Arc<Node>> = None;
        let mut same_node_retries = 0;

        loop {
            if self.ctx.is_expired() {
                return ExecutionEnd::Expired;
            }

            self.ctx.set_phase(ExecutionPhase::AwaitingChannel);
            let retrying_on = same_node.as_ref().map(|n| n.addr());
            let Some((node, handle)) = self.send_next(same_node.take()).await else {
                return ExecutionEnd::Exhausted;
            };
            if retrying_on != Some(node.addr()) {
                same_node_retries = 0;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            let node_key = node.addr().to_string();
            let started_after = self.ctx.elapsed();
            let started = Instant::now();
            metrics.record_attempt(&node_key);
            self.ctx.set_phase(ExecutionPhase::InFlight);
            debug!(node = %node.addr(), attempt, execution, request = handle.request_id(), "Attempt sent");

            let result = self.await_response(handle).await;
            let latency = started.elapsed();
            metrics.record_attempt_outcome(&node_key, micros(latency), result.is_ok());

            let mut record = AttemptRecord {
                execution,
                attempt,
                node: node.addr(),
                started_after,
                latency,
                outcome: AttemptOutcome::Success,
                decision: None,
            };

            let error = match result {
                Ok(response) => {
                    self.ctx.record_attempt(record);
                    debug!(node = %node.addr(), attempt, ?latency, "Attempt succeeded");
                    return ExecutionEnd::Success {
                        node: node.addr(),
                        response,
                    };
                }
                Err(error) => error,
            };

            let decision = self.decide(&error, same_node_retries);
            record.outcome = AttemptOutcome::Failed(error.clone());
            record.decision = Some(decision);
            self.ctx.record_attempt(record);
            match decision {
                RetryDecision::RetrySameNode | RetryDecision::RetryNextNode => {
                    warn!(node = %node.addr(), attempt, %error, %decision, "Attempt failed, retrying")
                }
                _ => debug!(node = %node.addr(), attempt, %error, %decision, "Attempt failed"),
            }

            match decision {
                RetryDecision::Rethrow => {
                    return ExecutionEnd::Rethrow {
                        node: node.addr(),
                        error,
                    }
                }
                RetryDecision::Ignore => return ExecutionEnd::Ignored { node: node.addr() },
                RetryDecision::RetrySameNode => {
                    same_node_retries += 1;
                    same_node = Some(node);
                }
                RetryDecision::RetryNextNode => {}
            }

            self.retries.fetch_add(1, Ordering::AcqRel);
            metrics.record_retry();
            self.ctx.set_phase(ExecutionPhase::Retrying);
        }
    }
}

async fn maybe_sleep(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Executes requests against the cluster.
pub struct Orchestrator {
    tracker: Arc<NodeTracker>,
    policy: Arc<dyn LoadBalancingPolicy>,
    codec: Arc<dyn PayloadCodec>,
    profiles: ProfileRegistry,
    metrics: Arc<MetricsRegistry>,
    next_request: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        tracker: Arc<NodeTracker>,
        policy: Arc<dyn LoadBalancingPolicy>,
        codec: Arc<dyn PayloadCodec>,
        profiles: ProfileRegistry,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            policy,
            codec,
            profiles,
            metrics,
            next_request: AtomicU64::new(1),
        })
    }

    pub fn tracker(&self) -> &Arc<NodeTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    /// Creates the context of a new request. The deadline starts now.
    pub fn begin(&self, options: &ExecutionOptions) -> (Arc<ExecutionContext>, oneshot::Receiver<ExecutionOutcome>) {
        let timeout = options.timeout.unwrap_or_else(|| {
            self.profiles
                .get(options.execution_profile.as_deref())
                .or_else(|| self.profiles.get(None))
                .map(|p| p.request_timeout)
                .unwrap_or_else(|| ExecutionProfile::default().request_timeout)
        });
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        ExecutionContext::new(id, timeout)
    }

    /// Runs a request until its context is resolved.
    pub fn run(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        request: Request,
        options: ExecutionOptions,
    ) -> impl Future<Output = ()> + Send + 'static {
        let span = info_span!("request", id = ctx.id(), opcode = ?request.opcode);
        async move { self.drive(ctx, request, options).await }.instrument(span)
    }

    /// Resolves a request still waiting for a worker once its deadline
    /// passes or it is cancelled. Pair with [`run`](Self::run) when the run
    /// is queued behind a bounded worker pool.
    pub fn give_up(self: Arc<Self>, ctx: Arc<ExecutionContext>) -> impl Future<Output = ()> + Send + 'static {
        async move {
            let kind = tokio::select! {
                biased;
                _ = ctx.cancelled() => ExecutionErrorKind::Cancelled,
                _ = tokio::time::sleep_until(ctx.deadline()) => ExecutionErrorKind::OverallTimeout(ctx.timeout()),
            };
            self.metrics.record_submitted();
            debug!(id = ctx.id(), "Request resolved while waiting for a worker");
            self.fail(&ctx, kind);
        }
    }

    /// Begins and runs a request on the current task.
    pub async fn execute(self: &Arc<Self>, request: Request, options: ExecutionOptions) -> ExecutionOutcome {
        let (ctx, rx) = self.begin(&options);
        self.clone().run(ctx, request, options).await;
        rx.await
            .unwrap_or_else(|_| Err(ExecutionError::untraced(ExecutionErrorKind::SessionClosed)))
    }

    fn prepare(
        self: &Arc<Self>,
        ctx: &Arc<ExecutionContext>,
        request: Request,
        options: &ExecutionOptions,
    ) -> Result<RunState, ExecutionErrorKind> {
        let profile = self
            .profiles
            .get(options.execution_profile.as_deref())
            .cloned()
            .ok_or_else(|| {
                ExecutionErrorKind::InvalidRequest(format!(
                    "unknown execution profile '{}'",
                    options.execution_profile.as_deref().unwrap_or_default()
                ))
            })?;

        let encode = EncodeContext {
            page_size: options.page_size.or(profile.page_size),
        };
        let body = self
            .codec
            .encode(&request, &encode)
            .map_err(|e| ExecutionErrorKind::InvalidRequest(e.to_string()))?;

        let hint = PlanHint {
            routing_key: options.routing_key.as_deref(),
        };
        let plan = self.policy.plan(&hint, &self.tracker.nodes(), &self.tracker.token_map());

        Ok(RunState {
            orchestrator: self.clone(),
            ctx: ctx.clone(),
            idempotent: options.idempotent.unwrap_or(profile.idempotent),
            profile,
            opcode: request.opcode,
            body,
            returns_rows: request.returns_rows,
            plan: Mutex::new(plan),
            node_errors: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            retries: AtomicU32::new(0),
        })
    }

    fn arm_speculative(state: &RunState, running: usize) -> Option<Pin<Box<Sleep>>> {
        if !state.idempotent {
            return None;
        }
        state
            .profile
            .speculative_policy
            .next_delay(running)
            .map(|delay| Box::pin(tokio::time::sleep(delay)))
    }

    async fn drive(self: Arc<Self>, ctx: Arc<ExecutionContext>, request: Request, options: ExecutionOptions) {
        self.metrics.record_submitted();

        let state = match self.prepare(&ctx, request, &options) {
            Ok(state) => Arc::new(state),
            Err(kind) => {
                self.fail(&ctx, kind);
                return;
            }
        };

        let mut executions: FuturesUnordered<BoxFuture<'static, ExecutionEnd>> = FuturesUnordered::new();
        executions.push(state.clone().execute(1).boxed());
        let mut started = 1;
        let mut speculative = Self::arm_speculative(&state, executions.len());

        let deadline = tokio::time::sleep_until(ctx.deadline());
        tokio::pin!(deadline);
        let cancelled = ctx.cancelled();
        tokio::pin!(cancelled);

        let terminal = loop {
            tokio::select! {
                biased;
                _ = &mut cancelled => break Terminal::Cancelled,
                _ = &mut deadline => break Terminal::DeadlineReached,
                Some(end) = executions.next() => match end {
                    ExecutionEnd::Exhausted | ExecutionEnd::Expired if !executions.is_empty() => continue,
                    end => break Terminal::Execution(end),
                },
                _ = maybe_sleep(&mut speculative) => {
                    speculative = None;
                    if state.plan_exhausted() {
                        continue;
                    }
                    started += 1;
                    ctx.record_speculative_execution();
                    self.metrics.record_speculative_execution();
                    ctx.set_phase(ExecutionPhase::Speculating);
                    debug!(execution = started, elapsed = ?ctx.elapsed(), "Starting speculative execution");
                    executions.push(state.clone().execute(started).boxed());
                    speculative = Self::arm_speculative(&state, executions.len());
                }
            }
        };

        // Dropping the remaining executions abandons their in-flight streams.
        drop(executions);

        let latency = micros(ctx.elapsed());
        let resolved = match terminal {
            Terminal::Execution(ExecutionEnd::Success { node, response }) => {
                self.metrics.record_success(latency);
                ctx.succeed(response, node, false)
            }
            Terminal::Execution(ExecutionEnd::Ignored { node }) => {
                self.metrics.record_ignored(latency);
                ctx.succeed(Response::empty(), node, true)
            }
            Terminal::Execution(ExecutionEnd::Rethrow { node, error }) => {
                let kind = match error {
                    AttemptError::Server(error) => ExecutionErrorKind::RethrownServerError { node, error },
                    error => ExecutionErrorKind::AttemptFailed { node, error },
                };
                return self.fail(&ctx, kind);
            }
            Terminal::Execution(ExecutionEnd::Exhausted) => {
                return self.fail(&ctx, ExecutionErrorKind::NoNodeAvailable(state.node_errors()));
            }
            Terminal::Execution(ExecutionEnd::Expired) | Terminal::DeadlineReached => {
                return self.fail(&ctx, ExecutionErrorKind::OverallTimeout(ctx.timeout()));
            }
            Terminal::Cancelled => return self.fail(&ctx, ExecutionErrorKind::Cancelled),
        };

        if resolved.is_err() {
            debug!("Request already resolved, outcome discarded");
        }
    }

    fn fail(&self, ctx: &ExecutionContext, kind: ExecutionErrorKind) {
        let latency = micros(ctx.elapsed());
        match &kind {
            ExecutionErrorKind::Cancelled => self.metrics.record_cancelled(),
            ExecutionErrorKind::OverallTimeout(_) => {
                self.metrics.record_overall_timeout();
                self.metrics.record_failure(kind.name(), latency);
            }
            _ => self.metrics.record_failure(kind.name(), latency),
        }

        match &kind {
            ExecutionErrorKind::Cancelled => debug!(attempts = ctx.attempt_count(), "Request cancelled"),
            _ => warn!(error = %kind, attempts = ctx.attempt_count(), "Request failed"),
        }
        if ctx.fail(kind).is_err() {
            debug!("Request already resolved, outcome discarded");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tracker", &self.tracker)
            .field("profiles", &self.profiles)
            .finish_non_exhaustive()
    }
}
