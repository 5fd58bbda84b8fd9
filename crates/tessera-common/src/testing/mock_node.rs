use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::auth::AuthConfig;
use crate::protocol::error::{Result, ServerErrorKind, TesseraError};
use crate::protocol::{Frame, Opcode, ServerError};
use crate::transport::FrameTransport;

/// How the mock answers a statement (QUERY, EXECUTE, BATCH, PREPARE).
#[derive(Debug, Clone)]
pub enum Behavior {
    /// RESULT carrying the request body back.
    Echo,
    /// RESULT with a fixed body.
    Respond(Bytes),
    /// RESULT with a fixed body after a delay.
    Delay(Duration, Bytes),
    /// ERROR frame of the given kind.
    Error(ServerErrorKind, String),
    /// Read the request and never answer.
    NeverRespond,
    /// Drop the connection.
    CloseConnection,
    /// RESULT sent twice on the same stream id.
    DuplicateResponse(Bytes),
}

struct Shared {
    default_behavior: Mutex<Behavior>,
    queued: Mutex<VecDeque<Behavior>>,
    auth: AuthConfig,
    answer_heartbeats: AtomicBool,
    requests: AtomicUsize,
    heartbeats: AtomicUsize,
    connections: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn next_behavior(&self) -> Behavior {
        if let Ok(mut queued) = self.queued.lock() {
            if let Some(behavior) = queued.pop_front() {
                return behavior;
            }
        }
        self.default_behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(Behavior::Echo)
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }
}

/// An in-process server node speaking the Tessera wire frame over TCP.
///
/// Answers the handshake (with optional plain-text authentication) and
/// heartbeats itself; statements are answered according to the queued
/// behaviors first, then the default behavior.
///
/// # Example
///
/// ```no_run
/// use tessera_common::testing::{Behavior, MockNode};
///
/// # #[tokio::main]
/// # async fn main() {
/// let node = MockNode::start(Behavior::Echo).await.unwrap();
/// node.enqueue(Behavior::NeverRespond);
/// println!("listening on {}", node.addr());
/// node.stop();
/// # }
/// ```
pub struct MockNode {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockNode {
    pub async fn start(behavior: Behavior) -> Result<Self> {
        Self::start_with_auth(behavior, AuthConfig::disabled()).await
    }

    pub async fn start_with_auth(behavior: Behavior, auth: AuthConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TesseraError::Connection(format!("Failed to bind mock node: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TesseraError::Connection(format!("Failed to get local addr: {}", e)))?;

        let shared = Arc::new(Shared {
            default_behavior: Mutex::new(behavior),
            queued: Mutex::new(VecDeque::new()),
            auth,
            answer_heartbeats: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let node = Self { addr, shared };
        node.spawn_listener(listener);
        Ok(node)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        if let Ok(mut current) = self.shared.default_behavior.lock() {
            *current = behavior;
        }
    }

    /// Queues a behavior used for exactly one upcoming statement.
    pub fn enqueue(&self, behavior: Behavior) {
        if let Ok(mut queued) = self.shared.queued.lock() {
            queued.push_back(behavior);
        }
    }

    pub fn set_answer_heartbeats(&self, answer: bool) {
        self.shared.answer_heartbeats.store(answer, Ordering::SeqCst);
    }

    /// Statements received so far (handshake and heartbeats excluded).
    pub fn request_count(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.shared.heartbeats.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Stops listening and drops every open connection.
    pub fn stop(&self) {
        if let Ok(mut tasks) = self.shared.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Listens again on the same address after [`stop`](Self::stop).
    pub async fn restart(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| TesseraError::Connection(format!("Failed to rebind {}: {}", self.addr, e)))?;
        self.spawn_listener(listener);
        Ok(())
    }

    fn spawn_listener(&self, listener: TcpListener) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _peer)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Mock node accept failed");
                        return;
                    }
                };
                shared.connections.fetch_add(1, Ordering::SeqCst);

                let conn_shared = shared.clone();
                let conn = tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, conn_shared).await {
                        tracing::debug!(error = %e, "Mock node connection ended");
                    }
                });
                shared.track(conn);
            }
        });
        self.shared.track(handle);
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.stop();
    }
}

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

async fn send(writer: &Writer, frame: Frame) -> Result<()> {
    let mut w = writer.lock().await;
    FrameTransport::write_frame(&mut *w, &frame).await
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut authenticated = !shared.auth.requires_auth();

    while let Some(frame) = FrameTransport::read_frame(&mut reader).await? {
        let stream_id = frame.stream;
        match frame.opcode {
            Opcode::Startup => {
                let reply = if shared.auth.requires_auth() {
                    Frame::response(stream_id, Opcode::Authenticate, &b"PasswordAuthenticator"[..])
                } else {
                    Frame::response(stream_id, Opcode::Ready, Bytes::new())
                };
                send(&writer, reply).await?;
            }
            Opcode::AuthResponse => {
                if shared.auth.validate_token(&frame.body) {
                    authenticated = true;
                    send(&writer, Frame::response(stream_id, Opcode::AuthSuccess, Bytes::new())).await?;
                } else {
                    let error = ServerError::new(ServerErrorKind::BadCredentials, "Bad credentials");
                    send(&writer, Frame::response(stream_id, Opcode::Error, error.encode())).await?;
                }
            }
            Opcode::Options => {
                shared.heartbeats.fetch_add(1, Ordering::SeqCst);
                if shared.answer_heartbeats.load(Ordering::SeqCst) {
                    send(&writer, Frame::response(stream_id, Opcode::Supported, Bytes::new())).await?;
                }
            }
            Opcode::Query | Opcode::Execute | Opcode::Batch | Opcode::Prepare => {
                if !authenticated {
                    let error = ServerError::new(ServerErrorKind::Unauthorized, "Not authenticated");
                    send(&writer, Frame::response(stream_id, Opcode::Error, error.encode())).await?;
                    continue;
                }
                shared.requests.fetch_add(1, Ordering::SeqCst);

                match shared.next_behavior() {
                    Behavior::Echo => {
                        send(&writer, Frame::response(stream_id, Opcode::Result, frame.body)).await?;
                    }
                    Behavior::Respond(body) => {
                        send(&writer, Frame::response(stream_id, Opcode::Result, body)).await?;
                    }
                    Behavior::Delay(delay, body) => {
                        let writer = writer.clone();
                        let handle = tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = send(&writer, Frame::response(stream_id, Opcode::Result, body)).await;
                        });
                        shared.track(handle);
                    }
                    Behavior::Error(kind, message) => {
                        let error = ServerError::new(kind, message);
                        send(&writer, Frame::response(stream_id, Opcode::Error, error.encode())).await?;
                    }
                    Behavior::NeverRespond => {}
                    Behavior::CloseConnection => return Ok(()),
                    Behavior::DuplicateResponse(body) => {
                        send(&writer, Frame::response(stream_id, Opcode::Result, body.clone())).await?;
                        send(&writer, Frame::response(stream_id, Opcode::Result, body)).await?;
                    }
                }
            }
            other => {
                let error = ServerError::new(
                    ServerErrorKind::Protocol,
                    format!("Unexpected opcode {:?}", other),
                );
                send(&writer, Frame::response(stream_id, Opcode::Error, error.encode())).await?;
            }
        }
    }

    Ok(())
}
