use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use tokio::time::Instant;

/// Outcome of a [`ShutdownGroup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Members that finished cleanly
    pub completed: Vec<String>,
    /// Members that finished with an error, with its message
    pub failed: Vec<(String, String)>,
    /// Members still running when the group timeout elapsed
    pub timed_out: Vec<String>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} timed out in {:?}",
            self.completed.len(),
            self.failed.len(),
            self.timed_out.len(),
            self.elapsed
        )
    }
}

enum MemberOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Barrier over several asynchronous shutdowns.
///
/// Every member runs concurrently; the group completes when all of them have
/// finished or the shared timeout elapsed, whichever comes first. Members
/// still running at the timeout are dropped and reported as timed out.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tessera_runtime::ShutdownGroup;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut group = ShutdownGroup::new(Duration::from_secs(1));
/// group.add("pool", async { Ok(()) });
/// group.add("timer", async { Err("timer thread panicked".to_string()) });
///
/// let report = group.wait().await;
/// assert_eq!(report.completed, vec!["pool".to_string()]);
/// assert_eq!(report.failed.len(), 1);
/// # }
/// ```
pub struct ShutdownGroup {
    timeout: Duration,
    members: Vec<(String, BoxFuture<'static, Result<(), String>>)>,
}

impl ShutdownGroup {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            members: Vec::new(),
        }
    }

    pub fn add<F>(&mut self, name: impl Into<String>, shutdown: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.members.push((name.into(), shutdown.boxed()));
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub async fn wait(self) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + self.timeout;

        let outcomes = join_all(self.members.into_iter().map(|(name, fut)| async move {
            let outcome = match tokio::time::timeout_at(deadline, fut).await {
                Ok(Ok(())) => MemberOutcome::Completed,
                Ok(Err(e)) => MemberOutcome::Failed(e),
                Err(_) => MemberOutcome::TimedOut,
            };
            (name, outcome)
        }))
        .await;

        let mut report = ShutdownReport {
            elapsed: started.elapsed(),
            ..Default::default()
        };
        for (name, outcome) in outcomes {
            match outcome {
                MemberOutcome::Completed => report.completed.push(name),
                MemberOutcome::Failed(e) => {
                    tracing::warn!(member = %name, error = %e, "Shutdown failed");
                    report.failed.push((name, e));
                }
                MemberOutcome::TimedOut => {
                    tracing::warn!(member = %name, "Shutdown timed out");
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}
