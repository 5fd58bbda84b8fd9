use std::time::Duration;

/// Decides when additional concurrent executions of a request start.
///
/// Only consulted for idempotent requests.
pub trait SpeculativeExecutionPolicy: Send + Sync + 'static {
    /// Delay before the next execution, given how many are already running,
    /// or `None` to stop speculating.
    fn next_delay(&self, running_executions: usize) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoSpeculativeExecution;

impl SpeculativeExecutionPolicy for NoSpeculativeExecution {
    fn next_delay(&self, _running_executions: usize) -> Option<Duration> {
        None
    }
}

/// Starts a new execution every `delay` until `max_executions` are running.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSpeculativeExecution {
    pub delay: Duration,
    /// Cap on concurrent executions, the first one included
    pub max_executions: usize,
}

impl ConstantSpeculativeExecution {
    pub fn new(delay: Duration, max_executions: usize) -> Self {
        Self { delay, max_executions }
    }
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecution {
    fn next_delay(&self, running_executions: usize) -> Option<Duration> {
        (running_executions < self.max_executions).then_some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_policy_caps_executions() {
        let policy = ConstantSpeculativeExecution::new(Duration::from_millis(50), 3);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(50)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(50)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn test_cap_of_one_disables_speculation() {
        let policy = ConstantSpeculativeExecution::new(Duration::from_millis(50), 1);
        assert_eq!(policy.next_delay(1), None);
        assert_eq!(NoSpeculativeExecution.next_delay(1), None);
    }
}
