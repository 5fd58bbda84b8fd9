use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tessera_common::config::{DriverConfig, ProfileSettings, DEFAULT_PROFILE};

use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::speculative::{ConstantSpeculativeExecution, NoSpeculativeExecution, SpeculativeExecutionPolicy};

/// Timeouts and policies applied to a request.
#[derive(Clone)]
pub struct ExecutionProfile {
    pub name: String,
    /// Overall deadline across every attempt
    pub request_timeout: Duration,
    pub attempt_timeout: Duration,
    pub page_size: Option<u32>,
    pub idempotent: bool,
    pub max_same_node_retries: u32,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub speculative_policy: Arc<dyn SpeculativeExecutionPolicy>,
}

impl ExecutionProfile {
    pub fn from_settings(name: impl Into<String>, settings: &ProfileSettings) -> Self {
        let speculative_policy: Arc<dyn SpeculativeExecutionPolicy> = match settings.speculative_delay() {
            Some(delay) if settings.speculative_max_executions > 1 => Arc::new(ConstantSpeculativeExecution::new(
                delay,
                settings.speculative_max_executions,
            )),
            _ => Arc::new(NoSpeculativeExecution),
        };

        Self {
            name: name.into(),
            request_timeout: settings.request_timeout(),
            attempt_timeout: settings.attempt_timeout(),
            page_size: settings.page_size,
            idempotent: settings.idempotent,
            max_same_node_retries: settings.max_same_node_retries,
            retry_policy: Arc::new(DefaultRetryPolicy {
                max_retries: settings.retry_max_retries,
                ignore_write_timeout_for_non_idempotent: settings.ignore_write_timeout_for_non_idempotent,
            }),
            speculative_policy,
        }
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_speculative_policy(mut self, policy: Arc<dyn SpeculativeExecutionPolicy>) -> Self {
        self.speculative_policy = policy;
        self
    }
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self::from_settings(DEFAULT_PROFILE, &ProfileSettings::default())
    }
}

impl fmt::Debug for ExecutionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionProfile")
            .field("name", &self.name)
            .field("request_timeout", &self.request_timeout)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("idempotent", &self.idempotent)
            .field("max_same_node_retries", &self.max_same_node_retries)
            .finish_non_exhaustive()
    }
}

/// Named execution profiles. The default profile always exists.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ExecutionProfile>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), ExecutionProfile::default());
        Self { profiles }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        let mut registry = Self::new();
        for (name, settings) in &config.profiles {
            registry.insert(ExecutionProfile::from_settings(name.clone(), settings));
        }
        registry
    }

    /// Adds or replaces a profile.
    pub fn insert(&mut self, profile: ExecutionProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// Looks up a profile; `None` selects the default one.
    pub fn get(&self, name: Option<&str>) -> Option<&ExecutionProfile> {
        self.profiles.get(name.unwrap_or(DEFAULT_PROFILE))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{FallthroughRetryPolicy, RetryDecision, RetryErrorKind};

    #[test]
    fn test_default_profile_always_exists() {
        let registry = ProfileRegistry::new();
        let profile = registry.get(None).unwrap();
        assert_eq!(profile.name, DEFAULT_PROFILE);
        assert_eq!(profile.request_timeout, Duration::from_millis(12000));
        assert_eq!(profile.attempt_timeout, profile.request_timeout);
        assert!(registry.get(Some("missing")).is_none());
    }

    #[test]
    fn test_profiles_from_config() {
        let mut config = DriverConfig::default();
        config.profiles.insert(
            "analytics".to_string(),
            ProfileSettings {
                request_timeout_ms: 60_000,
                attempt_timeout_ms: Some(20_000),
                idempotent: true,
                speculative_delay_ms: Some(100),
                speculative_max_executions: 2,
                ..Default::default()
            },
        );

        let registry = ProfileRegistry::from_config(&config);
        let profile = registry.get(Some("analytics")).unwrap();
        assert_eq!(profile.request_timeout, Duration::from_secs(60));
        assert_eq!(profile.attempt_timeout, Duration::from_secs(20));
        assert!(profile.idempotent);
        assert_eq!(profile.speculative_policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(profile.speculative_policy.next_delay(2), None);
        assert_eq!(registry.names().count(), 2);
    }

    #[test]
    fn test_policy_overrides() {
        let profile = ExecutionProfile::default().with_retry_policy(Arc::new(FallthroughRetryPolicy));
        assert_eq!(
            profile.retry_policy.decide(&RetryErrorKind::ClientTimeout, 0, true),
            RetryDecision::Rethrow
        );
        assert_eq!(profile.speculative_policy.next_delay(1), None);
    }
}
