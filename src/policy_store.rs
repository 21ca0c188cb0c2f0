//! Policy storage and hot reload.
//!
//! The rate limiter reads its policy through [`PolicyRepository`] on every
//! check. Policies are stored as `Arc<ThrottlePolicy>` and replaced whole, so
//! a reader sees either the old or the new policy, never a mix.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ratelimit::ThrottlePolicy;

/// Key under which the active policy is stored by default.
pub const DEFAULT_POLICY_KEY: &str = "throttle_policy";

/// Read/replace access to throttle policies.
pub trait PolicyRepository: Send + Sync {
    /// Store a policy, replacing any previous one under the same key.
    fn save(&self, key: &str, policy: ThrottlePolicy);

    /// Current policy for a key.
    fn load(&self, key: &str) -> Option<Arc<ThrottlePolicy>>;
}

/// Policies held in process memory.
#[derive(Debug, Default)]
pub struct MemoryPolicyRepository {
    policies: DashMap<String, Arc<ThrottlePolicy>>,
}

impl MemoryPolicyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository holding one policy under [`DEFAULT_POLICY_KEY`].
    pub fn with_policy(policy: ThrottlePolicy) -> Self {
        let repository = Self::new();
        repository.save(DEFAULT_POLICY_KEY, policy);
        repository
    }

    /// Remove a policy, disabling throttling for readers of that key.
    pub fn remove(&self, key: &str) -> Option<Arc<ThrottlePolicy>> {
        self.policies.remove(key).map(|(_, policy)| policy)
    }
}

impl PolicyRepository for MemoryPolicyRepository {
    fn save(&self, key: &str, policy: ThrottlePolicy) {
        debug!(key = %key, "Storing throttle policy");
        self.policies.insert(key.to_string(), Arc::new(policy));
    }

    fn load(&self, key: &str) -> Option<Arc<ThrottlePolicy>> {
        self.policies.get(key).map(|policy| Arc::clone(&policy))
    }
}

/// Periodically re-reads a policy file into a repository.
///
/// A file that fails to read or parse leaves the previous policy in place.
pub struct PolicyReloader {
    path: PathBuf,
    key: String,
    interval: Duration,
    repository: Arc<dyn PolicyRepository>,
}

impl PolicyReloader {
    pub fn new(
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        interval: Duration,
        repository: Arc<dyn PolicyRepository>,
    ) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            interval,
            repository,
        }
    }

    /// Load the file once. Returns whether the repository was updated.
    pub fn reload(&self) -> bool {
        match ThrottlePolicy::from_file(&self.path) {
            Ok(policy) => {
                for problem in policy.lint() {
                    warn!(path = %self.path.display(), problem = %problem, "Suspicious throttle policy entry");
                }
                self.repository.save(&self.key, policy);
                true
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to reload throttle policy, keeping previous policy"
                );
                false
            }
        }
    }

    /// Reload on a fixed interval until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            path = %self.path.display(),
            interval_secs = self.interval.as_secs(),
            "Starting throttle policy reloader"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
            loop {
                ticker.tick().await;
                self.reload();
            }
        })
    }
}
