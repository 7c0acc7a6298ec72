use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::executor::{BackingPool, PolicyExecutor, PolicyResult};
use crate::models::{PolicyError, PolicyErrorKind};

pub(crate) type Registry = Mutex<HashMap<String, PolicyExecutor>>;

/// Factory and registry of policy executors sharing one backing pool. Executors
/// remove themselves from the registry once their shutdown completes.
#[derive(Clone)]
pub struct PolicyExecutorProvider {
    pool: Arc<dyn BackingPool>,
    registry: Arc<Registry>,
}

impl PolicyExecutorProvider {
    pub fn new(pool: Arc<dyn BackingPool>) -> Self {
        Self {
            pool,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn create(&self, identifier: impl Into<String>) -> PolicyResult<PolicyExecutor> {
        self.register(identifier.into(), None)
    }

    /// Creates an executor tagged with `owner`, so it can be shut down together with
    /// the rest of that owner's executors.
    pub fn create_owned(
        &self,
        identifier: impl Into<String>,
        owner: impl Into<String>,
    ) -> PolicyResult<PolicyExecutor> {
        self.register(identifier.into(), Some(owner.into()))
    }

    fn register(&self, identifier: String, owner: Option<String>) -> PolicyResult<PolicyExecutor> {
        if identifier.trim().is_empty() {
            return Err(PolicyError::new(
                PolicyErrorKind::InvalidInput,
                "policy executor identifier must not be empty",
            ));
        }
        let mut executors = self.lock_registry();
        if let Some(existing) = executors.get(&identifier)
            && !existing.is_terminated()
        {
            return Err(PolicyError::new(
                PolicyErrorKind::IllegalState,
                format!("policy executor '{identifier}' already exists"),
            )
            .for_executor(&identifier));
        }
        let executor = PolicyExecutor::build(
            identifier.clone(),
            owner,
            self.pool.clone(),
            Some(Arc::downgrade(&self.registry)),
        );
        executors.insert(identifier.clone(), executor.clone());
        tracing::debug!(executor = %identifier, owner = ?executor.owner(), "policy executor created");
        Ok(executor)
    }

    pub fn get(&self, identifier: &str) -> Option<PolicyExecutor> {
        self.lock_registry().get(identifier).cloned()
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.lock_registry().keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    /// `shutdown_now` on every executor created for `owner`. Returns how many were
    /// shut down.
    pub fn shutdown_now_by_owner(&self, owner: &str) -> usize {
        self.shutdown_now_matching(|executor| executor.owner() == Some(owner))
    }

    pub fn shutdown_now_by_identifier_prefix(&self, prefix: &str) -> usize {
        self.shutdown_now_matching(|executor| executor.identifier().starts_with(prefix))
    }

    /// Graceful shutdown of every registered executor.
    pub fn shutdown_all(&self) {
        for executor in self.matching(|_| true) {
            executor.shutdown();
        }
    }

    fn shutdown_now_matching(&self, predicate: impl Fn(&PolicyExecutor) -> bool) -> usize {
        let matched = self.matching(predicate);
        for executor in &matched {
            executor.shutdown_now();
        }
        matched.len()
    }

    // Snapshot first: shutting an executor down may deregister it, which takes the
    // registry lock.
    fn matching(&self, predicate: impl Fn(&PolicyExecutor) -> bool) -> Vec<PolicyExecutor> {
        self.lock_registry()
            .values()
            .filter(|executor| predicate(executor))
            .cloned()
            .collect()
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<String, PolicyExecutor>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SharedPool;

    fn provider() -> PolicyExecutorProvider {
        PolicyExecutorProvider::new(Arc::new(SharedPool::current().unwrap()))
    }

    #[tokio::test]
    async fn empty_identifier_is_rejected() {
        let error = provider().create("  ").unwrap_err();
        assert_eq!(error.kind, PolicyErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn idle_executor_deregisters_on_shutdown() {
        let provider = provider();
        let executor = provider.create("idle").unwrap();
        assert_eq!(provider.identifiers(), vec!["idle".to_string()]);

        executor.shutdown();
        assert!(executor.is_terminated());
        assert!(provider.get("idle").is_none());
    }
}
