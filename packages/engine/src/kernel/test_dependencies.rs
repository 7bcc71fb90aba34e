// Test doubles and an in-memory engine wiring for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::jobs::{
    BatchCoordinator, DispatcherConfig, InMemoryJobStore, JobDispatcher, JobEvents, JobQueue,
    JobRegistry, RetryPolicy, Watchdog, WatchdogConfig,
};
use super::{BaseEmbeddingService, EMBEDDING_DIMENSIONS};

// =============================================================================
// Mock Embedding Service
// =============================================================================

pub struct MockEmbeddingService {
    // Returns a fixed embedding vector for all inputs
    fixed_embedding: Vec<f32>,
    // Remaining calls that fail before the service recovers
    failures_remaining: AtomicUsize,
    // Track all texts that embeddings were generated for
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockEmbeddingService {
    pub fn new() -> Self {
        Self {
            fixed_embedding: vec![0.1; EMBEDDING_DIMENSIONS],
            failures_remaining: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next `times` calls with a transient provider error.
    pub fn failing(self, times: usize) -> Self {
        self.failures_remaining.store(times, Ordering::SeqCst);
        self
    }

    /// Get all texts that embeddings were generated for
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MockEmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseEmbeddingService for MockEmbeddingService {
    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        // Record the call
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("embedding provider unavailable"));
        }

        Ok(self.fixed_embedding.clone())
    }
}

// =============================================================================
// Test Dependencies
// =============================================================================

/// The engine wired over in-memory storage, with mock providers.
pub struct TestDependencies {
    pub store: Arc<InMemoryJobStore>,
    pub registry: Arc<JobRegistry>,
    pub events: JobEvents,
    pub embedding_service: Arc<MockEmbeddingService>,
}

impl TestDependencies {
    /// Retries are immediate so a drained dispatcher sees every attempt.
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryJobStore::new(RetryPolicy::immediate())),
            registry: Arc::new(JobRegistry::new()),
            events: JobEvents::new(),
            embedding_service: Arc::new(MockEmbeddingService::new()),
        }
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.store = Arc::new(InMemoryJobStore::new(policy));
        self
    }

    /// Set a mock embedding service
    pub fn mock_embeddings(mut self, service: MockEmbeddingService) -> Self {
        self.embedding_service = Arc::new(service);
        self
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.store.clone(), self.events.clone())
    }

    pub fn dispatcher(&self) -> JobDispatcher {
        self.dispatcher_with(DispatcherConfig {
            worker_id: "test-worker".to_string(),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        })
    }

    pub fn dispatcher_with(&self, config: DispatcherConfig) -> JobDispatcher {
        JobDispatcher::with_config(
            self.store.clone(),
            self.registry.clone(),
            self.events.clone(),
            config,
        )
    }

    pub fn watchdog(&self, config: WatchdogConfig) -> Watchdog {
        Watchdog::new(self.store.clone(), self.events.clone(), config)
    }

    pub fn batches(&self) -> BatchCoordinator {
        BatchCoordinator::new(self.queue())
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embeddings_fail_then_recover() {
        let service = MockEmbeddingService::new().failing(2);

        assert!(service.generate("a").await.is_err());
        assert!(service.generate("b").await.is_err());
        assert_eq!(service.generate("c").await.unwrap().len(), EMBEDDING_DIMENSIONS);
        assert_eq!(service.calls(), vec!["a", "b", "c"]);
    }
}
