//! Per-run tool call cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::llm::ToolCallResult;

/// Successful tool results of one run, keyed by tool call identity.
///
/// Cloning shares the underlying map, so a retried run can be given the cache of the
/// attempt it replaces. Results stored before a cancellation stay valid.
#[derive(Debug, Clone, Default)]
pub struct ToolCallCache {
    results: Arc<RwLock<HashMap<String, ToolCallResult>>>,
}

impl ToolCallCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<ToolCallResult> {
        self.results.read().await.get(id).cloned()
    }

    /// Store a result. Errors are not cached so that a later identical call runs again.
    pub async fn insert(&self, result: &ToolCallResult) {
        if result.is_error() {
            return;
        }
        self.results
            .write()
            .await
            .insert(result.request.id.clone(), result.clone());
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCallRequestWithId;
    use serde_json::json;

    #[tokio::test]
    async fn test_only_successes_are_cached() {
        let cache = ToolCallCache::new();
        let ok = ToolCallRequestWithId::new("t", json!({"arg": "value1"}));
        let bad = ToolCallRequestWithId::new("t", json!({"arg": "value2"}));
        cache.insert(&ToolCallResult::success(ok.clone(), "r")).await;
        cache.insert(&ToolCallResult::failure(bad.clone(), "e")).await;

        assert_eq!(cache.get(&ok.id).await.unwrap().result.as_deref(), Some("r"));
        assert!(cache.get(&bad.id).await.is_none());

        // Clones share storage
        let shared = cache.clone();
        assert_eq!(shared.len().await, 1);
    }

    #[test]
    fn test_cache_from_sync_code() {
        let cache = ToolCallCache::new();
        let request = ToolCallRequestWithId::new("t", json!({}));
        tokio_test::block_on(cache.insert(&ToolCallResult::success(request.clone(), "r")));
        assert!(tokio_test::block_on(cache.get(&request.id)).is_some());
    }
}
