//! In-process queue store.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{QueueRef, QueueStore};
use crate::Result;

/// Queue store backed by a map of in-memory deques.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    lists: DashMap<String, VecDeque<QueueRef>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push(&self, key: &str, item: &QueueRef) -> Result<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(item.clone());
        Ok(())
    }

    async fn pop(&self, key: &str) -> Result<Option<QueueRef>> {
        Ok(self
            .lists
            .get_mut(key)
            .and_then(|mut list| list.pop_front()))
    }

    async fn len(&self, key: &str) -> Result<u64> {
        Ok(self.lists.get(key).map(|list| list.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;

    #[tokio::test]
    async fn test_fifo_per_key() {
        let store = MemoryQueueStore::new();
        store.push("k", &QueueRef::new("a", Priority::Low)).await.unwrap();
        store.push("k", &QueueRef::new("b", Priority::Low)).await.unwrap();
        store.push("other", &QueueRef::new("c", Priority::Low)).await.unwrap();

        assert_eq!(store.len("k").await.unwrap(), 2);
        assert_eq!(store.pop("k").await.unwrap().unwrap().notification_id, "a");
        assert_eq!(store.pop("k").await.unwrap().unwrap().notification_id, "b");
        assert!(store.pop("k").await.unwrap().is_none());
        assert!(store.pop("missing").await.unwrap().is_none());
    }
}
