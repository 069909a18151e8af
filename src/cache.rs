use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque key/value store handed through the mesh context. The core never
/// inspects its contents; handlers and resolvers use it as they see fit.
#[async_trait]
pub trait MeshCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value);
    async fn delete(&self, key: &str);
}

/// Default in-process cache.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        InMemoryCache::default()
    }
}

#[async_trait]
impl MeshCache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value) {
        self.entries.write().await.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = InMemoryCache::new();
        cache.set("a", json!({"x": 1})).await;
        assert_eq!(cache.get("a").await, Some(json!({"x": 1})));
        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);
    }
}
