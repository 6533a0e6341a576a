use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::RoutesConfig;

/// Process-wide routing table cell. The watcher is the only writer and
/// replaces the whole table atomically; request handlers take O(1)
/// snapshots and never block each other.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    inner: ArcSwap<RoutesConfig>,
}

impl RouteRegistry {
    /// Starts empty: until the watcher publishes, every lookup misses and
    /// requests stay unrouted.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, cfg: RoutesConfig) {
        self.inner.store(Arc::new(cfg));
    }

    pub fn snapshot(&self) -> Arc<RoutesConfig> {
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Route;

    fn table(tag: &str, count: usize) -> RoutesConfig {
        let routes = (0..count)
            .map(|i| Route {
                path: format!("/{tag}{i}"),
                target: format!("https://{tag}.example.com"),
                name: tag.to_string(),
                description: String::new(),
                model_map: HashMap::new(),
            })
            .collect();
        RoutesConfig { routes }
    }

    #[test]
    fn unpublished_registry_reads_as_empty() {
        let registry = RouteRegistry::new();
        assert!(registry.snapshot().routes.is_empty());
    }

    #[test]
    fn publish_replaces_the_whole_snapshot() {
        let registry = RouteRegistry::new();
        registry.publish(table("a", 2));
        assert_eq!(registry.snapshot().routes.len(), 2);
        registry.publish(table("b", 3));
        let snap = registry.snapshot();
        assert_eq!(snap.routes.len(), 3);
        assert!(snap.routes.iter().all(|r| r.name == "b"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_readers_always_observe_a_complete_table() {
        let registry = Arc::new(RouteRegistry::new());
        registry.publish(table("a", 2));

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    if i % 2 == 0 {
                        registry.publish(table("b", 3));
                    } else {
                        registry.publish(table("a", 2));
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        let snap = registry.snapshot();
                        // Either table in full, never a mix.
                        let tag = snap.routes[0].name.as_str();
                        let expected = if tag == "a" { 2 } else { 3 };
                        assert_eq!(snap.routes.len(), expected);
                        assert!(snap.routes.iter().all(|r| r.name == tag));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.expect("writer");
        for r in readers {
            r.await.expect("reader");
        }
    }
}
