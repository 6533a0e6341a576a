use crate::config::Route;
use crate::registry::RouteRegistry;
use crate::util::extract_route;

/// Per-request routing decision made at ingress and consumed by the proxy
/// handler.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub top_route: String,
    /// Remainder of the path with the raw query re-attached.
    pub sub_path: String,
    /// Upstream base URL (or, for direct-URL proxying, the full target).
    pub target_endpoint: String,
    /// Final outbound URL; filled in by the proxy handler.
    pub target_url: String,
    /// Matched table entry, when routing went through the registry.
    pub route: Option<Route>,
    pub proxified: bool,
}

/// Classifies an inbound request path against the current routing table.
/// Works on a registry snapshot; never blocks and holds no lock while the
/// handler runs.
pub fn extract(path: &str, query: Option<&str>, registry: &RouteRegistry) -> RequestContext {
    let query = query.filter(|q| !q.is_empty());

    // Direct URL proxy: /https://example.com/path or /http://example.com/path
    if let Some(rest) = path.strip_prefix('/')
        && (rest.starts_with("http://") || rest.starts_with("https://"))
    {
        let mut target = rest.to_string();
        if let Some(q) = query {
            target.push('?');
            target.push_str(q);
        }
        return RequestContext {
            target_endpoint: target,
            proxified: true,
            ..Default::default()
        };
    }

    let (top, sub) = extract_route(path);
    let sub_path = match query {
        Some(q) if sub.is_empty() => format!("?{q}"),
        Some(q) => format!("{sub}?{q}"),
        None => sub.to_string(),
    };

    let snapshot = registry.snapshot();
    let wanted = format!("/{top}");
    match snapshot.routes.iter().find(|r| r.path == wanted) {
        Some(route) => RequestContext {
            top_route: top.to_string(),
            sub_path,
            target_endpoint: route.target.clone(),
            target_url: String::new(),
            route: Some(route.clone()),
            proxified: true,
        },
        None => RequestContext {
            top_route: top.to_string(),
            sub_path,
            proxified: false,
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::RoutesConfig;

    fn registry_with(entries: &[(&str, &str)]) -> RouteRegistry {
        let registry = RouteRegistry::new();
        let routes = entries
            .iter()
            .map(|(path, target)| Route {
                path: path.to_string(),
                target: target.to_string(),
                name: String::new(),
                description: String::new(),
                model_map: HashMap::new(),
            })
            .collect();
        registry.publish(RoutesConfig { routes });
        registry
    }

    #[test]
    fn direct_url_proxy_takes_the_rest_of_the_path() {
        let registry = registry_with(&[]);
        let ctx = extract("/https://example.com/foo", Some("x=1"), &registry);
        assert!(ctx.proxified);
        assert_eq!(ctx.target_endpoint, "https://example.com/foo?x=1");
        assert_eq!(ctx.top_route, "");
        assert_eq!(ctx.sub_path, "");
        assert!(ctx.route.is_none());
    }

    #[test]
    fn direct_url_proxy_without_query() {
        let registry = registry_with(&[]);
        let ctx = extract("/http://example.com/foo/bar", None, &registry);
        assert!(ctx.proxified);
        assert_eq!(ctx.target_endpoint, "http://example.com/foo/bar");
    }

    #[test]
    fn named_route_match_fills_target_and_route() {
        let registry = registry_with(&[("/openai", "https://api.openai.com")]);
        let ctx = extract("/openai/v1/models", None, &registry);
        assert!(ctx.proxified);
        assert_eq!(ctx.top_route, "openai");
        assert_eq!(ctx.sub_path, "/v1/models");
        assert_eq!(ctx.target_endpoint, "https://api.openai.com");
        assert_eq!(ctx.route.as_ref().map(|r| r.path.as_str()), Some("/openai"));
    }

    #[test]
    fn query_is_reattached_to_the_sub_path() {
        let registry = registry_with(&[("/openai", "https://api.openai.com")]);
        let ctx = extract("/openai/v1/models", Some("limit=5"), &registry);
        assert_eq!(ctx.sub_path, "/v1/models?limit=5");
    }

    #[test]
    fn query_without_sub_path_becomes_bare_query() {
        let registry = registry_with(&[("/openai", "https://api.openai.com")]);
        let ctx = extract("/openai", Some("limit=5"), &registry);
        assert_eq!(ctx.sub_path, "?limit=5");
    }

    #[test]
    fn unmatched_top_is_not_proxified() {
        let registry = registry_with(&[("/openai", "https://api.openai.com")]);
        let ctx = extract("/unknown/v1", None, &registry);
        assert!(!ctx.proxified);
        assert_eq!(ctx.top_route, "unknown");
        assert_eq!(ctx.sub_path, "/v1");
        assert_eq!(ctx.target_endpoint, "");
    }

    #[test]
    fn empty_registry_is_fail_closed() {
        let registry = RouteRegistry::new();
        let ctx = extract("/openai/v1/models", None, &registry);
        assert!(!ctx.proxified);
    }
}
