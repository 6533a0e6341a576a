use std::collections::{HashMap, HashSet};
use std::env;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::extract_route;

/// Top-level segments reserved for the proxy's own endpoints; user routes
/// must not claim them.
pub const RESERVED_TOP_ROUTES: &[&str] = &["api"];

/// A single routing table entry: requests whose first path segment matches
/// `path` are forwarded to `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Public URL prefix, e.g. `/openai`. Must start with `/`.
    pub path: String,
    /// Absolute upstream base URL, e.g. `https://api.openai.com`.
    pub target: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Optional mapping from logical model ids to upstream-specific ones.
    /// Carried on the matched route for collaborators; the relay itself
    /// never consults it.
    #[serde(default, rename = "model_map", skip_serializing_if = "HashMap::is_empty")]
    pub model_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesConfig {
    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Debug, Error)]
pub enum RouteValidationError {
    #[error("invalid route: empty path is not allowed")]
    EmptyPath,
    #[error("invalid route: path '{0}' must start with '/'")]
    MissingLeadingSlash(String),
    #[error("invalid route: path '{0}' must not contain a query string")]
    QueryInPath(String),
    #[error("invalid route: path '{0}' has an empty top-level segment")]
    EmptyTopSegment(String),
    #[error("invalid route: top segment of '{0}' is reserved by the proxy")]
    ReservedTopRoute(String),
    #[error("invalid route: duplicate path '{0}'")]
    DuplicatePath(String),
}

impl RoutesConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid routes JSON")
    }

    /// Reads and parses a routes file. Validation is a separate step so
    /// callers can decide how load and validation failures differ.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text)
    }

    /// The table served when no `routes.json` exists and `ROUTES` is unset.
    pub fn builtin_default() -> Self {
        Self {
            routes: vec![Route {
                path: "/openai".to_string(),
                target: "https://api.openai.com".to_string(),
                name: String::new(),
                description: String::new(),
                model_map: HashMap::new(),
            }],
        }
    }

    pub fn validate(&self) -> Result<(), RouteValidationError> {
        let mut seen = HashSet::new();
        for route in &self.routes {
            let path = route.path.as_str();
            if path.is_empty() {
                return Err(RouteValidationError::EmptyPath);
            }
            if !path.starts_with('/') {
                return Err(RouteValidationError::MissingLeadingSlash(path.to_string()));
            }
            if path.contains('?') {
                return Err(RouteValidationError::QueryInPath(path.to_string()));
            }
            let (top, _) = extract_route(path);
            if top.is_empty() {
                return Err(RouteValidationError::EmptyTopSegment(path.to_string()));
            }
            if RESERVED_TOP_ROUTES.contains(&top) {
                return Err(RouteValidationError::ReservedTopRoute(path.to_string()));
            }
            if !seen.insert(path) {
                return Err(RouteValidationError::DuplicatePath(path.to_string()));
            }
        }
        Ok(())
    }
}

/// Parses the `ROUTES` payload. `Ok(None)` when the variable is unset or
/// blank; a present but malformed payload is an error (the caller treats it
/// as fatal rather than falling back to the file).
pub fn parse_routes_env(raw: Option<&str>) -> Result<Option<RoutesConfig>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let cfg = RoutesConfig::from_json(raw).context("failed to parse ROUTES env var")?;
    Ok(Some(cfg))
}

pub fn load_routes_from_env() -> Result<Option<RoutesConfig>> {
    parse_routes_env(env::var("ROUTES").ok().as_deref())
}

/// Auth settings consumed by the surrounding auth middleware. Only the
/// loader lives here; an invalid whitelist refuses startup.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub ip_nets: Vec<IpNetwork>,
    pub token_header: String,
    pub token_key: String,
}

impl AuthConfig {
    pub fn parse(whitelist: &str, token_header: &str, token_key: &str) -> Result<Self> {
        let mut ip_nets = Vec::new();
        for item in whitelist.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let net = if item.contains('/') {
                item.parse::<IpNetwork>()
                    .with_context(|| format!("invalid cidr in AUTH_IP_WHITELIST: {item}"))?
            } else {
                // Bare address: widen to a host network.
                let ip: IpAddr = item
                    .parse()
                    .with_context(|| format!("invalid ip in AUTH_IP_WHITELIST: {item}"))?;
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                IpNetwork::new(ip, prefix)
                    .with_context(|| format!("invalid ip in AUTH_IP_WHITELIST: {item}"))?
            };
            ip_nets.push(net);
        }
        Ok(Self {
            ip_nets,
            token_header: token_header.trim().to_string(),
            token_key: token_key.trim().to_string(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::parse(
            env::var("AUTH_IP_WHITELIST").unwrap_or_default().as_str(),
            env::var("AUTH_TOKEN_HEADER").unwrap_or_default().as_str(),
            env::var("AUTH_TOKEN_KEY").unwrap_or_default().as_str(),
        )
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.ip_nets.iter().any(|net| net.contains(ip))
    }
}

/// Response-relay toggles, read once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Route streaming responses through the smoothing pipeline.
    pub smoothing: bool,
    /// Emit SSE comment-frame heartbeats on an independent 1s clock.
    pub heartbeat: bool,
}

impl StreamOptions {
    pub fn from_env() -> Self {
        Self {
            smoothing: env_bool("STREAM_SMOOTHING_ENABLED"),
            heartbeat: env_bool("STREAM_HEARTBEAT_ENABLED"),
        }
    }
}

fn env_bool(key: &str) -> bool {
    let Ok(v) = env::var(key) else {
        return false;
    };
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn route(path: &str, target: &str) -> Route {
        Route {
            path: path.to_string(),
            target: target.to_string(),
            name: String::new(),
            description: String::new(),
            model_map: HashMap::new(),
        }
    }

    #[test]
    fn from_json_parses_routes_with_optional_fields() {
        let cfg = RoutesConfig::from_json(
            r#"{"routes":[{"path":"/openai","target":"https://api.openai.com",
                "name":"openai","model_map":{"gpt":"gpt-4o"}}]}"#,
        )
        .expect("parse");
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.routes[0].path, "/openai");
        assert_eq!(cfg.routes[0].name, "openai");
        assert_eq!(cfg.routes[0].model_map.get("gpt").map(String::as_str), Some("gpt-4o"));
    }

    #[test]
    fn parse_routes_env_is_none_when_unset_or_blank() {
        assert!(parse_routes_env(None).expect("unset").is_none());
        assert!(parse_routes_env(Some("   ")).expect("blank").is_none());
    }

    #[test]
    fn parse_routes_env_rejects_malformed_json() {
        assert!(parse_routes_env(Some("{not json")).is_err());
    }

    #[test]
    fn validate_accepts_normal_route() {
        let cfg = RoutesConfig {
            routes: vec![route("/openai", "https://api.openai.com")],
        };
        cfg.validate().expect("normal route should pass validation");
    }

    #[test]
    fn validate_rejects_empty_path() {
        let cfg = RoutesConfig {
            routes: vec![route("", "https://example.com")],
        };
        assert!(matches!(cfg.validate(), Err(RouteValidationError::EmptyPath)));
    }

    #[test]
    fn validate_rejects_path_without_leading_slash() {
        let cfg = RoutesConfig {
            routes: vec![route("openai", "https://api.openai.com")],
        };
        assert!(matches!(
            cfg.validate(),
            Err(RouteValidationError::MissingLeadingSlash(_))
        ));
    }

    #[test]
    fn validate_rejects_query_in_path() {
        let cfg = RoutesConfig {
            routes: vec![route("/openai?x=1", "https://api.openai.com")],
        };
        assert!(matches!(cfg.validate(), Err(RouteValidationError::QueryInPath(_))));
    }

    #[test]
    fn validate_rejects_reserved_top_route() {
        let cfg = RoutesConfig {
            routes: vec![route("/api", "https://example.com")],
        };
        assert!(matches!(
            cfg.validate(),
            Err(RouteValidationError::ReservedTopRoute(_))
        ));
    }

    #[test]
    fn validate_rejects_duplicate_paths() {
        let cfg = RoutesConfig {
            routes: vec![
                route("/openai", "https://api.openai.com"),
                route("/openai", "https://other.example.com"),
            ],
        };
        assert!(matches!(
            cfg.validate(),
            Err(RouteValidationError::DuplicatePath(_))
        ));
    }

    #[test]
    fn auth_parse_widens_bare_ipv4_to_host_network() {
        let cfg = AuthConfig::parse("127.0.0.1", "", "").expect("parse");
        assert_eq!(cfg.ip_nets.len(), 1);
        assert_eq!(cfg.ip_nets[0].prefix(), 32);
        assert!(cfg.allows_ip("127.0.0.1".parse().unwrap()));
        assert!(!cfg.allows_ip("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn auth_parse_widens_bare_ipv6_to_host_network() {
        let cfg = AuthConfig::parse("::1", "", "").expect("parse");
        assert_eq!(cfg.ip_nets.len(), 1);
        assert_eq!(cfg.ip_nets[0].prefix(), 128);
        assert!(cfg.allows_ip("::1".parse().unwrap()));
    }

    #[test]
    fn auth_parse_keeps_cidr_blocks_as_is() {
        let cfg = AuthConfig::parse("10.0.0.0/8, 192.168.1.0/24", "", "").expect("parse");
        assert_eq!(cfg.ip_nets.len(), 2);
        assert!(cfg.allows_ip("10.1.2.3".parse().unwrap()));
        assert!(cfg.allows_ip("192.168.1.42".parse().unwrap()));
        assert!(!cfg.allows_ip("192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn auth_parse_rejects_invalid_items() {
        assert!(AuthConfig::parse("not-an-ip", "", "").is_err());
        assert!(AuthConfig::parse("10.0.0.0/99", "", "").is_err());
    }

    #[test]
    fn auth_parse_trims_token_settings() {
        let cfg = AuthConfig::parse("", "  X-Proxy-Token ", " secret \n").expect("parse");
        assert_eq!(cfg.token_header, "X-Proxy-Token");
        assert_eq!(cfg.token_key, "secret");
    }
}
