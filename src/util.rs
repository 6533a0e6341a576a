/// Splits a request path into its top-level route segment and the rest:
/// `/openai/v1/chat` becomes `("openai", "/v1/chat")`. The remainder keeps
/// its leading `/`; without a remainder it is the empty string.
pub fn extract_route(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.find('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos..]),
        None => (trimmed, ""),
    }
}

/// Joins a base URL and a sub path with exactly one `/` between them. An
/// empty sub path yields the base without any trailing `/`.
pub fn join_url(base: &str, sub: &str) -> String {
    let base = base.trim_end_matches('/');
    let sub = sub.trim_start_matches('/');
    if sub.is_empty() {
        return base.to_string();
    }
    format!("{base}/{sub}")
}
