use axum::http::HeaderMap;

fn header_lower(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Decides whether an upstream response must be relayed chunk by chunk
/// instead of buffered and copied in one piece.
pub(super) fn is_stream_response(headers: &HeaderMap) -> bool {
    let ct = header_lower(headers, "content-type");
    let te = header_lower(headers, "transfer-encoding");

    // Clearly SSE.
    if ct.contains("text/event-stream") {
        return true;
    }

    // HTTP/1.1 chunked, unless it carries a plain JSON document.
    if te.contains("chunked") && !ct.contains("application/json") {
        return true;
    }

    // Other known streaming content types.
    ct.contains("application/octet-stream")
        || ct.contains("application/x-ndjson")
        || ct.contains("application/stream+json")
}
