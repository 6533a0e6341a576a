use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::routing::any;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

mod classify;
mod smoothing;
mod stream;

use crate::config::StreamOptions;
use crate::extractor;
use crate::registry::RouteRegistry;
use crate::util::join_url;

use self::classify::is_stream_response;

/// The only request-header hygiene applied: these leak edge-network
/// metadata into the origin and confuse it, so they are dropped. Every
/// other request header passes through byte-exact; response headers are
/// relayed untouched.
const STRIP_REQUEST_HEADERS: &[&str] = &[
    "cdn-loop",
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
    "true-client-ip",
];

fn sanitize_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        // Matching ignores case.
        if STRIP_REQUEST_HEADERS
            .iter()
            .any(|h| name.as_str().eq_ignore_ascii_case(h))
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn request_has_body(headers: &HeaderMap) -> bool {
    if headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() != "0")
    {
        return true;
    }
    headers.contains_key("transfer-encoding")
}

/// Shared relay service; one per process.
#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    pub registry: Arc<RouteRegistry>,
    pub stream_opts: StreamOptions,
}

impl ProxyService {
    /// One pooled client serves every upstream: proxy settings come from
    /// the process environment and no decompression is configured, so
    /// upstream chunk boundaries survive the relay. No client timeout —
    /// the inbound request's lifetime is the only deadline.
    pub fn new(registry: Arc<RouteRegistry>, stream_opts: StreamOptions) -> Result<Self> {
        let client = Client::builder().pool_max_idle_per_host(50).build()?;
        Ok(Self {
            client,
            registry,
            stream_opts,
        })
    }
}

#[instrument(skip_all, fields(path = %req.uri().path()))]
pub async fn handle_proxy(
    proxy: ProxyService,
    req: Request<Body>,
) -> Result<Response<Body>, (StatusCode, String)> {
    let (parts, body) = req.into_parts();

    let mut rctx = extractor::extract(parts.uri.path(), parts.uri.query(), &proxy.registry);
    if !rctx.proxified {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no route for '/{}'", rctx.top_route),
        ));
    }

    rctx.target_url = join_url(&rctx.target_endpoint, &rctx.sub_path);
    debug!(
        "forwarding {} {} to {} (route: {})",
        parts.method,
        parts.uri.path(),
        rctx.target_url,
        rctx.route.as_ref().map(|r| r.path.as_str()).unwrap_or("-"),
    );

    let url = reqwest::Url::parse(&rctx.target_url).map_err(|err| {
        error!("failed to create upstream request for {}: {err}", rctx.target_url);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to create upstream request".to_string(),
        )
    })?;

    let mut builder = proxy
        .client
        .request(parts.method, url)
        .headers(sanitize_request_headers(&parts.headers));
    if request_has_body(&parts.headers) {
        builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let resp = builder.send().await.map_err(|err| {
        error!("failed to reach upstream {}: {err}", rctx.target_url);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to reach upstream".to_string(),
        )
    })?;

    let status = resp.status();
    let resp_headers = resp.headers().clone();

    let body = if is_stream_response(resp.headers()) {
        if proxy.stream_opts.smoothing {
            let cancel = CancellationToken::new();
            let paced = smoothing::pipeline(resp.bytes_stream(), cancel.clone());
            stream::smoothing_body(paced, proxy.stream_opts.heartbeat, cancel)
        } else {
            stream::passthrough_body(resp)
        }
    } else {
        let bytes = resp.bytes().await.map_err(|err| {
            error!("failed to read upstream response from {}: {err}", rctx.target_url);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read upstream response".to_string(),
            )
        })?;
        Body::from(bytes)
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

pub fn router(proxy: ProxyService) -> Router {
    // axum 0.8 wildcard syntax; one catch-all handler under the listener.
    Router::new().route("/{*path}", any(move |req| handle_proxy(proxy.clone(), req)))
}
