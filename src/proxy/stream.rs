use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

use super::smoothing::Chunk;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Plain streaming copy: every non-empty upstream chunk becomes one body
/// frame, flushed to the client as soon as hyper writes it. Stops quietly
/// when the client goes away (the body is dropped) and logs any other
/// upstream read error before ending the response.
pub(super) fn passthrough_body(resp: reqwest::Response) -> Body {
    let stream = futures_util::stream::unfold(resp.bytes_stream(), |mut upstream| async move {
        loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    return Some((Ok::<_, Infallible>(chunk), upstream));
                }
                Some(Err(err)) => {
                    error!("stream read error: {err}");
                    return None;
                }
                None => return None,
            }
        }
    });
    Body::from_stream(stream)
}

struct WriterState {
    out: mpsc::Receiver<Chunk>,
    heartbeat: Option<Interval>,
    chunk_count: u64,
    started: Instant,
    // Dropping the body (client disconnect, server shutdown) cancels the
    // whole pipeline behind it.
    _cancel: DropGuard,
}

enum WriterEvent {
    Chunk(Option<Chunk>),
    Ping,
}

/// Downstream writer of the smoothing pipeline: relays paced chunks as
/// flushed frames and, when enabled, interleaves SSE comment-frame
/// heartbeats on an independent 1s clock. Chunk writes never reset the
/// heartbeat clock.
pub(super) fn smoothing_body(
    out: mpsc::Receiver<Chunk>,
    heartbeat_enabled: bool,
    cancel: CancellationToken,
) -> Body {
    let heartbeat = heartbeat_enabled.then(|| {
        let mut hb = time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
        hb
    });

    let state = WriterState {
        out,
        heartbeat,
        chunk_count: 0,
        started: Instant::now(),
        _cancel: cancel.drop_guard(),
    };

    let stream = futures_util::stream::unfold(state, |mut st| async move {
        let event = match st.heartbeat.as_mut() {
            Some(hb) => tokio::select! {
                maybe = st.out.recv() => WriterEvent::Chunk(maybe),
                _ = hb.tick() => WriterEvent::Ping,
            },
            None => WriterEvent::Chunk(st.out.recv().await),
        };

        match event {
            WriterEvent::Chunk(Some(ck)) => {
                st.chunk_count += 1;
                Some((Ok::<_, Infallible>(ck.body), st))
            }
            WriterEvent::Chunk(None) => {
                info!(
                    "push complete, total {} chunks, duration {:?}",
                    st.chunk_count,
                    st.started.elapsed()
                );
                None
            }
            WriterEvent::Ping => {
                let frame = heartbeat_frame();
                debug!("sent heartbeat");
                Some((Ok(frame), st))
            }
        }
    });
    Body::from_stream(stream)
}

fn heartbeat_frame() -> Bytes {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Bytes::from(format!(": ping - {now}\n\n"))
}
