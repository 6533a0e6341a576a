use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One newline-delimited record flowing through the pipeline.
#[derive(Debug, Clone)]
pub(super) struct Chunk {
    pub(super) body: Bytes,
}

pub(super) const READER_CHAN_CAPACITY: usize = 100;
pub(super) const DATA_CHAN_CAPACITY: usize = 300;

/// Minimum time the tail-sprint log stays quiet between entries.
const TAIL_LOG_GAP: Duration = Duration::from_millis(100);

/// Pacing knobs for the flow controller. The defaults are the production
/// cadence; tests shrink or reshape them.
#[derive(Debug, Clone, Copy)]
pub(super) struct FlowControlConfig {
    pub(super) data_chan_capacity: usize,
    pub(super) target_buffer_ratio: f64,
    pub(super) min_interval: Duration,
    pub(super) max_interval: Duration,
    pub(super) adjust_period: Duration,
    pub(super) rate_smoothing: f64,
    pub(super) tail_boost: bool,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            data_chan_capacity: DATA_CHAN_CAPACITY,
            target_buffer_ratio: 0.2,
            min_interval: Duration::from_millis(2),
            max_interval: Duration::from_millis(20),
            adjust_period: Duration::from_millis(100),
            rate_smoothing: 0.3,
            tail_boost: true,
        }
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// SSE terminal marker. Advisory: it only arms the tail sprint, the chunk
/// itself is forwarded untouched.
pub(super) fn detect_done_signal(chunk: &[u8]) -> bool {
    contains_bytes(chunk, b"data: [DONE]")
}

/// Wires the full pipeline for one upstream body: reader into flow
/// controller. The caller owns the output side (the response body).
pub(super) fn pipeline<S, E>(upstream: S, cancel: CancellationToken) -> mpsc::Receiver<Chunk>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let chunks = read_upstream_chunks(upstream, cancel.clone());
    apply_flow_control(chunks, cancel)
}

/// Re-frames the upstream body into newline-terminated chunks. A
/// non-terminated remainder at EOF is emitted as a final chunk. Output
/// capacity is small on purpose: a full channel blocks further upstream
/// reads.
pub(super) fn read_upstream_chunks<S, E>(
    upstream: S,
    cancel: CancellationToken,
) -> mpsc::Receiver<Chunk>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(READER_CHAN_CAPACITY);

    tokio::spawn(async move {
        let mut upstream = std::pin::pin!(upstream);
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("client disconnected, stop reading upstream");
                    return;
                }
                item = upstream.next() => item,
            };
            match item {
                Some(Ok(data)) => {
                    pending.extend_from_slice(&data);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let ck = Chunk {
                            body: Bytes::from(line),
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                warn!("client disconnected, stop reading upstream");
                                return;
                            }
                            res = tx.send(ck) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    error!("error reading upstream: {err}");
                    return;
                }
                None => {
                    if !pending.is_empty() {
                        let _ = tx
                            .send(Chunk {
                                body: Bytes::from(pending),
                            })
                            .await;
                    }
                    return;
                }
            }
        }
    });

    rx
}

/// Crosses from the fill half to the drain half of the flow controller.
#[derive(Default)]
struct DoneSignal {
    flag: AtomicBool,
    seen_at: Mutex<Option<Instant>>,
}

impl DoneSignal {
    fn mark(&self) {
        let mut seen = self.seen_at.lock().unwrap_or_else(|e| e.into_inner());
        if seen.is_none() {
            *seen = Some(Instant::now());
        }
        self.flag.store(true, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn seen_at(&self) -> Option<Instant> {
        *self.seen_at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(super) fn apply_flow_control(
    input: mpsc::Receiver<Chunk>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Chunk> {
    apply_flow_control_with(input, cancel, FlowControlConfig::default())
}

pub(super) fn apply_flow_control_with(
    mut input: mpsc::Receiver<Chunk>,
    cancel: CancellationToken,
    cfg: FlowControlConfig,
) -> mpsc::Receiver<Chunk> {
    debug!(
        "flow control enabled: data_chan_capacity={}, target_buffer_ratio={:.2}, min_interval={}ms, max_interval={}ms, adjust_period={}ms, rate_smoothing={:.2}, tail_boost={}",
        cfg.data_chan_capacity,
        cfg.target_buffer_ratio,
        cfg.min_interval.as_millis(),
        cfg.max_interval.as_millis(),
        cfg.adjust_period.as_millis(),
        cfg.rate_smoothing,
        cfg.tail_boost,
    );

    let done = Arc::new(DoneSignal::default());
    let (buf_tx, buf_rx) = mpsc::channel(cfg.data_chan_capacity);

    // Fill half: drain the reader into the buffer, watching for the done
    // sentinel on the way through.
    {
        let done = done.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(ck) = input.recv().await {
                if detect_done_signal(&ck.body) {
                    debug!("detected done signal from upstream");
                    done.mark();
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!("client disconnected, stop buffering");
                        return;
                    }
                    res = buf_tx.send(ck) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    let (out_tx, out_rx) = mpsc::channel(cfg.data_chan_capacity);
    tokio::spawn(drain_buffer(buf_rx, out_tx, cancel, done, cfg));
    out_rx
}

async fn drain_buffer(
    mut buf: mpsc::Receiver<Chunk>,
    out: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
    done: Arc<DoneSignal>,
    cfg: FlowControlConfig,
) {
    let start_time = Instant::now();
    let mut total_chunks: u64 = 0;
    let mut current_interval = cfg.min_interval;
    let mut last_adjust = Instant::now();
    let mut is_first_chunk = true;
    let mut last_tail_log: Option<Instant> = None;

    let mut ticker = new_ticker(current_interval);

    loop {
        let ck = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("client disconnected, stopping flow control");
                return;
            }
            maybe = buf.recv() => match maybe {
                Some(ck) => ck,
                None => {
                    // Upstream finished and the buffer is fully drained.
                    if let Some(seen) = done.seen_at() {
                        info!("tail drain complete in {:?}", seen.elapsed());
                    }
                    return;
                }
            },
        };

        // The first chunk goes out immediately; pacing starts after it.
        if is_first_chunk {
            if out.send(ck).await.is_err() {
                return;
            }
            is_first_chunk = false;
            total_chunks += 1;
            continue;
        }

        // Sprint: the buffer is nearly full, drain at the floor interval.
        if buf.len() > cfg.data_chan_capacity.saturating_sub(10)
            && current_interval > cfg.min_interval
        {
            current_interval = cfg.min_interval;
            ticker = new_ticker(current_interval);
            info!(
                "sprint: buffer {}/{}, interval forced to {}ms",
                buf.len(),
                cfg.data_chan_capacity,
                current_interval.as_millis()
            );
        }

        // Tail sprint: the upstream already said it is done, flush the
        // rest as fast as the floor allows.
        if cfg.tail_boost && done.is_set() {
            if current_interval != cfg.min_interval {
                current_interval = cfg.min_interval;
                ticker = new_ticker(current_interval);
            }
            if last_tail_log.is_none_or(|t| t.elapsed() >= TAIL_LOG_GAP) {
                let pending = buf.len() + 1;
                let eta = current_interval * pending as u32;
                debug!(
                    "tail sprint: interval={}ms buf={}/{} pending={} eta~{:?}",
                    current_interval.as_millis(),
                    buf.len(),
                    cfg.data_chan_capacity,
                    pending,
                    eta
                );
                last_tail_log = Some(Instant::now());
            }
        }

        // Gate on the ticker: first packet instantly, every later packet a
        // beat apart, which is what reads as a typewriter.
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                warn!("client disconnected, stop streaming");
                return;
            }
        }
        if out.send(ck).await.is_err() {
            return;
        }
        total_chunks += 1;

        // Periodic adjustment toward the observed historical rate.
        if last_adjust.elapsed() >= cfg.adjust_period
            && !(cfg.tail_boost && done.is_set())
            && total_chunks > 5
        {
            let elapsed = start_time.elapsed().as_secs_f64();
            let historical_rate = total_chunks as f64 / elapsed;
            if historical_rate > 0.0 {
                let adjusted = adjust_interval(buf.len(), historical_rate, &cfg);
                let new_interval = smooth_interval(current_interval, adjusted, cfg.rate_smoothing);
                if new_interval != current_interval {
                    current_interval = new_interval;
                    ticker = new_ticker(current_interval);
                    debug!(
                        "adjusting send rate: buffer={} historical_rate={:.2}/s new_interval={}ms",
                        buf.len(),
                        historical_rate,
                        current_interval.as_millis()
                    );
                }
            }
            last_adjust = Instant::now();
        }
    }
}

/// A ticker whose first tick lands one full period out; `interval()` would
/// fire immediately and break the gate. Rebuilding on every cadence change
/// keeps the next emission aligned with the new period instead of
/// accumulating drift. Missed ticks collapse into one late tick, so a slow
/// stretch never turns into a burst of unpaced emissions.
fn new_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    ticker
}

/// Candidate interval derived from the historical chunk rate, biased by
/// buffer occupancy and clamped to the configured band.
fn adjust_interval(buf_len: usize, historical_rate: f64, cfg: &FlowControlConfig) -> Duration {
    let ideal = Duration::from_millis((1000.0 / historical_rate) as u64);

    let high_mark = (cfg.data_chan_capacity as f64 * cfg.target_buffer_ratio * 2.0) as usize;
    let low_mark = (cfg.data_chan_capacity as f64 * cfg.target_buffer_ratio / 2.0) as usize;

    let adjusted = if buf_len > high_mark {
        ideal * 80 / 100
    } else if buf_len < low_mark && buf_len > 1 {
        ideal * 120 / 100
    } else {
        ideal
    };

    adjusted.clamp(cfg.min_interval, cfg.max_interval)
}

/// Exponential smoothing between the current and candidate interval. Both
/// inputs sit inside the clamp band, so the blend does too.
fn smooth_interval(current: Duration, adjusted: Duration, alpha: f64) -> Duration {
    current.mul_f64(1.0 - alpha) + adjusted.mul_f64(alpha)
}
