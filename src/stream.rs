//! Multipart MJPEG streaming
//!
//! Every connected client gets its own lazy, infinite stream of multipart
//! chunks. Each element pulls one frame from the session on the blocking
//! thread pool, encodes it and frames it as
//! `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
//!
//! Capture failures never end a stream: the iteration is skipped and retried
//! after a short delay, or after a longer cooldown once failures pile up. A
//! stream ends only when it is dropped (client gone) or shutdown is signalled.
//! A device read already in flight is not interrupted; its result is discarded.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::capture::CaptureError;
use crate::encoder::{self, EncodeError, EncodedFrame, DEFAULT_QUALITY};
use crate::session::CameraSession;

pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Error, Debug)]
pub enum PullError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("capture task failed: {0}")]
    Task(String),
}

/// Tuning for the per-client frame loop
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub quality: u8,
    /// Pause after a skipped iteration
    pub retry_delay: Duration,
    /// Consecutive failures before switching to `cooldown`; 0 disables
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            retry_delay: Duration::from_millis(50),
            failure_threshold: 30,
            cooldown: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamStats {
    active: AtomicUsize,
    frames_sent: AtomicU64,
    frames_skipped: AtomicU64,
    streams_opened: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStatsSnapshot {
    pub active_streams: usize,
    pub frames_sent: u64,
    pub frames_skipped: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            active_streams: self.active.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the active stream count honest however the stream ends
struct ActiveStream {
    id: u64,
    stats: Arc<StreamStats>,
}

impl ActiveStream {
    fn register(stats: Arc<StreamStats>) -> Self {
        let id = stats.streams_opened.fetch_add(1, Ordering::Relaxed);
        let active = stats.active.fetch_add(1, Ordering::Relaxed) + 1;
        info!(stream_id = id, active, "Stream client connected");
        Self { id, stats }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        let active = self.stats.active.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(stream_id = self.id, active, "Stream client disconnected");
    }
}

/// Hands out one frame stream per client, all reading from the same session
pub struct MjpegStreamer {
    session: Arc<CameraSession>,
    settings: StreamSettings,
    stats: Arc<StreamStats>,
    shutdown: watch::Receiver<bool>,
}

impl MjpegStreamer {
    pub fn new(
        session: Arc<CameraSession>,
        settings: StreamSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            session,
            settings,
            stats: Arc::new(StreamStats::default()),
            shutdown,
        }
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// A new, independent chunk stream for one client
    pub fn subscribe(&self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let state = FrameLoop {
            session: Arc::clone(&self.session),
            settings: self.settings.clone(),
            shutdown: self.shutdown.clone(),
            stats: Arc::clone(&self.stats),
            consecutive_failures: 0,
            guard: ActiveStream::register(Arc::clone(&self.stats)),
        };

        stream::unfold(state, |state| state.next_chunk())
    }
}

struct FrameLoop {
    session: Arc<CameraSession>,
    settings: StreamSettings,
    shutdown: watch::Receiver<bool>,
    stats: Arc<StreamStats>,
    consecutive_failures: u32,
    guard: ActiveStream,
}

impl FrameLoop {
    async fn next_chunk(mut self) -> Option<(Result<Bytes, Infallible>, Self)> {
        loop {
            if *self.shutdown.borrow() {
                debug!(stream_id = self.guard.id, "Shutdown signalled, ending stream");
                return None;
            }

            let session = Arc::clone(&self.session);
            let quality = self.settings.quality;
            let capture = tokio::task::spawn_blocking(move || capture_and_encode(&session, quality));

            let pulled = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return None,
                joined = capture => joined.unwrap_or_else(|e| Err(PullError::Task(e.to_string()))),
            };

            match pulled {
                Ok(frame) => {
                    if self.consecutive_failures >= self.settings.failure_threshold
                        && self.settings.failure_threshold > 0
                    {
                        info!(
                            stream_id = self.guard.id,
                            failures = self.consecutive_failures,
                            "Camera recovered"
                        );
                    }
                    self.consecutive_failures = 0;
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    return Some((Ok(format_chunk(&frame)), self));
                }
                Err(e) => {
                    let delay = self.record_failure(&e);
                    tokio::select! {
                        _ = wait_for_shutdown(&mut self.shutdown) => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Counts a skipped iteration and returns how long to wait before the next one
    fn record_failure(&mut self, err: &PullError) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);

        let threshold = self.settings.failure_threshold;
        if threshold > 0 && self.consecutive_failures == threshold {
            warn!(
                stream_id = self.guard.id,
                failures = self.consecutive_failures,
                error = %err,
                cooldown = ?self.settings.cooldown,
                "Camera keeps failing, slowing down frame polling"
            );
        } else {
            debug!(stream_id = self.guard.id, error = %err, "Skipping frame");
        }

        if threshold > 0 && self.consecutive_failures >= threshold {
            self.settings.cooldown
        } else {
            self.settings.retry_delay
        }
    }
}

fn capture_and_encode(session: &CameraSession, quality: u8) -> Result<EncodedFrame, PullError> {
    let frame = session.get_frame()?;
    Ok(encoder::encode(&frame, quality)?)
}

/// Resolves once shutdown is requested or the shutdown sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Frames one encoded image as a multipart chunk
pub fn format_chunk(frame: &EncodedFrame) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: {}\r\n\r\n",
        BOUNDARY, frame.content_type
    );
    let mut chunk = BytesMut::with_capacity(header.len() + frame.data.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(&frame.data);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}
