#![allow(dead_code)]

use axum::body::Body;
use axum::http::Request;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use rpi_mjpeg_streamer::{
    AppState, BackendOpener, CameraSession, CaptureBackend, CaptureBackendKind, CaptureConfig,
    CaptureError, Config, MjpegStreamer, RawFrame, StreamSettings,
};

pub const FRAME_WIDTH: u32 = 32;
pub const FRAME_HEIGHT: u32 = 24;

#[derive(Debug, Clone, Copy)]
pub enum FrameScript {
    /// Every read succeeds with a different solid color
    Distinct,
    /// Reads alternate between success and `FrameReadFailed`
    Alternating,
}

/// Color of the n-th successful frame in a `Distinct` script
pub fn frame_color(n: u64) -> [u8; 3] {
    let step = (n % 5) as u8 * 50;
    [step, 255 - step, 128]
}

/// Backend opener that never touches hardware and counts open handles
pub struct MockOpener {
    available: HashSet<CaptureBackendKind>,
    script: FrameScript,
    open_handles: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    open_delay_ms: AtomicU64,
}

impl MockOpener {
    pub fn new(available: &[CaptureBackendKind], script: FrameScript) -> Self {
        Self {
            available: available.iter().copied().collect(),
            script,
            open_handles: Arc::default(),
            max_open: Arc::default(),
            open_delay_ms: AtomicU64::new(0),
        }
    }

    /// Makes every later `open` block for `delay`, like a slow camera start
    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

impl BackendOpener for MockOpener {
    fn open(
        &self,
        kind: CaptureBackendKind,
        _config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if !self.available.contains(&kind) {
            return Err(CaptureError::DeviceUnavailable(format!("{} mocked absent", kind)));
        }
        let open = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MockCamera {
            kind,
            script: self.script,
            reads: AtomicU64::new(0),
            open_handles: Arc::clone(&self.open_handles),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockCamera {
    kind: CaptureBackendKind,
    script: FrameScript,
    reads: AtomicU64,
    open_handles: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl CaptureBackend for MockCamera {
    fn kind(&self) -> CaptureBackendKind {
        self.kind
    }

    fn read_frame(&self) -> Result<RawFrame, CaptureError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::FrameReadFailed("read after close".into()));
        }
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        match self.script {
            FrameScript::Distinct => Ok(RawFrame::solid(FRAME_WIDTH, FRAME_HEIGHT, frame_color(n))),
            FrameScript::Alternating if n % 2 == 1 => {
                Err(CaptureError::FrameReadFailed("mocked glitch".into()))
            }
            FrameScript::Alternating => Ok(RawFrame::solid(FRAME_WIDTH, FRAME_HEIGHT, [90, 90, 90])),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn fast_settings() -> StreamSettings {
    StreamSettings {
        quality: 80,
        retry_delay: Duration::from_millis(2),
        failure_threshold: 0,
        cooldown: Duration::from_millis(2),
    }
}

pub struct Harness {
    pub state: AppState,
    pub session: Arc<CameraSession>,
    pub streamer: Arc<MjpegStreamer>,
    pub opener: Arc<MockOpener>,
    pub shutdown: watch::Sender<bool>,
}

/// Session wired to `opener` and initialized the way the binary does it
pub fn harness(config: Config, opener: MockOpener) -> Harness {
    let opener = Arc::new(opener);
    let session = Arc::new(CameraSession::new(
        config.capture_config(),
        Arc::clone(&opener) as Arc<dyn BackendOpener>,
    ));
    session.initialize();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let streamer = Arc::new(MjpegStreamer::new(
        Arc::clone(&session),
        fast_settings(),
        shutdown_rx,
    ));
    let state = AppState::new(Arc::new(config), Arc::clone(&session), Arc::clone(&streamer));

    Harness {
        state,
        session,
        streamer,
        opener,
        shutdown,
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}
