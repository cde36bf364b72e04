//! Camera session: which backend is active and its single device handle
//!
//! Frame reads hold the read side of the lock so any number of stream loops can
//! pull frames at once; initialize, switch and release take the write side, so a
//! handle is never read while it is being closed or replaced.
//!
//! Status queries never touch that lock. Every transition publishes a
//! [`SessionStatus`] snapshot under a separate mutex before the write lock is
//! released, so status endpoints answer immediately even while a device is
//! being opened or a frame read is stuck in the driver.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::capture::{
    BackendOpener, CaptureBackend, CaptureBackendKind, CaptureConfig, CaptureError, RawFrame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Uninitialized,
    Active,
    Released,
}

struct SessionState {
    phase: SessionPhase,
    requested: CaptureBackendKind,
    handle: Option<Box<dyn CaptureBackend>>,
    last_error: Option<String>,
}

impl SessionState {
    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            phase: self.phase,
            requested: self.requested,
            active: self.handle.as_ref().map(|h| h.kind()),
            last_error: self.last_error.clone(),
        }
    }

    fn close_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!(backend = %handle.kind(), "Closing camera");
            handle.close();
        }
    }
}

/// Point-in-time view of the session for status endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub requested: CaptureBackendKind,
    pub active: Option<CaptureBackendKind>,
    pub last_error: Option<String>,
}

/// Owns the active capture backend
pub struct CameraSession {
    config: CaptureConfig,
    opener: Arc<dyn BackendOpener>,
    state: RwLock<SessionState>,
    status: Mutex<SessionStatus>,
}

impl CameraSession {
    pub fn new(config: CaptureConfig, opener: Arc<dyn BackendOpener>) -> Self {
        let state = SessionState {
            phase: SessionPhase::Uninitialized,
            requested: config.backend,
            handle: None,
            last_error: None,
        };
        Self {
            config,
            opener,
            status: Mutex::new(state.snapshot()),
            state: RwLock::new(state),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Opens the configured backend, falling back to the other one once.
    ///
    /// Returns the backend that ended up active, or `None` when both failed; the
    /// session then stays uninitialized and frame reads report `NotInitialized`.
    pub fn initialize(&self) -> Option<CaptureBackendKind> {
        let mut state = self.state.write();
        if state.phase == SessionPhase::Released {
            warn!("initialize called on a released session");
            return None;
        }
        let active = self.open_with_fallback(&mut state);
        self.publish(&state);
        active
    }

    fn open_with_fallback(&self, state: &mut SessionState) -> Option<CaptureBackendKind> {
        state.close_handle();

        let primary = self.config.backend;
        let first_err = match self.opener.open(primary, &self.config) {
            Ok(handle) => {
                info!(backend = %primary, "Camera initialized");
                Self::activate(state, primary, handle);
                return Some(primary);
            }
            Err(e) => e,
        };

        let fallback = primary.other();
        warn!(backend = %primary, error = %first_err, fallback = %fallback, "Camera failed to open, trying fallback");

        match self.opener.open(fallback, &self.config) {
            Ok(handle) => {
                info!(backend = %fallback, "Camera initialized with fallback backend");
                Self::activate(state, fallback, handle);
                Some(fallback)
            }
            Err(second_err) => {
                error!(
                    primary = %primary,
                    primary_error = %first_err,
                    fallback = %fallback,
                    fallback_error = %second_err,
                    "No camera backend could be opened"
                );
                state.phase = SessionPhase::Uninitialized;
                state.last_error = Some(format!(
                    "{}: {}; {}: {}",
                    primary, first_err, fallback, second_err
                ));
                None
            }
        }
    }

    /// Reads one frame from the active backend. Blocks on device I/O.
    pub fn get_frame(&self) -> Result<RawFrame, CaptureError> {
        let state = self.state.read();
        match &state.handle {
            Some(handle) => handle.read_frame(),
            None => Err(CaptureError::NotInitialized),
        }
    }

    /// Replaces the active backend with the one named by `source`.
    ///
    /// The current handle is closed before the new one is opened, whether or not
    /// the open succeeds. A failed open leaves the session uninitialized and is
    /// returned as-is; there is no fallback here. Returns `Ok(false)` without
    /// doing anything once the session has been released.
    pub fn switch(&self, source: &str) -> Result<bool, CaptureError> {
        let kind: CaptureBackendKind = source.parse()?;

        let mut state = self.state.write();
        if state.phase == SessionPhase::Released {
            warn!(backend = %kind, "Switch requested after release, ignoring");
            return Ok(false);
        }

        let result = self.replace_handle(&mut state, kind);
        self.publish(&state);
        result
    }

    fn replace_handle(
        &self,
        state: &mut SessionState,
        kind: CaptureBackendKind,
    ) -> Result<bool, CaptureError> {
        info!(from = ?state.handle.as_ref().map(|h| h.kind()), to = %kind, "Switching camera");
        state.close_handle();
        state.requested = kind;

        match self.opener.open(kind, &self.config) {
            Ok(handle) => {
                Self::activate(state, kind, handle);
                info!(backend = %kind, "Camera switched");
                Ok(true)
            }
            Err(e) => {
                error!(backend = %kind, error = %e, "Camera switch failed");
                state.phase = SessionPhase::Uninitialized;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Closes the active handle for good. Later switches are ignored.
    pub fn release(&self) {
        let mut state = self.state.write();
        if state.phase == SessionPhase::Released {
            return;
        }
        state.close_handle();
        state.phase = SessionPhase::Released;
        self.publish(&state);
        info!("Camera session released");
    }

    /// State as of the last completed transition. Never waits on device I/O.
    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    fn publish(&self, state: &SessionState) {
        *self.status.lock() = state.snapshot();
    }

    fn activate(
        state: &mut SessionState,
        kind: CaptureBackendKind,
        handle: Box<dyn CaptureBackend>,
    ) {
        state.requested = kind;
        state.handle = Some(handle);
        state.phase = SessionPhase::Active;
        state.last_error = None;
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.state.get_mut().close_handle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks how many handles are open and fails on demand
    #[derive(Default)]
    struct CountingOpener {
        open_handles: Arc<AtomicUsize>,
        max_open: Arc<AtomicUsize>,
        failing: Mutex<HashSet<CaptureBackendKind>>,
        opens: AtomicUsize,
    }

    impl CountingOpener {
        fn failing(kinds: &[CaptureBackendKind]) -> Self {
            let opener = Self::default();
            opener.failing.lock().extend(kinds.iter().copied());
            opener
        }

        fn open_count(&self) -> usize {
            self.open_handles.load(Ordering::SeqCst)
        }
    }

    struct CountingHandle {
        kind: CaptureBackendKind,
        open_handles: Arc<AtomicUsize>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl CaptureBackend for CountingHandle {
        fn kind(&self) -> CaptureBackendKind {
            self.kind
        }

        fn read_frame(&self) -> Result<RawFrame, CaptureError> {
            Ok(RawFrame::solid(2, 2, [1, 2, 3]))
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.open_handles.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl Drop for CountingHandle {
        fn drop(&mut self) {
            self.close();
        }
    }

    impl BackendOpener for CountingOpener {
        fn open(
            &self,
            kind: CaptureBackendKind,
            _config: &CaptureConfig,
        ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(&kind) {
                return Err(CaptureError::DeviceUnavailable(format!("{} mocked absent", kind)));
            }
            let now_open = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open.fetch_max(now_open, Ordering::SeqCst);
            Ok(Box::new(CountingHandle {
                kind,
                open_handles: Arc::clone(&self.open_handles),
                closed: Default::default(),
            }))
        }
    }

    fn session_with(opener: Arc<CountingOpener>) -> CameraSession {
        CameraSession::new(CaptureConfig::default(), opener)
    }

    #[test]
    fn test_get_frame_before_initialize() {
        let session = session_with(Arc::new(CountingOpener::default()));
        assert_matches!(session.get_frame(), Err(CaptureError::NotInitialized));
        assert_eq!(session.status().phase, SessionPhase::Uninitialized);
    }

    #[test]
    fn test_initialize_uses_configured_backend() {
        let opener = Arc::new(CountingOpener::default());
        let session = session_with(Arc::clone(&opener));

        assert_eq!(session.initialize(), Some(CaptureBackendKind::GenericDevice));
        assert!(session.get_frame().is_ok());
        assert_eq!(opener.open_count(), 1);
    }

    #[test]
    fn test_initialize_falls_back_once() {
        let opener = Arc::new(CountingOpener::failing(&[CaptureBackendKind::GenericDevice]));
        let session = session_with(Arc::clone(&opener));

        assert_eq!(session.initialize(), Some(CaptureBackendKind::ModuleCamera));
        let status = session.status();
        assert_eq!(status.active, Some(CaptureBackendKind::ModuleCamera));
        assert_eq!(status.requested, CaptureBackendKind::ModuleCamera);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_initialize_both_fail() {
        let opener = Arc::new(CountingOpener::failing(&[
            CaptureBackendKind::GenericDevice,
            CaptureBackendKind::ModuleCamera,
        ]));
        let session = session_with(Arc::clone(&opener));

        assert_eq!(session.initialize(), None);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_matches!(session.get_frame(), Err(CaptureError::NotInitialized));

        let status = session.status();
        assert_eq!(status.phase, SessionPhase::Uninitialized);
        assert_eq!(status.active, None);
        assert!(status.last_error.unwrap().contains("mocked absent"));
    }

    #[test]
    fn test_invalid_switch_leaves_state_untouched() {
        let opener = Arc::new(CountingOpener::default());
        let session = session_with(Arc::clone(&opener));
        session.initialize();
        let before = session.status();

        assert_matches!(
            session.switch("webcam9000"),
            Err(CaptureError::InvalidBackend(_))
        );
        assert_eq!(session.status(), before);
        assert_eq!(opener.open_count(), 1);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_switch_does_not_fall_back() {
        let opener = Arc::new(CountingOpener::failing(&[CaptureBackendKind::ModuleCamera]));
        let session = session_with(Arc::clone(&opener));
        session.initialize();

        assert_matches!(
            session.switch("libcamera"),
            Err(CaptureError::DeviceUnavailable(_))
        );

        let status = session.status();
        assert_eq!(status.phase, SessionPhase::Uninitialized);
        assert_eq!(status.active, None);
        assert_eq!(status.requested, CaptureBackendKind::ModuleCamera);
        assert_eq!(opener.open_count(), 0, "old handle must be closed");
        assert_matches!(session.get_frame(), Err(CaptureError::NotInitialized));
    }

    #[test]
    fn test_switch_sequence_keeps_one_handle() {
        let opener = Arc::new(CountingOpener::default());
        let session = session_with(Arc::clone(&opener));
        session.initialize();

        for source in ["libcamera", "opencv", "opencv", "libcamera", "opencv"] {
            assert_eq!(session.switch(source).unwrap(), true);
            assert_eq!(opener.open_count(), 1);
        }
        assert_eq!(opener.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(session.status().active, Some(CaptureBackendKind::GenericDevice));
    }

    #[test]
    fn test_concurrent_switches_keep_one_handle() {
        let opener = Arc::new(CountingOpener::default());
        let session = Arc::new(session_with(Arc::clone(&opener)));
        session.initialize();

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        if (i + j) % 3 == 0 {
                            let source = if j % 2 == 0 { "opencv" } else { "libcamera" };
                            session.switch(source).unwrap();
                        } else {
                            session.get_frame().unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(opener.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(opener.open_count(), 1);
    }

    #[test]
    fn test_release_closes_and_blocks_switch() {
        let opener = Arc::new(CountingOpener::default());
        let session = session_with(Arc::clone(&opener));
        session.initialize();

        session.release();
        session.release();
        assert_eq!(opener.open_count(), 0);
        assert_eq!(session.status().phase, SessionPhase::Released);
        assert_matches!(session.get_frame(), Err(CaptureError::NotInitialized));
        assert_eq!(session.switch("libcamera").unwrap(), false);
        assert_eq!(opener.open_count(), 0);
    }

    #[test]
    fn test_drop_closes_handle() {
        let opener = Arc::new(CountingOpener::default());
        {
            let session = session_with(Arc::clone(&opener));
            session.initialize();
            assert_eq!(opener.open_count(), 1);
        }
        assert_eq!(opener.open_count(), 0);
    }

    /// Opener that parks inside `open` until told to continue
    struct GatedOpener {
        entered: std::sync::mpsc::SyncSender<()>,
        proceed: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl BackendOpener for GatedOpener {
        fn open(
            &self,
            kind: CaptureBackendKind,
            _config: &CaptureConfig,
        ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
            let _ = self.entered.send(());
            let _ = self.proceed.lock().recv();
            Ok(Box::new(CountingHandle {
                kind,
                open_handles: Arc::new(AtomicUsize::new(1)),
                closed: Default::default(),
            }))
        }
    }

    #[test]
    fn test_status_does_not_wait_for_device_open() {
        use std::sync::mpsc;
        use std::time::Duration;

        let (entered_tx, entered_rx) = mpsc::sync_channel(4);
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let opener = GatedOpener {
            entered: entered_tx,
            proceed: Mutex::new(proceed_rx),
        };
        let session = Arc::new(CameraSession::new(CaptureConfig::default(), Arc::new(opener)));

        let init = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.initialize())
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // initialize holds the write lock while parked in open
        let (status_tx, status_rx) = mpsc::channel();
        {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                let _ = status_tx.send(session.status());
            });
        }
        let during = status_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("status answered while the device was opening");
        assert_eq!(during.phase, SessionPhase::Uninitialized);
        assert_eq!(during.active, None);

        proceed_tx.send(()).unwrap();
        assert_eq!(init.join().unwrap(), Some(CaptureBackendKind::GenericDevice));
        assert_eq!(session.status().phase, SessionPhase::Active);
    }
}
