use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicU32, AtomicUsize};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::backend::{self, AcquiredFrame, CaptureBackend, DuplicationSource};
use crate::convert;
use crate::display::{self, Display};
use crate::frame::{Frame, FrameHandler};
use crate::pacer::FramePacer;
use crate::settings::{self, DEFAULT_ACQUIRE_TIMEOUT, Settings};
use crate::stats::{CaptureStats, FrameRateCounter};

/// Frame rate used until the first start or [`ScreenStream::set_frame_rate`].
pub const DEFAULT_FRAME_RATE: u32 = 30;

const NO_DISPLAY: usize = usize::MAX;

/// Used To Handle Capture Errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Display id {0} is outside the enumerated range")]
    InvalidDisplay(usize),
    #[error("Invalid capture settings: {0}")]
    InvalidSettings(#[from] settings::Error),
    #[error("Failed to create the graphics device: {0}")]
    DeviceCreateFailed(String),
    #[error("The output does not support desktop duplication: {0}")]
    OutputUnsupported(String),
    #[error("Failed to duplicate the output: {0}")]
    DuplicationFailed(String),
    #[error("Failed to enumerate displays: {0}")]
    Enumeration(backend::Error),
    #[error("Failed to spawn the capture thread: {0}")]
    FailedToSpawnThread(io::Error),
    #[error("Failed to join the capture thread")]
    FailedToJoinThread,
    #[error("Stop can't be called from the capture thread, use InternalCaptureControl::stop")]
    StopFromCaptureThread,
    #[error("Start can't be called from the capture thread")]
    StartFromCaptureThread,
}

impl Error {
    /// Status code reported through the C interface.
    #[must_use]
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::InvalidDisplay(_) => -1,
            Self::DeviceCreateFailed(_) => -2,
            Self::OutputUnsupported(_) => -3,
            Self::DuplicationFailed(_) => -4,
            Self::InvalidSettings(_) => -5,
            Self::FailedToSpawnThread(_) => -6,
            Self::Enumeration(_)
            | Self::FailedToJoinThread
            | Self::StopFromCaptureThread
            | Self::StartFromCaptureThread => -7,
        }
    }

    fn from_open_error(error: backend::Error) -> Self {
        match error {
            backend::Error::DeviceCreateFailed(message) => Self::DeviceCreateFailed(message),
            backend::Error::OutputUnsupported(message) => Self::OutputUnsupported(message),
            backend::Error::DuplicationFailed(message) => Self::DuplicationFailed(message),
            other => Self::DuplicationFailed(other.to_string()),
        }
    }
}

/// Lifecycle State Of A [`ScreenStream`]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum CaptureState {
    Idle,
    Running,
}

/// Why A Capture Thread Ended
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum ExitReason {
    /// [`ScreenStream::stop`] was called.
    Stopped,
    /// The frame handler called [`InternalCaptureControl::stop`].
    StoppedByHandler,
    /// The frame handler returned an error.
    HandlerError(String),
    /// The frame handler panicked.
    HandlerPanicked(String),
    /// The duplication could not produce frames anymore (device lost, access lost, ...).
    AcquisitionFatal(backend::Error),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::StoppedByHandler => write!(f, "stopped by the frame handler"),
            Self::HandlerError(message) => write!(f, "frame handler failed: {message}"),
            Self::HandlerPanicked(message) => write!(f, "frame handler panicked: {message}"),
            Self::AcquisitionFatal(error) => write!(f, "acquisition failed: {error}"),
        }
    }
}

/// Used To Stop The Capture From Inside A Frame Handler
#[derive(Clone, Debug)]
pub struct InternalCaptureControl {
    stop: Arc<AtomicBool>,
}

impl InternalCaptureControl {
    #[must_use]
    #[inline]
    pub const fn new(stop: Arc<AtomicBool>) -> Self {
        Self { stop }
    }

    /// Ends The Capture Thread After The Current Frame
    ///
    /// The engine stays [`CaptureState::Running`] until its owner calls
    /// [`ScreenStream::stop`], which then returns immediately.
    #[inline]
    pub fn stop(&self) {
        self.stop.store(true, atomic::Ordering::Release);
    }

    /// Check To See If The Handler Asked To Stop
    #[must_use]
    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(atomic::Ordering::Acquire)
    }
}

// State read by both the owner and the capture thread.
struct Shared {
    halt: AtomicBool,
    running: AtomicBool,
    worker_finished: AtomicBool,
    frame_rate: AtomicU32,
    active_display: AtomicUsize,
    buffer_len: AtomicUsize,
    worker_thread: Mutex<Option<ThreadId>>,
    exit_reason: Mutex<Option<ExitReason>>,
    stats: CaptureStats,
}

// What the capture thread hands back to `stop` so resources are released there.
struct WorkerOutcome<S> {
    source: S,
    buffer: Vec<u8>,
}

/// Display Capture Engine
///
/// Owns the enumerated display list and at most one running capture. Start, stop and
/// teardown are serialized by an internal lock, so they may be called from any thread;
/// the frame handler runs on a dedicated capture thread.
///
/// # Example
/// ```no_run
/// # #[cfg(windows)]
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use screen_stream::capture::ScreenStream;
/// use screen_stream::frame::Frame;
///
/// let stream = ScreenStream::dxgi();
/// let displays = stream.enumerate()?;
/// let primary = displays.iter().find(|d| d.is_primary()).unwrap_or(&displays[0]);
///
/// stream.start(primary.id(), 30, |frame: &Frame<'_>| {
///     println!("Captured frame: {} x {}", frame.width(), frame.height());
/// })?;
///
/// std::thread::sleep(std::time::Duration::from_secs(5));
/// stream.stop()?;
/// # Ok(())
/// # }
/// # #[cfg(not(windows))]
/// # fn main() {}
/// ```
pub struct ScreenStream<B: CaptureBackend> {
    backend: B,
    displays: Mutex<Vec<(Display, B::Output)>>,
    session: Mutex<Option<JoinHandle<WorkerOutcome<B::Source>>>>,
    shared: Arc<Shared>,
}

#[cfg(windows)]
impl ScreenStream<crate::dxgi_duplication_api::DxgiBackend> {
    /// Create An Engine Backed By The DXGI Desktop Duplication API
    #[must_use]
    pub fn dxgi() -> Self {
        Self::new(crate::dxgi_duplication_api::DxgiBackend::new())
    }
}

impl<B: CaptureBackend> ScreenStream<B> {
    /// Create An Idle Engine With An Empty Display List
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            displays: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            shared: Arc::new(Shared {
                halt: AtomicBool::new(false),
                running: AtomicBool::new(false),
                worker_finished: AtomicBool::new(false),
                frame_rate: AtomicU32::new(DEFAULT_FRAME_RATE),
                active_display: AtomicUsize::new(NO_DISPLAY),
                buffer_len: AtomicUsize::new(0),
                worker_thread: Mutex::new(None),
                exit_reason: Mutex::new(None),
                stats: CaptureStats::new(),
            }),
        }
    }

    /// Get The Backend
    #[must_use]
    #[inline]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Enumerate The Displays Attached To The Desktop
    ///
    /// Replaces the list used by [`ScreenStream::start`]. Ids are assigned in adapter
    /// then output order, counting attached outputs only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Enumeration`] when the adapters can't be listed; the display list
    /// is left empty and the call may be retried.
    pub fn enumerate(&self) -> Result<Vec<Display>, Error> {
        let mut displays = self.displays.lock();
        displays.clear();

        let outputs = self.backend.outputs().map_err(|e| {
            warn!("Failed to enumerate displays: {e}");
            Error::Enumeration(e)
        })?;
        *displays = display::from_outputs(outputs);

        for (display, _) in displays.iter() {
            debug!("{display}");
        }

        Ok(displays.iter().map(|(display, _)| display.clone()).collect())
    }

    /// Get The Displays Found By The Last Enumeration
    #[must_use]
    pub fn displays(&self) -> Vec<Display> {
        self.displays.lock().iter().map(|(display, _)| display.clone()).collect()
    }

    /// Start Capturing A Display With The Default Acquire Timeout
    ///
    /// See [`ScreenStream::start_with_settings`].
    ///
    /// # Errors
    ///
    /// See [`ScreenStream::start_with_settings`].
    pub fn start<H: FrameHandler>(&self, display_id: usize, frame_rate: u32, handler: H) -> Result<(), Error> {
        let settings = Settings { display_id, frame_rate, acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT };

        self.start_with_settings(settings, handler)
    }

    /// Start Capturing A Display On A New Capture Thread
    ///
    /// Starting while already running returns `Ok(())` without doing anything, even when
    /// a different display is requested; stop first to switch displays.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDisplay`] when the id is not in the enumerated list
    /// - [`Error::InvalidSettings`] when the frame rate is 0
    /// - [`Error::DeviceCreateFailed`], [`Error::OutputUnsupported`],
    ///   [`Error::DuplicationFailed`] when the output can't be duplicated
    /// - [`Error::FailedToSpawnThread`] when the capture thread can't be created
    /// - [`Error::StartFromCaptureThread`] when called from inside the frame handler
    ///
    /// On error the engine stays idle and holds no resources.
    pub fn start_with_settings<H: FrameHandler>(&self, settings: Settings, handler: H) -> Result<(), Error> {
        // `stop` holds the session lock while joining the capture thread.
        if self.on_capture_thread() {
            return Err(Error::StartFromCaptureThread);
        }

        let mut session = self.session.lock();
        let displays = self.displays.lock();

        let display_id = settings.display_id;
        let Some((display, output)) = displays.get(display_id) else {
            warn!("Invalid display id in start: {display_id}");
            return Err(Error::InvalidDisplay(display_id));
        };

        if session.is_some() {
            let active_display = self.shared.active_display.load(atomic::Ordering::Acquire);
            if active_display == display_id {
                debug!("Capture already running on display {display_id}");
            } else {
                warn!("Capture already running on display {active_display}, ignoring request for display {display_id}");
            }

            return Ok(());
        }

        if settings.frame_rate == 0 {
            return Err(settings::Error::InvalidFrameRate.into());
        }

        trace!("Opening duplication for {display}");
        let source = self.backend.open(output).map_err(|e| {
            warn!("Failed to open display {display_id}: {e}");
            Error::from_open_error(e)
        })?;
        let display = display.clone();
        drop(displays);

        let buffer = vec![0u8; display.frame_len()];
        let buffer_len = buffer.len();

        self.shared.halt.store(false, atomic::Ordering::Release);
        self.shared.worker_finished.store(false, atomic::Ordering::Release);
        self.shared.frame_rate.store(settings.frame_rate, atomic::Ordering::Relaxed);
        *self.shared.exit_reason.lock() = None;
        self.shared.stats.reset();

        let worker = CaptureWorker {
            source,
            buffer,
            handler,
            display,
            shared: self.shared.clone(),
            handler_halt: Arc::new(AtomicBool::new(false)),
            acquire_timeout: settings.acquire_timeout,
        };

        let thread_handle = thread::Builder::new()
            .name(format!("screen-stream-{display_id}"))
            .spawn(move || worker.run())
            .map_err(|e| {
                error!("Failed to spawn capture thread: {e}");
                Error::FailedToSpawnThread(e)
            })?;

        self.shared.active_display.store(display_id, atomic::Ordering::Release);
        self.shared.buffer_len.store(buffer_len, atomic::Ordering::Release);
        self.shared.running.store(true, atomic::Ordering::Release);
        *session = Some(thread_handle);

        info!("Capture started on display {display_id} at {} FPS", settings.frame_rate);

        Ok(())
    }

    /// Change The Target Frame Rate
    ///
    /// Takes effect at the capture thread's next pacing computation. Values of 0 or less
    /// are ignored.
    pub fn set_frame_rate(&self, frame_rate: i32) {
        match u32::try_from(frame_rate) {
            Ok(frame_rate) if frame_rate > 0 => {
                self.shared.frame_rate.store(frame_rate, atomic::Ordering::Relaxed);
                debug!("Frame rate updated: {frame_rate} FPS");
            }
            _ => debug!("Ignoring frame rate {frame_rate}"),
        }
    }

    /// Gracefully Stop The Capture Thread And Release Its Resources
    ///
    /// Blocks until the capture thread has exited. Does nothing when idle.
    ///
    /// # Errors
    ///
    /// - [`Error::StopFromCaptureThread`] when called from inside the frame handler
    /// - [`Error::FailedToJoinThread`] when the capture thread panicked outside the frame
    ///   handler; the engine is idle afterwards all the same
    pub fn stop(&self) -> Result<(), Error> {
        if self.on_capture_thread() {
            return Err(Error::StopFromCaptureThread);
        }

        let mut session = self.session.lock();
        let Some(thread_handle) = session.take() else {
            trace!("Capture is not running");
            return Ok(());
        };

        info!("Stopping capture...");
        self.shared.halt.store(true, atomic::Ordering::Release);
        thread_handle.thread().unpark();

        let outcome = thread_handle.join();

        *self.shared.worker_thread.lock() = None;
        self.shared.active_display.store(NO_DISPLAY, atomic::Ordering::Release);
        self.shared.buffer_len.store(0, atomic::Ordering::Release);
        self.shared.running.store(false, atomic::Ordering::Release);

        match outcome {
            Ok(WorkerOutcome { source, buffer }) => {
                drop(buffer);
                drop(source);
                info!("Capture stopped.");
                Ok(())
            }
            Err(_) => {
                error!("Capture thread panicked");
                Err(Error::FailedToJoinThread)
            }
        }
    }

    /// Stop Capturing And Forget The Enumerated Displays
    ///
    /// The engine must be enumerated again before the next start.
    ///
    /// # Errors
    ///
    /// See [`ScreenStream::stop`]; the display list is cleared even on error.
    pub fn teardown(&self) -> Result<(), Error> {
        let result = self.stop();
        self.displays.lock().clear();

        result
    }

    /// Get The Lifecycle State
    #[must_use]
    #[inline]
    pub fn state(&self) -> CaptureState {
        if self.is_running() { CaptureState::Running } else { CaptureState::Idle }
    }

    #[must_use]
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(atomic::Ordering::Acquire)
    }

    /// Check To See If The Capture Thread Ended On Its Own
    ///
    /// A finished engine is still [`CaptureState::Running`] until [`ScreenStream::stop`]
    /// releases its resources.
    #[must_use]
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.shared.worker_finished.load(atomic::Ordering::Acquire)
    }

    /// Get Why The Last Capture Thread Ended
    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.shared.exit_reason.lock().clone()
    }

    /// Get The Id Of The Display Being Captured
    #[must_use]
    pub fn active_display(&self) -> Option<usize> {
        match self.shared.active_display.load(atomic::Ordering::Acquire) {
            NO_DISPLAY => None,
            display_id => Some(display_id),
        }
    }

    /// Get The Current Target Frame Rate
    #[must_use]
    #[inline]
    pub fn frame_rate(&self) -> u32 {
        self.shared.frame_rate.load(atomic::Ordering::Relaxed)
    }

    /// Get The Size Of The Frame Buffer, 0 When Idle
    #[must_use]
    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len.load(atomic::Ordering::Acquire)
    }

    /// Get The Delivery Statistics Of The Current Or Last Session
    #[must_use]
    #[inline]
    pub fn stats(&self) -> &CaptureStats {
        &self.shared.stats
    }

    /// Get The Number Of Frames Delivered In The Current Or Last Session
    #[must_use]
    #[inline]
    pub fn frames_delivered(&self) -> u64 {
        self.shared.stats.frames_delivered()
    }

    /// Get The Delivered Frame Rate Over The Last Full Second
    #[must_use]
    #[inline]
    pub fn measured_frame_rate(&self) -> Option<f64> {
        self.shared.stats.measured_frame_rate()
    }

    fn on_capture_thread(&self) -> bool {
        *self.shared.worker_thread.lock() == Some(thread::current().id())
    }
}

impl<B: CaptureBackend> Drop for ScreenStream<B> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Failed to stop capture while dropping the engine: {e}");
        }
    }
}

// Everything the capture thread owns while running.
struct CaptureWorker<S, H> {
    source: S,
    buffer: Vec<u8>,
    handler: H,
    display: Display,
    shared: Arc<Shared>,
    handler_halt: Arc<AtomicBool>,
    acquire_timeout: Duration,
}

impl<S: DuplicationSource, H: FrameHandler> CaptureWorker<S, H> {
    fn run(mut self) -> WorkerOutcome<S> {
        let display_id = self.display.id();
        *self.shared.worker_thread.lock() = Some(thread::current().id());
        info!("Capture thread started for display {display_id}");

        let control = InternalCaptureControl::new(self.handler_halt.clone());
        let mut pacer = FramePacer::new();
        let mut counter = FrameRateCounter::new();
        let mut mismatch = GeometryMismatch::default();
        let mut sequence = 0u64;

        let reason = loop {
            if self.shared.halt.load(atomic::Ordering::Acquire) {
                break ExitReason::Stopped;
            }
            if control.is_stop_requested() {
                break ExitReason::StoppedByHandler;
            }

            let frame_rate = self.shared.frame_rate.load(atomic::Ordering::Relaxed);
            trace!("Capturing frame, expected interval: {:?}", FramePacer::interval(frame_rate));

            // The acquired frame is released when it goes out of scope at the end of
            // this block, whether or not it was converted and delivered.
            let handler_result = {
                let mut frame = match self.source.acquire_next_frame(self.acquire_timeout) {
                    Ok(Some(frame)) => {
                        pacer.begin_frame(Instant::now());
                        frame
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        error!("Frame acquisition failed: {e}");
                        break ExitReason::AcquisitionFatal(e);
                    }
                };

                let display = &self.display;
                let buffer = &mut self.buffer;
                let mismatch = &mut mismatch;
                let mut converted = false;
                let read = frame.read(&mut |surface| {
                    let size = (surface.width, surface.height);
                    if size != (display.width(), display.height()) {
                        if mismatch.observe(Some(size)) {
                            warn!(
                                "Frame is {}x{} but display {} is {}x{}, skipping until it matches",
                                surface.width,
                                surface.height,
                                display.id(),
                                display.width(),
                                display.height()
                            );
                        }
                        return;
                    }
                    if mismatch.observe(None) {
                        info!("Frame size matches display {} again", display.id());
                    }

                    match convert::surface_to_rgb(&surface, buffer) {
                        Ok(()) => converted = true,
                        Err(e) => warn!("Failed to convert frame: {e}"),
                    }
                });
                if let Err(e) = read {
                    warn!("Failed to read frame: {e}");
                }

                if converted {
                    let delivered = Frame::new(
                        &self.buffer,
                        self.display.width(),
                        self.display.height(),
                        display_id,
                        sequence,
                    );
                    let result =
                        panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_frame_arrived(&delivered, &control)));
                    sequence += 1;
                    counter.record(&self.shared.stats);

                    Some(result)
                } else {
                    self.shared.stats.record_dropped();

                    None
                }
            };

            match handler_result {
                Some(Ok(Err(e))) => {
                    let message = e.to_string();
                    error!("Frame handler failed: {message}");
                    break ExitReason::HandlerError(message);
                }
                Some(Err(payload)) => {
                    let message = panic_message(&*payload);
                    error!("Frame handler panicked: {message}");
                    break ExitReason::HandlerPanicked(message);
                }
                Some(Ok(Ok(()))) | None => (),
            }

            pacer.wait(
                self.shared.frame_rate.load(atomic::Ordering::Relaxed),
                &[&self.shared.halt, &*self.handler_halt],
            );
        };

        info!("Capture thread ending for display {display_id}: {reason}");
        self.handler.on_closed(&reason);
        *self.shared.exit_reason.lock() = Some(reason);
        self.shared.worker_finished.store(true, atomic::Ordering::Release);

        WorkerOutcome { source: self.source, buffer: self.buffer }
    }
}

// Remembers the last surface size that did not match the display, so a mismatch is
// logged once per change instead of once per frame.
#[derive(Default)]
struct GeometryMismatch {
    size: Option<(u32, u32)>,
}

impl GeometryMismatch {
    // Returns true when `size` differs from the previously observed one.
    fn observe(&mut self, size: Option<(u32, u32)>) -> bool {
        let changed = self.size != size;
        self.size = size;

        changed
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::frame::{OwnedFrame, frame_channel};
    use crate::testing::FakeBackend;

    const PATIENCE: Duration = Duration::from_secs(5);

    fn two_displays() -> FakeBackend {
        FakeBackend::new().with_display(0, 0, 8, 6).with_display(8, 0, 4, 2)
    }

    fn enumerated(backend: &FakeBackend) -> ScreenStream<FakeBackend> {
        let stream = ScreenStream::new(backend.clone());
        stream.enumerate().unwrap();
        stream
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < PATIENCE {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }

        condition()
    }

    fn ignore_frames(_: &Frame<'_>) {}

    struct Recorder {
        fail_on: Option<u64>,
        stop_on: Option<u64>,
        closed: Arc<Mutex<Option<ExitReason>>>,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Option<ExitReason>>>) {
            let closed = Arc::new(Mutex::new(None));
            (Self { fail_on: None, stop_on: None, closed: closed.clone() }, closed)
        }
    }

    impl FrameHandler for Recorder {
        type Error = String;

        fn on_frame_arrived(
            &mut self,
            frame: &Frame<'_>,
            capture_control: &InternalCaptureControl,
        ) -> Result<(), Self::Error> {
            if self.fail_on == Some(frame.sequence()) {
                return Err("boom".to_string());
            }
            if self.stop_on == Some(frame.sequence()) {
                capture_control.stop();
            }

            Ok(())
        }

        fn on_closed(&mut self, reason: &ExitReason) {
            *self.closed.lock() = Some(reason.clone());
        }
    }

    #[test]
    fn enumeration_is_stable() {
        let backend = two_displays().with_detached_output(1920, 1080);
        let stream = ScreenStream::new(backend);

        let first = stream.enumerate().unwrap();
        let second = stream.enumerate().unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(stream.displays(), second);
        assert!(first[0].is_primary());
        assert!(!first[1].is_primary());
    }

    #[test]
    fn failed_enumeration_is_retryable() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        backend.set_enumeration_error(Some(backend::Error::FactoryUnavailable("gone".to_string())));
        assert!(matches!(stream.enumerate(), Err(Error::Enumeration(_))));
        assert!(stream.displays().is_empty());

        backend.set_enumeration_error(None);
        assert_eq!(stream.enumerate().unwrap().len(), 2);
    }

    #[test]
    fn out_of_range_display_has_no_side_effects() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        let error = stream.start(99, 30, ignore_frames).unwrap_err();

        assert!(matches!(error, Error::InvalidDisplay(99)));
        assert_eq!(error.status_code(), -1);
        assert_eq!(stream.state(), CaptureState::Idle);
        assert_eq!(stream.buffer_len(), 0);
        assert_eq!(stream.active_display(), None);
        assert_eq!(backend.opened(), 0);
    }

    #[test]
    fn start_while_running_keeps_one_worker() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        stream.start(0, 30, ignore_frames).unwrap();
        stream.start(0, 30, ignore_frames).unwrap();
        // A different display is ignored too.
        stream.start(1, 60, ignore_frames).unwrap();

        assert_eq!(stream.state(), CaptureState::Running);
        assert_eq!(stream.active_display(), Some(0));
        assert_eq!(stream.frame_rate(), 30);
        assert_eq!(backend.opened(), 1);
        assert_eq!(backend.live_sources(), 1);

        stream.stop().unwrap();
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let stream = enumerated(&two_displays());

        stream.stop().unwrap();
        stream.stop().unwrap();

        assert_eq!(stream.state(), CaptureState::Idle);
        assert_eq!(stream.exit_reason(), None);
    }

    #[test]
    fn stop_releases_resources_and_allows_restart() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        stream.start(0, 120, ignore_frames).unwrap();
        assert_eq!(stream.buffer_len(), 8 * 6 * 3);
        assert!(wait_until(|| stream.frames_delivered() >= 2));
        stream.stop().unwrap();

        assert_eq!(stream.state(), CaptureState::Idle);
        assert_eq!(stream.buffer_len(), 0);
        assert_eq!(stream.active_display(), None);
        assert_eq!(stream.exit_reason(), Some(ExitReason::Stopped));
        assert_eq!(backend.live_sources(), 0);
        assert_eq!(backend.acquired(), backend.released());

        stream.start(1, 120, ignore_frames).unwrap();
        assert_eq!(stream.buffer_len(), 4 * 2 * 3);
        assert_eq!(stream.active_display(), Some(1));
        assert_eq!(stream.exit_reason(), None);
        stream.stop().unwrap();

        assert_eq!(backend.opened(), 2);
        assert_eq!(backend.live_sources(), 0);
    }

    #[test]
    fn delivered_frames_match_the_display() {
        let backend = FakeBackend::new().with_display(0, 0, 6, 4).with_row_padding(12);
        let stream = enumerated(&backend);
        let (handler, receiver) = frame_channel(16);

        stream.start(0, 60, handler).unwrap();
        let frames: Vec<OwnedFrame> = (0..3).map(|_| receiver.recv_timeout(PATIENCE).unwrap()).collect();
        stream.stop().unwrap();

        for (sequence, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, sequence as u64);
            assert_eq!(frame.display_id, 0);
            assert_eq!((frame.width, frame.height), (6, 4));
            assert_eq!(frame.buffer.len(), 6 * 4 * 3);
        }

        // Pixel (x, y) of frame n is R = n, G = y, B = x.
        let first = &frames[0].buffer;
        assert_eq!(&first[..6], &[0, 0, 0, 0, 0, 1]);
        let last_pixel = (3 * 6 + 5) * 3;
        assert_eq!(&frames[2].buffer[last_pixel..last_pixel + 3], &[2, 3, 5]);
    }

    #[test]
    fn open_failures_leave_the_engine_idle() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        let cases = [
            (backend::Error::DeviceCreateFailed("no device".to_string()), -2),
            (backend::Error::OutputUnsupported("no output1".to_string()), -3),
            (backend::Error::DuplicationFailed("in use".to_string()), -4),
        ];
        for (error, status_code) in cases {
            backend.set_open_error(Some(error));
            let error = stream.start(0, 30, ignore_frames).unwrap_err();

            assert_eq!(error.status_code(), status_code);
            assert_eq!(stream.state(), CaptureState::Idle);
            assert_eq!(stream.buffer_len(), 0);
        }
        assert_eq!(backend.live_sources(), 0);

        backend.set_open_error(None);
        stream.start(0, 30, ignore_frames).unwrap();
        stream.stop().unwrap();
    }

    #[test]
    fn zero_frame_rate_is_rejected() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        let error = stream.start(0, 0, ignore_frames).unwrap_err();

        assert!(matches!(error, Error::InvalidSettings(settings::Error::InvalidFrameRate)));
        assert_eq!(error.status_code(), -5);
        assert_eq!(stream.state(), CaptureState::Idle);
        assert_eq!(backend.opened(), 0);
    }

    #[test]
    fn non_positive_frame_rates_are_ignored() {
        let stream = enumerated(&two_displays());
        assert_eq!(stream.frame_rate(), DEFAULT_FRAME_RATE);

        stream.set_frame_rate(0);
        stream.set_frame_rate(-5);
        assert_eq!(stream.frame_rate(), DEFAULT_FRAME_RATE);

        stream.set_frame_rate(60);
        assert_eq!(stream.frame_rate(), 60);
    }

    #[test]
    fn handler_error_ends_the_capture_after_release() {
        let backend = two_displays();
        let stream = enumerated(&backend);
        let (mut handler, closed) = Recorder::new();
        handler.fail_on = Some(2);

        stream.start(0, 240, handler).unwrap();
        assert!(wait_until(|| stream.is_finished()));

        let reason = ExitReason::HandlerError("boom".to_string());
        assert_eq!(stream.exit_reason(), Some(reason.clone()));
        assert_eq!(*closed.lock(), Some(reason));
        assert_eq!(stream.frames_delivered(), 3);
        assert_eq!(backend.acquired(), backend.released());
        // The owner still has to stop to release the duplication.
        assert_eq!(stream.state(), CaptureState::Running);
        assert_eq!(backend.live_sources(), 1);

        stream.stop().unwrap();
        assert_eq!(stream.state(), CaptureState::Idle);
        assert_eq!(backend.live_sources(), 0);
    }

    #[test]
    fn handler_can_stop_the_capture() {
        let backend = two_displays();
        let stream = enumerated(&backend);
        let (mut handler, closed) = Recorder::new();
        handler.stop_on = Some(0);

        stream.start(0, 30, handler).unwrap();
        assert!(wait_until(|| stream.is_finished()));

        assert_eq!(stream.exit_reason(), Some(ExitReason::StoppedByHandler));
        assert_eq!(*closed.lock(), Some(ExitReason::StoppedByHandler));
        assert_eq!(stream.frames_delivered(), 1);
        stream.stop().unwrap();
    }

    #[test]
    fn fatal_acquisition_is_reported() {
        let backend = two_displays();
        backend.fail_acquisition_after(2, backend::Error::AccessLost);
        let stream = enumerated(&backend);
        let (handler, closed) = Recorder::new();

        stream.start(0, 240, handler).unwrap();
        assert!(wait_until(|| stream.is_finished()));

        let reason = ExitReason::AcquisitionFatal(backend::Error::AccessLost);
        assert_eq!(stream.exit_reason(), Some(reason.clone()));
        assert_eq!(*closed.lock(), Some(reason));
        assert_eq!(stream.frames_delivered(), 2);

        stream.stop().unwrap();
        assert_eq!(backend.live_sources(), 0);
    }

    struct StopsItself {
        stream: Arc<ScreenStream<FakeBackend>>,
        results: mpsc::Sender<bool>,
    }

    impl FrameHandler for StopsItself {
        type Error = std::convert::Infallible;

        fn on_frame_arrived(
            &mut self,
            _: &Frame<'_>,
            capture_control: &InternalCaptureControl,
        ) -> Result<(), Self::Error> {
            let rejected = matches!(self.stream.stop(), Err(Error::StopFromCaptureThread));
            let _ = self.results.send(rejected);
            capture_control.stop();

            Ok(())
        }
    }

    #[test]
    fn stop_from_the_capture_thread_is_rejected() {
        let stream = Arc::new(enumerated(&two_displays()));
        let (results, receiver) = mpsc::channel();

        stream.start(0, 30, StopsItself { stream: stream.clone(), results }).unwrap();

        assert!(receiver.recv_timeout(PATIENCE).unwrap());
        assert!(wait_until(|| stream.is_finished()));
        stream.stop().unwrap();
        assert_eq!(stream.state(), CaptureState::Idle);
    }

    #[test]
    fn mismatched_surfaces_are_skipped_but_released() {
        let backend = FakeBackend::new().with_display(0, 0, 4, 2).with_surface_size(3, 3);
        let stream = enumerated(&backend);

        stream.start(0, 240, ignore_frames).unwrap();
        assert!(wait_until(|| stream.stats().frames_dropped() >= 3));
        stream.stop().unwrap();

        assert_eq!(stream.frames_delivered(), 0);
        assert_eq!(backend.acquired(), backend.released());
    }

    #[test]
    fn read_failures_are_not_fatal() {
        let backend = two_displays();
        backend.set_read_error(Some(backend::Error::MapFailed("busy".to_string())));
        let stream = enumerated(&backend);

        stream.start(0, 240, ignore_frames).unwrap();
        assert!(wait_until(|| stream.stats().frames_dropped() >= 2));
        backend.set_read_error(None);
        assert!(wait_until(|| stream.frames_delivered() >= 2));
        assert!(!stream.is_finished());

        stream.stop().unwrap();
        assert_eq!(backend.acquired(), backend.released());
    }

    #[test]
    fn timeouts_are_retried() {
        let backend = two_displays().with_timeouts_per_frame(2);
        let stream = enumerated(&backend);
        let settings = Settings::new(0, 240).unwrap().with_acquire_timeout(Duration::from_millis(5)).unwrap();

        stream.start_with_settings(settings, ignore_frames).unwrap();
        assert!(wait_until(|| stream.frames_delivered() >= 3));
        assert!(!stream.is_finished());

        stream.stop().unwrap();
        assert_eq!(stream.exit_reason(), Some(ExitReason::Stopped));
    }

    #[test]
    fn delivers_close_to_the_target_rate() {
        let stream = enumerated(&two_displays());
        let start = Instant::now();

        stream.start(0, 30, ignore_frames).unwrap();
        thread::sleep(Duration::from_millis(1500));
        stream.stop().unwrap();

        let expected = start.elapsed().as_secs_f64() * 30.0;
        let delivered = stream.frames_delivered() as f64;
        assert!(delivered >= expected * 0.85, "{delivered} frames, expected about {expected}");
        assert!(delivered <= expected * 1.15 + 1.0, "{delivered} frames, expected about {expected}");
        assert!(stream.measured_frame_rate().is_some());
    }

    #[test]
    fn frame_rate_changes_apply_within_a_period() {
        let stream = enumerated(&two_displays());
        let timestamps = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let timestamps = timestamps.clone();
            move |_: &Frame<'_>| timestamps.lock().push(Instant::now())
        };

        stream.start(0, 10, handler).unwrap();
        assert!(wait_until(|| stream.frames_delivered() >= 3));
        let before_change = stream.frames_delivered() as usize;
        stream.set_frame_rate(50);
        thread::sleep(Duration::from_millis(500));
        stream.stop().unwrap();

        let timestamps = timestamps.lock();
        let intervals: Vec<Duration> = timestamps.windows(2).map(|pair| pair[1] - pair[0]).collect();

        assert!(intervals[..before_change - 1].iter().all(|interval| *interval >= Duration::from_millis(90)));
        let tail = &intervals[intervals.len() - 5..];
        let average = tail.iter().sum::<Duration>() / 5;
        assert!(average < Duration::from_millis(45), "average interval {average:?}");
    }

    #[test]
    fn teardown_requires_enumeration() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        stream.start(0, 30, ignore_frames).unwrap();
        stream.teardown().unwrap();

        assert_eq!(stream.state(), CaptureState::Idle);
        assert!(stream.displays().is_empty());
        assert!(matches!(stream.start(0, 30, ignore_frames), Err(Error::InvalidDisplay(0))));

        stream.enumerate().unwrap();
        stream.start(0, 30, ignore_frames).unwrap();
        stream.stop().unwrap();
    }

    #[test]
    fn dropping_a_running_engine_releases_the_duplication() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        stream.start(1, 30, ignore_frames).unwrap();
        assert_eq!(backend.live_sources(), 1);
        drop(stream);

        assert_eq!(backend.live_sources(), 0);
    }

    struct StartsItself {
        stream: Arc<ScreenStream<FakeBackend>>,
        results: mpsc::Sender<bool>,
    }

    impl FrameHandler for StartsItself {
        type Error = std::convert::Infallible;

        fn on_frame_arrived(&mut self, _: &Frame<'_>, _: &InternalCaptureControl) -> Result<(), Self::Error> {
            let rejected = matches!(self.stream.start(0, 30, ignore_frames), Err(Error::StartFromCaptureThread));
            let _ = self.results.send(rejected);

            Ok(())
        }
    }

    #[test]
    fn start_from_the_capture_thread_does_not_block_stop() {
        let backend = two_displays();
        let stream = Arc::new(enumerated(&backend));
        let (results, receiver) = mpsc::channel();

        stream.start(0, 240, StartsItself { stream: stream.clone(), results }).unwrap();
        assert!(receiver.recv_timeout(PATIENCE).unwrap());

        let stopper = {
            let stream = stream.clone();
            thread::spawn(move || stream.stop())
        };
        assert!(wait_until(|| stopper.is_finished()));
        stopper.join().unwrap().unwrap();

        assert_eq!(stream.state(), CaptureState::Idle);
        assert_eq!(backend.live_sources(), 0);
        assert_eq!(Error::StartFromCaptureThread.status_code(), -7);
    }

    fn panics(_: &Frame<'_>) {
        panic!("handler bug");
    }

    #[test]
    fn handler_panic_is_reported() {
        let backend = two_displays();
        let stream = enumerated(&backend);

        stream.start(0, 240, panics).unwrap();
        assert!(wait_until(|| stream.is_finished()));

        assert_eq!(stream.exit_reason(), Some(ExitReason::HandlerPanicked("handler bug".to_string())));
        assert_eq!(stream.frames_delivered(), 1);
        assert_eq!(backend.acquired(), backend.released());

        stream.stop().unwrap();
        assert_eq!(stream.state(), CaptureState::Idle);
        assert_eq!(backend.live_sources(), 0);
    }

    #[test]
    fn geometry_mismatch_is_reported_once_per_change() {
        let mut mismatch = GeometryMismatch::default();

        assert!(!mismatch.observe(None));
        assert!(mismatch.observe(Some((3, 3))));
        assert!(!mismatch.observe(Some((3, 3))));
        assert!(mismatch.observe(Some((2, 4))));
        assert!(mismatch.observe(None));
        assert!(!mismatch.observe(None));
    }

    #[test]
    fn slow_handler_does_not_cause_a_burst() {
        let stream = enumerated(&two_displays());
        let timestamps = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let timestamps = timestamps.clone();
            move |frame: &Frame<'_>| {
                timestamps.lock().push(Instant::now());
                if frame.sequence() < 3 {
                    thread::sleep(Duration::from_millis(60));
                }
            }
        };

        stream.start(0, 50, handler).unwrap();
        assert!(wait_until(|| stream.frames_delivered() >= 10));
        stream.stop().unwrap();

        let timestamps = timestamps.lock();
        let intervals: Vec<Duration> = timestamps.windows(2).map(|pair| pair[1] - pair[0]).collect();

        assert!(intervals[..3].iter().all(|interval| *interval >= Duration::from_millis(60)), "{intervals:?}");
        // Once the handler is fast again, frames keep their spacing instead of catching up.
        assert!(intervals[3..].iter().all(|interval| *interval >= Duration::from_millis(10)), "{intervals:?}");
    }
}
