//! C interface to a process-wide [`ScreenStream`] engine.
//!
//! Exposes `GetActiveDisplays`, `StartCapture`, `SetFrameRate`, `StopCapture` and
//! `Cleanup` with the `system` calling convention. The exported functions only exist on
//! Windows; the helpers they are built from are generic over the capture backend.
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![allow(clippy::redundant_pub_crate)]

use std::convert::Infallible;
use std::ffi::{c_char, c_void};

use log::warn;
use screen_stream::backend::CaptureBackend;
use screen_stream::capture::{InternalCaptureControl, ScreenStream};
use screen_stream::display::Display;
use screen_stream::frame::{Frame, FrameHandler};

/// Size of [`DisplayInfo::name`], NUL terminator included.
pub const NAME_CAPACITY: usize = 128;

/// Returned by `StartCapture` on success.
pub const STATUS_OK: i32 = 0;

/// Display Descriptor Written By `GetActiveDisplays`
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DisplayInfo {
    pub id: i32,
    pub name: [c_char; NAME_CAPACITY],
    pub width: i32,
    pub height: i32,
    pub is_primary: bool,
    pub dpi_x: f32,
    pub dpi_y: f32,
    pub left: i32,
    pub top: i32,
}

impl DisplayInfo {
    #[must_use]
    pub fn from_display(display: &Display) -> Self {
        let mut name = [0; NAME_CAPACITY];
        write_name(&mut name, display.name());

        Self {
            id: i32::try_from(display.id()).unwrap_or(i32::MAX),
            name,
            width: i32::try_from(display.width()).unwrap_or(i32::MAX),
            height: i32::try_from(display.height()).unwrap_or(i32::MAX),
            is_primary: display.is_primary(),
            dpi_x: display.dpi_x(),
            dpi_y: display.dpi_y(),
            left: display.left(),
            top: display.top(),
        }
    }
}

impl Default for DisplayInfo {
    fn default() -> Self {
        Self {
            id: 0,
            name: [0; NAME_CAPACITY],
            width: 0,
            height: 0,
            is_primary: false,
            dpi_x: 0.0,
            dpi_y: 0.0,
            left: 0,
            top: 0,
        }
    }
}

/// Copies at most `NAME_CAPACITY - 1` bytes of `name` and NUL-terminates.
pub fn write_name(target: &mut [c_char; NAME_CAPACITY], name: &str) {
    let len = name.len().min(NAME_CAPACITY - 1);

    for (target, byte) in target.iter_mut().zip(&name.as_bytes()[..len]) {
        *target = *byte as c_char;
    }
    target[len..].fill(0);
}

/// Called On The Capture Thread With Packed RGB Pixels Valid Only During The Call
pub type CaptureFrameCallback =
    Option<unsafe extern "C" fn(pixels: *const u8, width: i32, height: i32, context: *mut c_void)>;

/// To Send The Caller's Context Pointer To The Capture Thread
struct SendPtr<T>(*mut T);

unsafe impl<T> Send for SendPtr<T> {}

/// Forwards Frames To A C Callback
pub struct RawCallbackHandler {
    callback: CaptureFrameCallback,
    context: SendPtr<c_void>,
}

impl RawCallbackHandler {
    /// # Safety
    ///
    /// `callback` must be safe to call from another thread with `context` until the
    /// capture is stopped.
    #[must_use]
    pub const unsafe fn new(callback: CaptureFrameCallback, context: *mut c_void) -> Self {
        Self { callback, context: SendPtr(context) }
    }
}

impl FrameHandler for RawCallbackHandler {
    type Error = Infallible;

    fn on_frame_arrived(&mut self, frame: &Frame<'_>, _: &InternalCaptureControl) -> Result<(), Self::Error> {
        if let Some(callback) = self.callback {
            let width = i32::try_from(frame.width()).unwrap_or(i32::MAX);
            let height = i32::try_from(frame.height()).unwrap_or(i32::MAX);

            // SAFETY: Guaranteed by the caller of `RawCallbackHandler::new`.
            unsafe { callback(frame.buffer().as_ptr(), width, height, self.context.0) };
        }

        Ok(())
    }
}

/// Enumerates, Writes Up To `infos.len()` Descriptors, And Returns The Total Count
pub fn active_displays<B: CaptureBackend>(stream: &ScreenStream<B>, infos: &mut [DisplayInfo]) -> usize {
    let displays = match stream.enumerate() {
        Ok(displays) => displays,
        Err(e) => {
            warn!("{e}");
            return 0;
        }
    };

    for (info, display) in infos.iter_mut().zip(&displays) {
        *info = DisplayInfo::from_display(display);
    }

    displays.len()
}

/// Starts A Capture And Maps The Outcome To A Status Code
///
/// `0` on success; `-1` invalid display id, `-2` device creation failed, `-3` output
/// not duplicable, `-4` duplication failed, `-5` invalid frame rate, `-6` capture thread
/// not spawned, `-7` anything else.
pub fn start_capture<B: CaptureBackend, H: FrameHandler>(
    stream: &ScreenStream<B>,
    display_id: i32,
    frame_rate: i32,
    handler: H,
) -> i32 {
    let Ok(display_id) = usize::try_from(display_id) else {
        warn!("Invalid display id in start: {display_id}");
        return screen_stream::capture::Error::InvalidDisplay(usize::MAX).status_code();
    };
    // Negative rates are rejected like 0, after the display id check.
    let frame_rate = u32::try_from(frame_rate).unwrap_or(0);

    match stream.start(display_id, frame_rate, handler) {
        Ok(()) => STATUS_OK,
        Err(e) => {
            warn!("Failed to start capture: {e}");
            e.status_code()
        }
    }
}

#[cfg(windows)]
mod exports {
    use std::ffi::c_void;
    use std::slice;
    use std::sync::LazyLock;

    use log::warn;
    use screen_stream::capture::ScreenStream;
    use screen_stream::dxgi_duplication_api::DxgiBackend;

    use super::{CaptureFrameCallback, DisplayInfo, RawCallbackHandler, active_displays, start_capture};

    static ENGINE: LazyLock<ScreenStream<DxgiBackend>> = LazyLock::new(ScreenStream::dxgi);

    /// Enumerates the displays and returns how many there are.
    ///
    /// # Safety
    ///
    /// `infos` must be null or point to `max_count` writable `DisplayInfo` values.
    #[unsafe(no_mangle)]
    pub unsafe extern "system" fn GetActiveDisplays(infos: *mut DisplayInfo, max_count: i32) -> i32 {
        let infos: &mut [DisplayInfo] = match usize::try_from(max_count) {
            Ok(max_count) if max_count > 0 && !infos.is_null() => unsafe { slice::from_raw_parts_mut(infos, max_count) },
            _ => &mut [],
        };

        i32::try_from(active_displays(&ENGINE, infos)).unwrap_or(i32::MAX)
    }

    /// Starts capturing a display from the last `GetActiveDisplays` call.
    ///
    /// # Safety
    ///
    /// `callback` must stay callable with `context` from the capture thread until
    /// `StopCapture` or `Cleanup` returns.
    #[unsafe(no_mangle)]
    pub unsafe extern "system" fn StartCapture(
        display_id: i32,
        frame_rate: i32,
        callback: CaptureFrameCallback,
        context: *mut c_void,
    ) -> i32 {
        let handler = unsafe { RawCallbackHandler::new(callback, context) };

        start_capture(&ENGINE, display_id, frame_rate, handler)
    }

    #[unsafe(no_mangle)]
    pub extern "system" fn SetFrameRate(frame_rate: i32) {
        ENGINE.set_frame_rate(frame_rate);
    }

    #[unsafe(no_mangle)]
    pub extern "system" fn StopCapture() {
        if let Err(e) = ENGINE.stop() {
            warn!("Failed to stop capture: {e}");
        }
    }

    #[unsafe(no_mangle)]
    pub extern "system" fn Cleanup() {
        if let Err(e) = ENGINE.teardown() {
            warn!("Failed to clean up: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use screen_stream::testing::FakeBackend;

    use super::*;

    fn three_displays() -> ScreenStream<FakeBackend> {
        ScreenStream::new(
            FakeBackend::new().with_display(0, 0, 8, 6).with_display(8, 0, 4, 4).with_display(-4, 0, 4, 2),
        )
    }

    fn name_of(info: &DisplayInfo) -> String {
        // SAFETY: `write_name` always NUL-terminates.
        unsafe { CStr::from_ptr(info.name.as_ptr()) }.to_string_lossy().into_owned()
    }

    unsafe extern "C" fn count_frames(pixels: *const u8, width: i32, height: i32, context: *mut c_void) {
        assert!(!pixels.is_null());
        assert_eq!((width, height), (8, 6));

        let frames = unsafe { &*context.cast::<AtomicUsize>() };
        frames.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn long_names_are_truncated() {
        let mut name = [1; NAME_CAPACITY];
        write_name(&mut name, &"x".repeat(300));

        assert!(name[..NAME_CAPACITY - 1].iter().all(|&c| c == b'x' as c_char));
        assert_eq!(name[NAME_CAPACITY - 1], 0);

        write_name(&mut name, "\\\\.\\DISPLAY2");
        let info = DisplayInfo { name, ..DisplayInfo::default() };
        assert_eq!(name_of(&info), "\\\\.\\DISPLAY2");
    }

    #[test]
    fn returns_the_true_count() {
        let stream = three_displays();

        let mut infos = [DisplayInfo::default(); 2];
        assert_eq!(active_displays(&stream, &mut infos), 3);
        assert_eq!(active_displays(&stream, &mut []), 3);

        assert_eq!(infos[0].id, 0);
        assert_eq!((infos[0].width, infos[0].height), (8, 6));
        assert!(infos[0].is_primary);
        assert_eq!(name_of(&infos[0]), "\\\\.\\DISPLAY1");

        assert_eq!(infos[1].id, 1);
        assert_eq!((infos[1].left, infos[1].top), (8, 0));
        assert!(!infos[1].is_primary);
        assert!((infos[1].dpi_x - 96.0).abs() < f32::EPSILON);
    }

    #[test]
    fn failed_enumeration_counts_nothing() {
        let stream = three_displays();
        stream
            .backend()
            .set_enumeration_error(Some(screen_stream::backend::Error::FactoryUnavailable("gone".to_string())));

        assert_eq!(active_displays(&stream, &mut [DisplayInfo::default(); 4]), 0);
    }

    #[test]
    fn start_status_codes() {
        let stream = three_displays();
        active_displays(&stream, &mut []);

        let start = |display_id, frame_rate| unsafe {
            start_capture(&stream, display_id, frame_rate, RawCallbackHandler::new(None, std::ptr::null_mut()))
        };

        assert_eq!(start(99, 30), -1);
        assert_eq!(start(-1, 30), -1);
        assert_eq!(start(0, 0), -5);
        assert_eq!(start(0, -30), -5);
        assert!(!stream.is_running());

        stream
            .backend()
            .set_open_error(Some(screen_stream::backend::Error::DuplicationFailed("in use".to_string())));
        assert_eq!(start(0, 30), -4);
        stream.backend().set_open_error(None);

        assert_eq!(start(0, 30), STATUS_OK);
        assert_eq!(start(1, 30), STATUS_OK);
        assert_eq!(stream.active_display(), Some(0));

        stream.stop().unwrap();
    }

    #[test]
    fn callback_receives_frames() {
        let stream = three_displays();
        active_displays(&stream, &mut []);
        let frames = Arc::new(AtomicUsize::new(0));

        let handler = unsafe { RawCallbackHandler::new(Some(count_frames), Arc::as_ptr(&frames).cast_mut().cast()) };
        assert_eq!(start_capture(&stream, 0, 120, handler), STATUS_OK);

        let start = Instant::now();
        while frames.load(Ordering::SeqCst) < 3 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        stream.stop().unwrap();

        assert!(frames.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn callback_is_cdecl() {
        let callback: unsafe extern "C" fn(*const u8, i32, i32, *mut c_void) = count_frames;
        let callback: CaptureFrameCallback = Some(callback);

        assert!(callback.is_some());
    }
}
