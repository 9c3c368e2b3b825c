//! The seam between the capture engine and the graphics driver.
//!
//! A [`CaptureBackend`] lists the outputs of every adapter and opens a
//! [`DuplicationSource`] for one of them. The engine in [`crate::capture`] only talks to
//! these traits, so the same state machine and capture loop drive the DXGI backend on
//! Windows and the in-memory backend used by the tests.
use std::time::Duration;

/// Errors reported by a capture backend.
///
/// Driver errors are carried as formatted messages so the type stays the same on every
/// platform.
#[derive(thiserror::Error, Eq, PartialEq, Clone, Debug)]
pub enum Error {
    /// The adapter factory could not be created, so no output can be listed.
    #[error("Failed to create the adapter factory: {0}")]
    FactoryUnavailable(String),
    /// The graphics device for the output's adapter could not be created.
    #[error("Failed to create the graphics device: {0}")]
    DeviceCreateFailed(String),
    /// The output does not expose the interface needed for duplication.
    #[error("The output does not support desktop duplication: {0}")]
    OutputUnsupported(String),
    /// The output could not be duplicated (already duplicated elsewhere, protected
    /// content, too many duplications, ...).
    #[error("Failed to duplicate the output: {0}")]
    DuplicationFailed(String),
    /// The duplication access was lost and must be recreated.
    #[error("Duplication access lost; the duplication must be recreated")]
    AccessLost,
    /// Any other failure while waiting for or releasing a frame.
    #[error("Frame acquisition failed: {0}")]
    AcquisitionFailed(String),
    /// The acquired frame could not be copied into CPU memory.
    #[error("Failed to map the frame into CPU memory: {0}")]
    MapFailed(String),
}

/// Desktop rectangle of an output in virtual-desktop coordinates.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub struct DesktopRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DesktopRect {
    #[must_use]
    #[inline]
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    #[must_use]
    #[inline]
    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    #[must_use]
    #[inline]
    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// What a backend knows about one output before it is filtered and numbered.
#[derive(PartialEq, Clone, Debug)]
pub struct OutputDescription {
    /// Index of the adapter that owns the output.
    pub adapter_index: u32,
    /// Index of the output on its adapter.
    pub output_index: u32,
    /// Device name, e.g. `\\.\DISPLAY1`.
    pub device_name: String,
    /// Desktop rectangle of the output.
    pub desktop: DesktopRect,
    /// Whether the output is currently part of the desktop.
    pub attached_to_desktop: bool,
    /// Effective horizontal and vertical DPI.
    pub dpi: (f32, f32),
}

/// A CPU-readable view of an acquired frame.
///
/// `data` holds `height` rows of `row_pitch` bytes each (the last row may be cut at
/// `width * 4`). Pixels are 4 bytes in B, G, R, A order.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Surface<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub row_pitch: u32,
}

/// A frame held by a [`DuplicationSource`].
///
/// The frame is released back to the source when this value is dropped, so every
/// acquisition is paired with exactly one release whatever happens in between.
pub trait AcquiredFrame {
    /// Copies the frame into CPU-visible memory and hands the mapped surface to `read`.
    ///
    /// The surface is only valid for the duration of the call.
    fn read(&mut self, read: &mut dyn FnMut(Surface<'_>)) -> Result<(), Error>;
}

/// A duplication bound to one output.
///
/// Owns every GPU resource of a capture (device, duplication, staging memory); dropping
/// the source releases them.
pub trait DuplicationSource: Send + 'static {
    /// The frame guard returned by [`DuplicationSource::acquire_next_frame`].
    type Frame<'a>: AcquiredFrame
    where
        Self: 'a;

    /// Waits up to `timeout` for the next desktop frame.
    ///
    /// Returns `Ok(None)` when no new frame arrived within the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessLost`] or [`Error::AcquisitionFailed`] when the duplication
    /// can no longer produce frames.
    fn acquire_next_frame(&mut self, timeout: Duration) -> Result<Option<Self::Frame<'_>>, Error>;
}

/// A source of outputs and duplications.
pub trait CaptureBackend: Send + Sync + 'static {
    /// Handle retained between enumeration and [`CaptureBackend::open`].
    type Output: Send + 'static;
    /// The duplication type produced by [`CaptureBackend::open`].
    type Source: DuplicationSource;

    /// Walks every adapter and every output of each adapter, in enumeration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FactoryUnavailable`] when the adapters cannot be listed.
    fn outputs(&self) -> Result<Vec<(OutputDescription, Self::Output)>, Error>;

    /// Creates a device for the output's adapter and duplicates the output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceCreateFailed`], [`Error::OutputUnsupported`] or
    /// [`Error::DuplicationFailed`].
    fn open(&self, output: &Self::Output) -> Result<Self::Source, Error>;
}
