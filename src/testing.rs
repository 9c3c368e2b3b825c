//! An in-memory [`CaptureBackend`] for exercising the engine without a graphics driver.
//!
//! Enabled for the crate's own tests and through the `testing` feature for dependents.
//! Each acquired frame is a BGRA gradient with `B = x`, `G = y` and `R = frame index`
//! (all modulo 256), laid out with the configured row padding.
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{
    AcquiredFrame, CaptureBackend, DesktopRect, DuplicationSource, Error, OutputDescription, Surface,
};
use crate::convert::SOURCE_BYTES_PER_PIXEL;
use crate::display::DEFAULT_DPI;

#[derive(Debug, Default)]
struct Config {
    outputs: Vec<OutputDescription>,
    enumeration_error: Option<Error>,
    open_error: Option<Error>,
    row_padding: u32,
    surface_size: Option<(u32, u32)>,
    timeouts_per_frame: usize,
    fail_after: Option<(usize, Error)>,
    read_error: Option<Error>,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    live_sources: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Fake Backend With Scripted Outputs And Failures
///
/// Clones share configuration and counters, so a test can keep one while the engine
/// owns another.
#[derive(Clone, Debug, Default)]
pub struct FakeBackend {
    config: Arc<Mutex<Config>>,
    counters: Arc<Counters>,
}

impl FakeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attached output on adapter 0 covering the given desktop rectangle.
    #[must_use]
    pub fn with_display(self, left: i32, top: i32, width: u32, height: u32) -> Self {
        self.push_output(left, top, width, height, true);
        self
    }

    /// Adds an output that is not part of the desktop.
    #[must_use]
    pub fn with_detached_output(self, width: u32, height: u32) -> Self {
        self.push_output(0, 0, width, height, false);
        self
    }

    /// Pads each surface row with `bytes` extra bytes.
    #[must_use]
    pub fn with_row_padding(self, bytes: u32) -> Self {
        self.config.lock().row_padding = bytes;
        self
    }

    /// Reports surfaces of this size instead of the display's.
    #[must_use]
    pub fn with_surface_size(self, width: u32, height: u32) -> Self {
        self.config.lock().surface_size = Some((width, height));
        self
    }

    /// Times out `count` times before every frame.
    #[must_use]
    pub fn with_timeouts_per_frame(self, count: usize) -> Self {
        self.config.lock().timeouts_per_frame = count;
        self
    }

    /// Makes enumeration fail until cleared with `None`.
    pub fn set_enumeration_error(&self, error: Option<Error>) {
        self.config.lock().enumeration_error = error;
    }

    /// Makes every open fail until cleared with `None`.
    pub fn set_open_error(&self, error: Option<Error>) {
        self.config.lock().open_error = error;
    }

    /// Makes acquisition fail with `error` once `frames` frames have been acquired by a source.
    pub fn fail_acquisition_after(&self, frames: usize, error: Error) {
        self.config.lock().fail_after = Some((frames, error));
    }

    /// Makes every frame read fail until cleared with `None`.
    pub fn set_read_error(&self, error: Option<Error>) {
        self.config.lock().read_error = error;
    }

    /// Number of sources opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.counters.opened.load(atomic::Ordering::SeqCst)
    }

    /// Number of sources opened and not dropped yet.
    #[must_use]
    pub fn live_sources(&self) -> usize {
        self.counters.live_sources.load(atomic::Ordering::SeqCst)
    }

    /// Number of frames handed out by all sources.
    #[must_use]
    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(atomic::Ordering::SeqCst)
    }

    /// Number of frames released by all sources.
    #[must_use]
    pub fn released(&self) -> usize {
        self.counters.released.load(atomic::Ordering::SeqCst)
    }

    fn push_output(&self, left: i32, top: i32, width: u32, height: u32, attached: bool) {
        let mut config = self.config.lock();
        let output_index = u32::try_from(config.outputs.len()).unwrap_or(u32::MAX);
        let right = left.saturating_add_unsigned(width);
        let bottom = top.saturating_add_unsigned(height);

        config.outputs.push(OutputDescription {
            adapter_index: 0,
            output_index,
            device_name: format!("\\\\.\\DISPLAY{}", output_index + 1),
            desktop: DesktopRect::new(left, top, right, bottom),
            attached_to_desktop: attached,
            dpi: (DEFAULT_DPI, DEFAULT_DPI),
        });
    }
}

impl CaptureBackend for FakeBackend {
    type Output = usize;
    type Source = FakeSource;

    fn outputs(&self) -> Result<Vec<(OutputDescription, Self::Output)>, Error> {
        let config = self.config.lock();
        if let Some(error) = &config.enumeration_error {
            return Err(error.clone());
        }

        Ok(config.outputs.iter().cloned().enumerate().map(|(index, output)| (output, index)).collect())
    }

    fn open(&self, output: &Self::Output) -> Result<Self::Source, Error> {
        let config = self.config.lock();
        if let Some(error) = &config.open_error {
            return Err(error.clone());
        }

        let description = config
            .outputs
            .get(*output)
            .ok_or_else(|| Error::OutputUnsupported(format!("no output {output}")))?;
        let (width, height) = config.surface_size.unwrap_or((
            description.desktop.width().unsigned_abs(),
            description.desktop.height().unsigned_abs(),
        ));

        self.counters.opened.fetch_add(1, atomic::Ordering::SeqCst);
        self.counters.live_sources.fetch_add(1, atomic::Ordering::SeqCst);

        Ok(FakeSource {
            config: self.config.clone(),
            counters: self.counters.clone(),
            width,
            height,
            row_pitch: width * SOURCE_BYTES_PER_PIXEL as u32 + config.row_padding,
            frame_index: 0,
            pending_timeouts: config.timeouts_per_frame,
            surface: Vec::new(),
        })
    }
}

/// Duplication Of A [`FakeBackend`] Output
#[derive(Debug)]
pub struct FakeSource {
    config: Arc<Mutex<Config>>,
    counters: Arc<Counters>,
    width: u32,
    height: u32,
    row_pitch: u32,
    frame_index: usize,
    pending_timeouts: usize,
    surface: Vec<u8>,
}

impl FakeSource {
    fn render(&mut self) {
        let row_pitch = self.row_pitch as usize;
        self.surface.clear();
        self.surface.resize(row_pitch * self.height as usize, 0);

        for (y, row) in self.surface.chunks_exact_mut(row_pitch).enumerate() {
            for x in 0..self.width as usize {
                let pixel = &mut row[x * SOURCE_BYTES_PER_PIXEL..(x + 1) * SOURCE_BYTES_PER_PIXEL];
                pixel.copy_from_slice(&[x as u8, y as u8, self.frame_index as u8, 0xFF]);
            }
        }
    }
}

impl DuplicationSource for FakeSource {
    type Frame<'a> = FakeFrame<'a>;

    fn acquire_next_frame(&mut self, timeout: Duration) -> Result<Option<Self::Frame<'_>>, Error> {
        let timeouts_per_frame = {
            let config = self.config.lock();
            if let Some((frames, error)) = &config.fail_after {
                if self.frame_index >= *frames {
                    return Err(error.clone());
                }
            }

            config.timeouts_per_frame
        };

        if self.pending_timeouts > 0 {
            self.pending_timeouts -= 1;
            thread::sleep(timeout);
            return Ok(None);
        }
        self.pending_timeouts = timeouts_per_frame;

        self.render();
        self.frame_index += 1;
        self.counters.acquired.fetch_add(1, atomic::Ordering::SeqCst);

        Ok(Some(FakeFrame { source: self }))
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.counters.live_sources.fetch_sub(1, atomic::Ordering::SeqCst);
    }
}

/// Frame Held By A [`FakeSource`], Counted As Released On Drop
#[derive(Debug)]
pub struct FakeFrame<'a> {
    source: &'a mut FakeSource,
}

impl AcquiredFrame for FakeFrame<'_> {
    fn read(&mut self, read: &mut dyn FnMut(Surface<'_>)) -> Result<(), Error> {
        if let Some(error) = &self.source.config.lock().read_error {
            return Err(error.clone());
        }

        read(Surface {
            data: &self.source.surface,
            width: self.source.width,
            height: self.source.height,
            row_pitch: self.source.row_pitch,
        });

        Ok(())
    }
}

impl Drop for FakeFrame<'_> {
    fn drop(&mut self) {
        self.source.counters.released.fetch_add(1, atomic::Ordering::SeqCst);
    }
}
