use std::convert::Infallible;
use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use log::{debug, warn};

use crate::capture::{ExitReason, InternalCaptureControl};

/// Frame Struct Handed To A [`FrameHandler`]
///
/// The pixels are packed `R, G, B` bytes, `width * height * 3` long. The view borrows
/// the capture thread's buffer, which is overwritten by the next frame: copy what you
/// need before returning from the handler.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
    width: u32,
    height: u32,
    display_id: usize,
    sequence: u64,
}

impl<'a> Frame<'a> {
    #[must_use]
    #[inline]
    pub const fn new(buffer: &'a [u8], width: u32, height: u32, display_id: usize, sequence: u64) -> Self {
        Self { buffer, width, height, display_id, sequence }
    }

    /// Get The Packed RGB Pixels
    #[must_use]
    #[inline]
    pub const fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Get Frame Width
    #[must_use]
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Get Frame Height
    #[must_use]
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Get The Id Of The Captured Display
    #[must_use]
    #[inline]
    pub const fn display_id(&self) -> usize {
        self.display_id
    }

    /// Get The Number Of Frames Delivered Before This One In The Current Session
    #[must_use]
    #[inline]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Copy The Frame Out Of The Capture Buffer
    #[must_use]
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            buffer: self.buffer.to_vec(),
            width: self.width,
            height: self.height,
            display_id: self.display_id,
            sequence: self.sequence,
        }
    }
}

/// A Frame Copied Out Of The Capture Buffer
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct OwnedFrame {
    pub buffer: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub display_id: usize,
    pub sequence: u64,
}

impl OwnedFrame {
    /// Borrow As A [`Frame`]
    #[must_use]
    #[inline]
    pub fn as_frame(&self) -> Frame<'_> {
        Frame::new(&self.buffer, self.width, self.height, self.display_id, self.sequence)
    }
}

/// Event Handler Trait
///
/// Both methods run on the capture thread.
pub trait FrameHandler: Send + 'static {
    /// Ends The Capture When Returned From [`FrameHandler::on_frame_arrived`]
    type Error: fmt::Display;

    /// Called Every Time A New Frame Is Available
    ///
    /// Returning an error ends the capture thread with [`ExitReason::HandlerError`],
    /// panicking ends it with [`ExitReason::HandlerPanicked`].
    fn on_frame_arrived(
        &mut self,
        frame: &Frame<'_>,
        capture_control: &InternalCaptureControl,
    ) -> Result<(), Self::Error>;

    /// Called Once When The Capture Thread Ends, Whatever The Reason
    fn on_closed(&mut self, reason: &ExitReason) {
        let _ = reason;
    }
}

impl<F> FrameHandler for F
where
    F: FnMut(&Frame<'_>) + Send + 'static,
{
    type Error = Infallible;

    #[inline]
    fn on_frame_arrived(&mut self, frame: &Frame<'_>, _: &InternalCaptureControl) -> Result<(), Self::Error> {
        self(frame);
        Ok(())
    }
}

/// Used To Handle Channel Handler Errors
#[derive(thiserror::Error, Eq, PartialEq, Clone, Copy, Debug)]
pub enum ChannelError {
    #[error("Frame receiver was dropped")]
    ReceiverDropped,
}

/// Hands Copies Of Each Frame To A Bounded Queue
///
/// Created by [`frame_channel`]. The capture thread never waits for the consumer: when
/// the queue is full the newest frame is dropped and counted, so a slow consumer sees a
/// lower frame rate instead of stalling acquisition.
pub struct ChannelHandler {
    sender: SyncSender<OwnedFrame>,
    dropped: u64,
}

impl ChannelHandler {
    /// Number Of Frames Dropped Because The Queue Was Full
    #[must_use]
    #[inline]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl FrameHandler for ChannelHandler {
    type Error = ChannelError;

    fn on_frame_arrived(&mut self, frame: &Frame<'_>, _: &InternalCaptureControl) -> Result<(), Self::Error> {
        match self.sender.try_send(frame.to_owned_frame()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!("Frame queue full, dropping frame {}", frame.sequence());
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(ChannelError::ReceiverDropped),
        }
    }

    fn on_closed(&mut self, reason: &ExitReason) {
        if self.dropped > 0 {
            warn!("Frame queue dropped {} frames before close: {reason}", self.dropped);
        }
    }
}

/// Create A Bounded Frame Queue Holding Up To `capacity` Frames
///
/// Capture ends when the receiver is dropped.
#[must_use]
pub fn frame_channel(capacity: usize) -> (ChannelHandler, Receiver<OwnedFrame>) {
    let (sender, receiver) = mpsc::sync_channel(capacity.max(1));

    (ChannelHandler { sender, dropped: 0 }, receiver)
}
