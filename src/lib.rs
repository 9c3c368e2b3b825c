//! # Screen Stream
//!
//! **Screen Stream** captures a physical display in real time through the DXGI Desktop
//! Duplication API and hands each frame to your code as packed RGB bytes, at a frame
//! rate you can change while capturing.
//!
//! ## Features
//!
//! - Enumerates every display attached to the desktop, on every adapter.
//! - One dedicated capture thread per engine, paced to the requested rate.
//! - Stride-aware BGRA to RGB conversion, parallelized over rows.
//! - Closure, trait, or bounded-channel frame delivery.
//! - Reports why a capture ended (stopped, handler error or panic, access lost).
//!
//! ## Installation
//!
//! Add this library to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! screen-stream = "0.1.0"
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use screen_stream::capture::{ExitReason, InternalCaptureControl, ScreenStream};
//! use screen_stream::frame::{Frame, FrameHandler};
//!
//! // Struct To Implement The Handler For
//! struct Capture {
//!     frames: u32,
//! }
//!
//! impl FrameHandler for Capture {
//!     type Error = std::io::Error;
//!
//!     // Called Every Time A New Frame Is Available
//!     fn on_frame_arrived(
//!         &mut self,
//!         frame: &Frame<'_>,
//!         capture_control: &InternalCaptureControl,
//!     ) -> Result<(), Self::Error> {
//!         println!("Frame {}: {} x {}", frame.sequence(), frame.width(), frame.height());
//!
//!         self.frames += 1;
//!         if self.frames == 60 {
//!             // Gracefully Stop The Capture Thread
//!             capture_control.stop();
//!         }
//!
//!         Ok(())
//!     }
//!
//!     // Called When The Capture Thread Ends
//!     fn on_closed(&mut self, reason: &ExitReason) {
//!         println!("Capture Closed: {reason}");
//!     }
//! }
//!
//! let stream = ScreenStream::dxgi();
//! for display in stream.enumerate()? {
//!     println!("{display}");
//! }
//!
//! stream.start(0, 30, Capture { frames: 0 })?;
//! std::thread::sleep(std::time::Duration::from_secs(3));
//! stream.stop()?;
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::inconsistent_struct_constructor)]
#![warn(clippy::must_use_candidate)]
#![warn(clippy::ptr_as_ptr)]
#![warn(clippy::borrow_as_ptr)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

pub mod backend;
pub mod capture;
pub mod convert;
#[cfg(windows)]
mod d3d11;
pub mod display;
#[cfg(windows)]
pub mod dxgi_duplication_api;
pub mod frame;
pub mod pacer;
pub mod settings;
pub mod stats;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capture::{CaptureState, ExitReason, InternalCaptureControl, ScreenStream};
pub use display::Display;
pub use frame::{Frame, FrameHandler, OwnedFrame, frame_channel};
pub use settings::Settings;
