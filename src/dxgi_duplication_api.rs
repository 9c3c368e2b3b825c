//! DXGI Desktop Duplication backend.
//!
//! [`DxgiBackend`] walks every adapter and output through DXGI 1.1 and duplicates an
//! output with a Direct3D 11 device created on that output's adapter. Frames are copied
//! into a cached staging texture and mapped so the engine can convert them on the CPU.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//!
//! use screen_stream::backend::{AcquiredFrame, CaptureBackend, DuplicationSource};
//! use screen_stream::dxgi_duplication_api::DxgiBackend;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = DxgiBackend::new();
//!     let (description, output) = backend.outputs()?.into_iter().next().ok_or("no output")?;
//!     println!("Duplicating {}", description.device_name);
//!
//!     let mut source = backend.open(&output)?;
//!     if let Some(mut frame) = source.acquire_next_frame(Duration::from_millis(500))? {
//!         frame.read(&mut |surface| println!("{} x {}", surface.width, surface.height))?;
//!     }
//!     Ok(())
//! }
//! ```
use std::slice;
use std::time::Duration;

use log::{debug, trace, warn};
use windows::Win32::Foundation::E_ACCESSDENIED;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE, D3D11_TEXTURE2D_DESC, ID3D11Device, ID3D11DeviceContext,
    ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_MODE_ROTATION_ROTATE90, DXGI_MODE_ROTATION_ROTATE270,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO, DXGI_OUTPUT_DESC,
    IDXGIAdapter1, IDXGIFactory1, IDXGIOutput, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
};
use windows::Win32::Graphics::Gdi::HMONITOR;
use windows::Win32::UI::HiDpi::{
    DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2, GetDpiForMonitor, MDT_EFFECTIVE_DPI, SetProcessDpiAwarenessContext,
};
use windows::core::Interface;

use crate::backend::{
    AcquiredFrame, CaptureBackend, DesktopRect, DuplicationSource, Error, OutputDescription, Surface,
};
use crate::d3d11::{StagingTexture, create_d3d_device};
use crate::display::DEFAULT_DPI;

/// Capture Backend Over The DXGI Desktop Duplication API
#[derive(Clone, Copy, Debug, Default)]
pub struct DxgiBackend;

impl DxgiBackend {
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self
    }
}

/// An Output And The Adapter It Is Connected To
pub struct DxgiOutput {
    adapter: IDXGIAdapter1,
    output: IDXGIOutput,
}

// Only used from one thread at a time: enumeration and open run under the engine's locks.
#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for DxgiOutput {}

impl CaptureBackend for DxgiBackend {
    type Output = DxgiOutput;
    type Source = DxgiDuplication;

    fn outputs(&self) -> Result<Vec<(OutputDescription, Self::Output)>, Error> {
        set_dpi_awareness();

        let factory = unsafe { CreateDXGIFactory1::<IDXGIFactory1>() }
            .map_err(|e| Error::FactoryUnavailable(e.to_string()))?;

        let mut outputs = Vec::new();
        let mut adapter_index = 0;
        while let Ok(adapter) = unsafe { factory.EnumAdapters1(adapter_index) } {
            let mut output_index = 0;
            while let Ok(output) = unsafe { adapter.EnumOutputs(output_index) } {
                match unsafe { output.GetDesc() } {
                    Ok(desc) => outputs.push((
                        describe(adapter_index, output_index, &desc),
                        DxgiOutput { adapter: adapter.clone(), output },
                    )),
                    Err(e) => warn!("Failed to describe output {output_index} of adapter {adapter_index}: {e}"),
                }

                output_index += 1;
            }

            trace!("Adapter {adapter_index} has {output_index} outputs");
            adapter_index += 1;
        }

        Ok(outputs)
    }

    fn open(&self, output: &Self::Output) -> Result<Self::Source, Error> {
        let (d3d_device, d3d_device_context) =
            create_d3d_device(&output.adapter).map_err(|e| Error::DeviceCreateFailed(e.to_string()))?;

        // Get IDXGIOutput1 for DuplicateOutput.
        let output = output.output.cast::<IDXGIOutput1>().map_err(|e| Error::OutputUnsupported(e.to_string()))?;

        let duplication = unsafe { output.DuplicateOutput(&d3d_device) }
            .map_err(|e| Error::DuplicationFailed(e.to_string()))?;

        // Rotated outputs deliver unrotated surfaces, which never match the desktop size.
        let duplication_desc = unsafe { duplication.GetDesc() };
        if matches!(duplication_desc.Rotation, DXGI_MODE_ROTATION_ROTATE90 | DXGI_MODE_ROTATION_ROTATE270) {
            warn!(
                "Output is rotated ({}), its {}x{} frames will be skipped",
                duplication_desc.Rotation.0, duplication_desc.ModeDesc.Width, duplication_desc.ModeDesc.Height
            );
        }

        Ok(DxgiDuplication { d3d_device, d3d_device_context, duplication, staging: None })
    }
}

/// A Duplicated Output With Its Device And Staging Texture
///
/// Dropping it releases the duplication, the device, and the staging texture.
pub struct DxgiDuplication {
    d3d_device: ID3D11Device,
    d3d_device_context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    staging: Option<StagingTexture>,
}

// The duplication is moved into the capture thread and only used there until it is
// handed back to be dropped.
#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for DxgiDuplication {}

impl DuplicationSource for DxgiDuplication {
    type Frame<'a> = DxgiFrame<'a>;

    fn acquire_next_frame(&mut self, timeout: Duration) -> Result<Option<Self::Frame<'_>>, Error> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource = None;

        match unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource) } {
            Ok(()) => (),
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => return Err(Error::AccessLost),
            Err(e) => return Err(Error::AcquisitionFailed(e.to_string())),
        }

        Ok(Some(DxgiFrame { source: self, resource }))
    }
}

/// A Frame Held By The Duplication Until Dropped
pub struct DxgiFrame<'a> {
    source: &'a mut DxgiDuplication,
    resource: Option<IDXGIResource>,
}

impl AcquiredFrame for DxgiFrame<'_> {
    fn read(&mut self, read: &mut dyn FnMut(Surface<'_>)) -> Result<(), Error> {
        let resource = self
            .resource
            .as_ref()
            .ok_or_else(|| Error::AcquisitionFailed("AcquireNextFrame returned no resource".to_string()))?;

        // Convert the resource to an ID3D11Texture2D.
        let texture = resource.cast::<ID3D11Texture2D>().map_err(|e| Error::MapFailed(e.to_string()))?;
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };

        if desc.Format != DXGI_FORMAT_B8G8R8A8_UNORM {
            return Err(Error::MapFailed(format!("unsupported desktop format {}", desc.Format.0)));
        }

        let source = &mut *self.source;
        let staging = match source.staging.take() {
            Some(staging) if staging.matches(&desc) => staging,
            _ => {
                debug!("Creating {}x{} staging texture", desc.Width, desc.Height);
                StagingTexture::new(&source.d3d_device, &desc).map_err(|e| Error::MapFailed(e.to_string()))?
            }
        };
        let staging = source.staging.insert(staging);

        // Copy from the desktop texture into the staging texture
        unsafe { source.d3d_device_context.CopyResource(staging.texture(), &texture) };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { source.d3d_device_context.Map(staging.texture(), 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .map_err(|e| Error::MapFailed(e.to_string()))?;

        // SAFETY: The mapping stays valid until Unmap below.
        let data = unsafe {
            slice::from_raw_parts(mapped.pData.cast::<u8>(), staging.height() as usize * mapped.RowPitch as usize)
        };
        read(Surface { data, width: staging.width(), height: staging.height(), row_pitch: mapped.RowPitch });

        unsafe { source.d3d_device_context.Unmap(staging.texture(), 0) };

        Ok(())
    }
}

impl Drop for DxgiFrame<'_> {
    fn drop(&mut self) {
        self.resource = None;

        if let Err(e) = unsafe { self.source.duplication.ReleaseFrame() } {
            warn!("Failed to release duplication frame: {e}");
        }
    }
}

fn describe(adapter_index: u32, output_index: u32, desc: &DXGI_OUTPUT_DESC) -> OutputDescription {
    let name_len = desc.DeviceName.iter().position(|&c| c == 0).unwrap_or(desc.DeviceName.len());
    let rect = desc.DesktopCoordinates;

    OutputDescription {
        adapter_index,
        output_index,
        device_name: String::from_utf16_lossy(&desc.DeviceName[..name_len]),
        desktop: DesktopRect::new(rect.left, rect.top, rect.right, rect.bottom),
        attached_to_desktop: desc.AttachedToDesktop.as_bool(),
        dpi: monitor_dpi(desc.Monitor),
    }
}

fn monitor_dpi(monitor: HMONITOR) -> (f32, f32) {
    let mut dpi_x = 0;
    let mut dpi_y = 0;

    match unsafe { GetDpiForMonitor(monitor, MDT_EFFECTIVE_DPI, &mut dpi_x, &mut dpi_y) } {
        Ok(()) => (dpi_x as f32, dpi_y as f32),
        Err(e) => {
            debug!("GetDpiForMonitor failed, assuming {DEFAULT_DPI} DPI: {e}");
            (DEFAULT_DPI, DEFAULT_DPI)
        }
    }
}

// Desktop coordinates and DPI are only reported unscaled to per-monitor aware processes.
fn set_dpi_awareness() {
    if let Err(e) = unsafe { SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2) } {
        // E_ACCESSDENIED when the awareness was already set by an earlier call or the manifest
        if e.code() != E_ACCESSDENIED {
            debug!("Failed to set DPI awareness: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScreenStream;
    use crate::frame::frame_channel;

    #[test]
    #[ignore = "needs an interactive desktop"]
    fn captures_the_first_display() {
        let stream = ScreenStream::dxgi();
        let displays = stream.enumerate().unwrap();
        let display = &displays[0];
        let (handler, receiver) = frame_channel(1);

        stream.start(display.id(), 30, handler).unwrap();
        let frame = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        stream.stop().unwrap();

        assert_eq!((frame.width, frame.height), (display.width(), display.height()));
        assert_eq!(frame.buffer.len(), display.frame_len());
    }
}
