use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_9_1, D3D_FEATURE_LEVEL_9_2, D3D_FEATURE_LEVEL_9_3,
    D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE_STAGING, D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;
use windows::Win32::Graphics::Dxgi::IDXGIAdapter1;

/// Used To Handle DirectX Errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("D3D11CreateDevice returned no device")]
    NoDevice,
    #[error("CreateTexture2D returned no texture")]
    NoTexture,
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// Create ID3D11Device And ID3D11DeviceContext On The Given Adapter
///
/// The duplication of an output must be created with a device on that output's adapter.
pub fn create_d3d_device(adapter: &IDXGIAdapter1) -> Result<(ID3D11Device, ID3D11DeviceContext), Error> {
    // Set Feature Flags
    let feature_flags = [
        D3D_FEATURE_LEVEL_11_1,
        D3D_FEATURE_LEVEL_11_0,
        D3D_FEATURE_LEVEL_10_1,
        D3D_FEATURE_LEVEL_10_0,
        D3D_FEATURE_LEVEL_9_3,
        D3D_FEATURE_LEVEL_9_2,
        D3D_FEATURE_LEVEL_9_1,
    ];

    let mut d3d_device = None;
    let mut feature_level = D3D_FEATURE_LEVEL::default();
    let mut d3d_device_context = None;
    unsafe {
        D3D11CreateDevice(
            adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&feature_flags),
            D3D11_SDK_VERSION,
            Some(&mut d3d_device),
            Some(&mut feature_level),
            Some(&mut d3d_device_context),
        )?;
    };

    match (d3d_device, d3d_device_context) {
        (Some(d3d_device), Some(d3d_device_context)) => Ok((d3d_device, d3d_device_context)),
        _ => Err(Error::NoDevice),
    }
}

/// CPU-Readable Copy Target, Reused While The Frame Description Stays The Same
pub struct StagingTexture {
    texture: ID3D11Texture2D,
    desc: D3D11_TEXTURE2D_DESC,
}

impl StagingTexture {
    /// Create A Staging Texture Matching A GPU Texture Description
    pub fn new(d3d_device: &ID3D11Device, source: &D3D11_TEXTURE2D_DESC) -> Result<Self, Error> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: source.Width,
            Height: source.Height,
            MipLevels: 1,
            ArraySize: 1,
            Format: source.Format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };

        let mut texture = None;
        unsafe {
            d3d_device.CreateTexture2D(&desc, None, Some(&mut texture))?;
        };
        let texture = texture.ok_or(Error::NoTexture)?;

        Ok(Self { texture, desc })
    }

    /// Check To See If This Texture Can Receive A Copy Of `source`
    #[must_use]
    #[inline]
    pub const fn matches(&self, source: &D3D11_TEXTURE2D_DESC) -> bool {
        self.desc.Width == source.Width && self.desc.Height == source.Height && self.desc.Format.0 == source.Format.0
    }

    /// Get The Underlying Texture
    #[must_use]
    #[inline]
    pub const fn texture(&self) -> &ID3D11Texture2D {
        &self.texture
    }

    #[must_use]
    #[inline]
    pub const fn width(&self) -> u32 {
        self.desc.Width
    }

    #[must_use]
    #[inline]
    pub const fn height(&self) -> u32 {
        self.desc.Height
    }
}
