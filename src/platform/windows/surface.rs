use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_R8G8B8A8_UNORM_SRGB, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

use crate::error::{CaptureError, CaptureResult};
use crate::frame::PixelFormat;
use crate::surface::SurfaceId;

/// Channel order of a back buffer format the encoder can read.
pub(crate) fn pixel_format(format: DXGI_FORMAT) -> CaptureResult<PixelFormat> {
    match format {
        DXGI_FORMAT_R8G8B8A8_UNORM | DXGI_FORMAT_R8G8B8A8_UNORM_SRGB => Ok(PixelFormat::Rgba8),
        DXGI_FORMAT_B8G8R8A8_UNORM | DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => Ok(PixelFormat::Bgra8),
        other => Err(CaptureError::UnsupportedFormat(format!(
            "back buffer format {other:?}"
        ))),
    }
}

pub(crate) fn ensure_single_sampled(sample_desc: &DXGI_SAMPLE_DESC) -> CaptureResult<()> {
    if sample_desc.Count > 1 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "multisampled back buffer ({} samples)",
            sample_desc.Count
        )));
    }
    Ok(())
}

/// Output window of a swap chain, or `None` when the swap chain does not
/// present into a window (composition and core-window swap chains).
pub(crate) fn swap_chain_surface(swap_chain: &IDXGISwapChain) -> Option<SurfaceId> {
    let desc = unsafe { swap_chain.GetDesc() }.ok()?;
    let surface = SurfaceId::from_raw_handle(desc.OutputWindow.0 as isize);
    (!surface.is_null()).then_some(surface)
}
