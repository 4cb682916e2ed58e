#[cfg(not(target_os = "windows"))]
use std::sync::OnceLock;

#[cfg(not(target_os = "windows"))]
use crate::backend::{CapturePipeline, ResolvedPresent};
#[cfg(not(target_os = "windows"))]
use crate::error::{CaptureError, CaptureResult};
#[cfg(not(target_os = "windows"))]
use crate::frame::RawFrame;
#[cfg(not(target_os = "windows"))]
use crate::hook::{HookSlot, PresentHookConfig, PresentPlatform};
#[cfg(not(target_os = "windows"))]
use crate::surface::SurfaceId;

#[cfg(target_os = "windows")]
pub(crate) mod windows;

#[cfg(target_os = "windows")]
pub(crate) use windows::WindowsPresent as NativePresent;

/// Byte offset of the first pointer-aligned slot in `object` that holds
/// `needle`.
pub(crate) fn pointer_offset_in(object: &[u8], needle: usize) -> Option<usize> {
    const WIDTH: usize = std::mem::size_of::<usize>();
    if needle == 0 {
        return None;
    }
    object
        .chunks_exact(WIDTH)
        .position(|chunk| {
            let mut bytes = [0u8; WIDTH];
            bytes.copy_from_slice(chunk);
            usize::from_ne_bytes(bytes) == needle
        })
        .map(|slot| slot * WIDTH)
}

#[cfg(not(target_os = "windows"))]
fn unsupported_error() -> CaptureError {
    CaptureError::BackendUnavailable("DXGI present hooks are only supported on Windows".to_string())
}

#[cfg(not(target_os = "windows"))]
pub(crate) struct UnsupportedPipeline;

#[cfg(not(target_os = "windows"))]
impl CapturePipeline for UnsupportedPipeline {
    type Source = ();

    fn surface_id(&self, _source: &()) -> Option<SurfaceId> {
        None
    }

    fn capture_frame(&mut self, _source: &()) -> CaptureResult<RawFrame> {
        Err(unsupported_error())
    }
}

#[cfg(not(target_os = "windows"))]
pub(crate) struct NativePresent;

#[cfg(not(target_os = "windows"))]
impl PresentPlatform for NativePresent {
    type Pipeline = UnsupportedPipeline;

    fn resolve(_config: &PresentHookConfig) -> CaptureResult<ResolvedPresent> {
        Err(unsupported_error())
    }

    fn create_pipeline(
        _config: &PresentHookConfig,
        _resolved: &ResolvedPresent,
    ) -> CaptureResult<UnsupportedPipeline> {
        Err(unsupported_error())
    }

    fn replacement() -> usize {
        0
    }

    fn slot() -> &'static OnceLock<HookSlot<UnsupportedPipeline>> {
        static SLOT: OnceLock<HookSlot<UnsupportedPipeline>> = OnceLock::new();
        &SLOT
    }
}
