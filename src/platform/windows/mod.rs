pub(crate) mod d3d11;
pub(crate) mod d3d12;
pub(crate) mod resolver;
pub(crate) mod surface;
pub(crate) mod window;

use std::ffi::c_void;
use std::sync::OnceLock;

use windows::core::{Interface, HRESULT};
use windows::Win32::Graphics::Dxgi::{IDXGISwapChain, DXGI_ERROR_INVALID_CALL};

use crate::backend::{CapturePipeline, GraphicsApi, ResolvedPresent};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::RawFrame;
use crate::hook::{HookSlot, PresentHookConfig, PresentPlatform};
use crate::surface::SurfaceId;

pub use d3d11::D3D11Pipeline;
pub use d3d12::D3D12Pipeline;

fn failed_call(err: windows::core::Error, context: &str) -> anyhow::Error {
    anyhow::Error::new(err).context(format!("{context} failed"))
}

pub(crate) fn creation_failed(err: windows::core::Error, context: &str) -> CaptureError {
    CaptureError::ResourceCreation(failed_call(err, context))
}

pub(crate) fn mapping_failed(err: windows::core::Error, context: &str) -> CaptureError {
    CaptureError::Mapping(failed_call(err, context))
}

pub(crate) fn sync_failed(err: windows::core::Error, context: &str) -> CaptureError {
    CaptureError::Synchronization(failed_call(err, context))
}

/// Readback path for whichever API was hooked.
pub enum SwapChainPipeline {
    D3D11(D3D11Pipeline),
    D3D12(D3D12Pipeline),
}

// Only ever driven from inside the interceptor lock, one present call at
// a time.
unsafe impl Send for SwapChainPipeline {}

impl CapturePipeline for SwapChainPipeline {
    type Source = IDXGISwapChain;

    fn surface_id(&self, source: &IDXGISwapChain) -> Option<SurfaceId> {
        surface::swap_chain_surface(source)
    }

    fn capture_frame(&mut self, source: &IDXGISwapChain) -> CaptureResult<RawFrame> {
        match self {
            Self::D3D11(pipeline) => pipeline.capture(source),
            Self::D3D12(pipeline) => pipeline.capture(source),
        }
    }
}

pub(crate) struct WindowsPresent;

impl PresentPlatform for WindowsPresent {
    type Pipeline = SwapChainPipeline;

    fn resolve(config: &PresentHookConfig) -> CaptureResult<ResolvedPresent> {
        resolver::resolve_present(config)
    }

    fn create_pipeline(
        config: &PresentHookConfig,
        resolved: &ResolvedPresent,
    ) -> CaptureResult<SwapChainPipeline> {
        match config.api {
            GraphicsApi::D3D11 => Ok(SwapChainPipeline::D3D11(D3D11Pipeline::new())),
            GraphicsApi::D3D12 => {
                let offset = resolved.command_queue_offset.ok_or_else(|| {
                    CaptureError::ResourceCreation(anyhow::anyhow!(
                        "D3D12 capture needs the swap chain's command queue offset"
                    ))
                })?;
                Ok(SwapChainPipeline::D3D12(D3D12Pipeline::new(offset)))
            }
        }
    }

    fn replacement() -> usize {
        present_detour as usize
    }

    fn slot() -> &'static OnceLock<HookSlot<SwapChainPipeline>> {
        static SLOT: OnceLock<HookSlot<SwapChainPipeline>> = OnceLock::new();
        &SLOT
    }
}

type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT;

unsafe extern "system" fn present_detour(
    this: *mut c_void,
    sync_interval: u32,
    flags: u32,
) -> HRESULT {
    let Some(slot) = WindowsPresent::slot().get() else {
        // The patch is only enabled after the slot is published.
        return DXGI_ERROR_INVALID_CALL;
    };
    let original: PresentFn = unsafe { std::mem::transmute(slot.trampoline()) };
    let forward = || unsafe { original(this, sync_interval, flags) };

    match unsafe { IDXGISwapChain::from_raw_borrowed(&this) } {
        Some(swap_chain) => slot.interceptor().on_present(swap_chain, forward),
        None => forward(),
    }
}
