use std::ffi::c_void;

use windows::core::Interface;
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;
use windows::Win32::System::Memory::{
    VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_GUARD, PAGE_NOACCESS,
};

use crate::backend::{GraphicsApi, ResolvedPresent, PRESENT_VTABLE_SLOT};
use crate::error::{CaptureError, CaptureResult};
use crate::hook::PresentHookConfig;
use crate::platform::pointer_offset_in;

use super::d3d11::D3D11Bootstrap;
use super::d3d12::D3D12Bootstrap;
use super::window::HiddenWindow;

const BOOTSTRAP_WINDOW_TITLE: &str = "present-hook bootstrap";

/// Upper bound on how far into a swap chain object the queue is searched.
const MAX_SWAP_CHAIN_SCAN: usize = 4096;

/// Create a throwaway swap chain of the configured API and read the
/// `Present` entry out of its dispatch table. Every swap chain of that API
/// in the process shares the same implementation.
pub(crate) fn resolve_present(config: &PresentHookConfig) -> CaptureResult<ResolvedPresent> {
    let window = HiddenWindow::create(
        BOOTSTRAP_WINDOW_TITLE,
        config.bootstrap_width,
        config.bootstrap_height,
    )?;

    let resolved = match config.api {
        GraphicsApi::D3D11 => {
            let bootstrap = D3D11Bootstrap::create(
                window.hwnd(),
                config.bootstrap_width,
                config.bootstrap_height,
                &config.adapter_policy,
            )?;
            ResolvedPresent {
                address: unsafe { present_entry(bootstrap.swap_chain()) },
                command_queue_offset: None,
            }
        }
        GraphicsApi::D3D12 => {
            let bootstrap = D3D12Bootstrap::create(
                window.hwnd(),
                config.bootstrap_width,
                config.bootstrap_height,
                &config.adapter_policy,
            )?;
            let offset = unsafe {
                command_queue_offset(bootstrap.swap_chain(), bootstrap.queue().as_raw())
            }
            .ok_or_else(|| {
                CaptureError::ResourceCreation(anyhow::anyhow!(
                    "command queue pointer not found in the D3D12 swap chain"
                ))
            })?;
            tracing::debug!(offset, "located command queue inside swap chain");
            ResolvedPresent {
                address: unsafe { present_entry(bootstrap.swap_chain()) },
                command_queue_offset: Some(offset),
            }
        }
    };

    drop(window);
    Ok(resolved)
}

/// # Safety
///
/// `swap_chain` must be a live COM object.
unsafe fn present_entry(swap_chain: &IDXGISwapChain) -> usize {
    let vtable = unsafe { *(swap_chain.as_raw() as *const *const usize) };
    let entry = unsafe { *vtable.add(PRESENT_VTABLE_SLOT) };
    debug_assert_eq!(entry, swap_chain.vtable().Present as usize);
    entry
}

/// Number of bytes from `address` that can be read without faulting, at
/// most `limit`.
fn readable_len(address: *const c_void, limit: usize) -> usize {
    let mut info = MEMORY_BASIC_INFORMATION::default();
    let written = unsafe {
        VirtualQuery(
            Some(address),
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0
        || info.State != MEM_COMMIT
        || (info.Protect & (PAGE_NOACCESS | PAGE_GUARD)).0 != 0
        || info.Protect.0 == 0
    {
        return 0;
    }
    let region_end = info.BaseAddress as usize + info.RegionSize;
    region_end.saturating_sub(address as usize).min(limit)
}

/// # Safety
///
/// `swap_chain` must be a live COM object.
unsafe fn command_queue_offset(swap_chain: &IDXGISwapChain, queue: *mut c_void) -> Option<usize> {
    let base = swap_chain.as_raw() as *const u8;
    let len = readable_len(base as *const c_void, MAX_SWAP_CHAIN_SCAN);
    if len == 0 {
        return None;
    }
    let object = unsafe { std::slice::from_raw_parts(base, len) };
    pointer_offset_in(object, queue as usize)
}
