use std::ffi::c_void;
use std::mem::ManuallyDrop;

use anyhow::{Context, Result};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Graphics::Direct3D12::{
    D3D12CreateDevice, ID3D12CommandAllocator, ID3D12CommandList, ID3D12CommandQueue,
    ID3D12Device, ID3D12Fence, ID3D12GraphicsCommandList, ID3D12Resource,
    D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC, D3D12_COMMAND_QUEUE_FLAG_NONE,
    D3D12_FENCE_FLAG_NONE, D3D12_HEAP_FLAG_NONE, D3D12_HEAP_PROPERTIES,
    D3D12_HEAP_TYPE_READBACK, D3D12_PLACED_SUBRESOURCE_FOOTPRINT, D3D12_RANGE,
    D3D12_RESOURCE_BARRIER, D3D12_RESOURCE_BARRIER_0, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
    D3D12_RESOURCE_BARRIER_FLAG_NONE, D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
    D3D12_RESOURCE_DESC, D3D12_RESOURCE_DIMENSION_BUFFER, D3D12_RESOURCE_STATES,
    D3D12_RESOURCE_STATE_COPY_DEST, D3D12_RESOURCE_STATE_COPY_SOURCE,
    D3D12_RESOURCE_STATE_PRESENT, D3D12_RESOURCE_TRANSITION_BARRIER,
    D3D12_TEXTURE_COPY_LOCATION, D3D12_TEXTURE_COPY_LOCATION_0,
    D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT, D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
    D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory4, IDXGIFactory6, IDXGISwapChain,
    IDXGISwapChain3, DXGI_ADAPTER_DESC1, DXGI_ADAPTER_FLAG_SOFTWARE,
    DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE, DXGI_SWAP_CHAIN_DESC1, DXGI_SWAP_EFFECT_FLIP_DISCARD,
    DXGI_USAGE_RENDER_TARGET_OUTPUT,
};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use crate::backend::{select_adapter, AdapterCandidate, AdapterPolicy, AdapterPreference};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{PixelFormat, RawFrame};

use super::surface::{ensure_single_sampled, pixel_format};
use super::{creation_failed, mapping_failed, sync_failed};

fn adapter_label(desc: &DXGI_ADAPTER_DESC1) -> String {
    let len = desc
        .Description
        .iter()
        .position(|unit| *unit == 0)
        .unwrap_or(desc.Description.len());
    String::from_utf16_lossy(&desc.Description[..len])
}

fn adapter_key(desc: &DXGI_ADAPTER_DESC1) -> u64 {
    ((desc.AdapterLuid.HighPart as u32 as u64) << 32) | desc.AdapterLuid.LowPart as u64
}

fn is_software(desc: &DXGI_ADAPTER_DESC1) -> bool {
    desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0
}

fn candidate(
    preference: AdapterPreference,
    adapter: IDXGIAdapter1,
) -> Option<(AdapterCandidate<IDXGIAdapter1>, bool)> {
    let desc = unsafe { adapter.GetDesc1() }.ok()?;
    Some((
        AdapterCandidate {
            preference,
            key: adapter_key(&desc),
            label: adapter_label(&desc),
            adapter,
        },
        is_software(&desc),
    ))
}

fn high_performance_adapters(factory: &IDXGIFactory4) -> Vec<AdapterCandidate<IDXGIAdapter1>> {
    let Ok(factory6) = factory.cast::<IDXGIFactory6>() else {
        return Vec::new();
    };
    (0..)
        .map_while(|index| unsafe {
            factory6
                .EnumAdapterByGpuPreference::<IDXGIAdapter1>(
                    index,
                    DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE,
                )
                .ok()
        })
        .filter_map(|adapter| candidate(AdapterPreference::HighPerformance, adapter))
        .filter(|(_, software)| !software)
        .map(|(candidate, _)| candidate)
        .collect()
}

fn hardware_adapters(factory: &IDXGIFactory4) -> Vec<AdapterCandidate<IDXGIAdapter1>> {
    (0..)
        .map_while(|index| unsafe { factory.EnumAdapters1(index) }.ok())
        .filter_map(|adapter| candidate(AdapterPreference::Hardware, adapter))
        .filter(|(_, software)| !software)
        .map(|(candidate, _)| candidate)
        .collect()
}

fn software_adapters(factory: &IDXGIFactory4) -> Vec<AdapterCandidate<IDXGIAdapter1>> {
    unsafe { factory.EnumWarpAdapter::<IDXGIAdapter1>() }
        .ok()
        .and_then(|adapter| candidate(AdapterPreference::Software, adapter))
        .map(|(candidate, _)| candidate)
        .into_iter()
        .collect()
}

fn adapter_candidates(
    factory: &IDXGIFactory4,
    policy: &AdapterPolicy,
) -> Vec<AdapterCandidate<IDXGIAdapter1>> {
    let mut candidates = Vec::new();
    for preference in policy.effective_priority() {
        candidates.extend(match preference {
            AdapterPreference::HighPerformance => high_performance_adapters(factory),
            AdapterPreference::Hardware => hardware_adapters(factory),
            AdapterPreference::Software => software_adapters(factory),
        });
    }
    candidates
}

fn create_d3d12_device(adapter: &IDXGIAdapter1) -> Result<ID3D12Device> {
    let mut device: Option<ID3D12Device> = None;
    unsafe { D3D12CreateDevice(adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }
        .context("D3D12CreateDevice failed")?;
    device.context("D3D12CreateDevice did not return a device")
}

/// Throwaway D3D12 device, queue and swap chain used to locate `Present`
/// and the queue pointer inside the swap chain object.
pub(crate) struct D3D12Bootstrap {
    swap_chain: IDXGISwapChain,
    queue: ID3D12CommandQueue,
    _device: ID3D12Device,
}

impl D3D12Bootstrap {
    pub(crate) fn create(
        hwnd: HWND,
        width: u32,
        height: u32,
        policy: &AdapterPolicy,
    ) -> CaptureResult<Self> {
        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory1() }
            .map_err(|err| creation_failed(err, "CreateDXGIFactory1(IDXGIFactory4)"))?;

        let (chosen, device) =
            select_adapter(adapter_candidates(&factory, policy), |candidate| {
                create_d3d12_device(&candidate.adapter)
                    .map_err(CaptureError::ResourceCreation)
            })?;
        tracing::debug!(
            adapter = %chosen.label,
            preference = chosen.preference.as_str(),
            "bootstrap D3D12 device created"
        );

        Self::create_swap_chain(&factory, device, hwnd, width, height)
            .map_err(CaptureError::ResourceCreation)
    }

    fn create_swap_chain(
        factory: &IDXGIFactory4,
        device: ID3D12Device,
        hwnd: HWND,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                Priority: 0,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                NodeMask: 0,
            })
        }
        .context("ID3D12Device::CreateCommandQueue failed")?;

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: width,
            Height: height,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 2,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };
        let swap_chain = unsafe { factory.CreateSwapChainForHwnd(&queue, hwnd, &desc, None, None) }
            .context("IDXGIFactory4::CreateSwapChainForHwnd failed")?;
        let swap_chain: IDXGISwapChain = swap_chain
            .cast()
            .context("failed to query IDXGISwapChain from IDXGISwapChain1")?;

        Ok(Self {
            swap_chain,
            queue,
            _device: device,
        })
    }

    pub(crate) fn swap_chain(&self) -> &IDXGISwapChain {
        &self.swap_chain
    }

    pub(crate) fn queue(&self) -> &ID3D12CommandQueue {
        &self.queue
    }
}

/// Fails for swap chains presented by a D3D11 device. Those share the
/// hooked `Present` but keep no command queue at the D3D12 offset.
fn ensure_d3d12_swap_chain(swap_chain: &IDXGISwapChain) -> CaptureResult<IDXGISwapChain3> {
    if unsafe { swap_chain.GetDevice::<ID3D11Device>() }.is_ok() {
        return Err(CaptureError::ResourceCreation(anyhow::anyhow!(
            "swap chain belongs to a D3D11 device"
        )));
    }
    swap_chain
        .cast()
        .map_err(|err| creation_failed(err, "IDXGISwapChain3"))
}

/// Borrow the command queue a D3D12 swap chain keeps at `offset`.
///
/// # Safety
///
/// `swap_chain` must have passed [`ensure_d3d12_swap_chain`], and `offset`
/// must have been found in a swap chain created by the same DXGI runtime,
/// so the pointer-sized slot at that offset holds the queue.
unsafe fn host_command_queue(
    swap_chain: &IDXGISwapChain,
    offset: usize,
) -> CaptureResult<ID3D12CommandQueue> {
    let base = swap_chain.as_raw() as *const u8;
    let raw = unsafe { std::ptr::read_unaligned(base.add(offset) as *const *mut c_void) };
    unsafe { ID3D12CommandQueue::from_raw_borrowed(&raw) }
        .cloned()
        .ok_or_else(|| {
            CaptureError::ResourceCreation(anyhow::anyhow!("swap chain holds no command queue"))
        })
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { std::mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

struct EventHandle(HANDLE);

impl EventHandle {
    fn new() -> CaptureResult<Self> {
        unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .map(Self)
            .map_err(|err| sync_failed(err, "CreateEventW(fence)"))
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// GPU objects reused across frames; rebuilt when the device changes or
/// the back buffer no longer fits.
struct Readback {
    device: ID3D12Device,
    buffer: ID3D12Resource,
    capacity: u64,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    fence: ID3D12Fence,
    fence_value: u64,
    event: EventHandle,
}

impl Readback {
    fn create(device: &ID3D12Device, capacity: u64) -> CaptureResult<Self> {
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_READBACK,
            ..Default::default()
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: capacity,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            ..Default::default()
        };

        let mut buffer: Option<ID3D12Resource> = None;
        unsafe {
            device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                D3D12_RESOURCE_STATE_COPY_DEST,
                None,
                &mut buffer,
            )
        }
        .map_err(|err| creation_failed(err, "ID3D12Device::CreateCommittedResource(readback)"))?;
        let buffer = buffer.ok_or_else(|| {
            CaptureError::ResourceCreation(anyhow::anyhow!(
                "CreateCommittedResource returned no buffer"
            ))
        })?;

        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .map_err(|err| creation_failed(err, "ID3D12Device::CreateCommandAllocator"))?;
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }
        .map_err(|err| creation_failed(err, "ID3D12Device::CreateCommandList"))?;
        // Lists are created open; every capture starts with a reset.
        unsafe { list.Close() }
            .map_err(|err| creation_failed(err, "ID3D12GraphicsCommandList::Close"))?;

        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .map_err(|err| creation_failed(err, "ID3D12Device::CreateFence"))?;

        tracing::debug!(capacity, "created D3D12 readback resources");
        Ok(Self {
            device: device.clone(),
            buffer,
            capacity,
            allocator,
            list,
            fence,
            fence_value: 0,
            event: EventHandle::new()?,
        })
    }

    fn fits(&self, device: &ID3D12Device, required: u64) -> bool {
        self.device.as_raw() == device.as_raw() && self.capacity >= required
    }

    fn record_copy(
        &self,
        back_buffer: &ID3D12Resource,
        footprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT,
    ) -> CaptureResult<()> {
        unsafe { self.allocator.Reset() }
            .map_err(|err| sync_failed(err, "ID3D12CommandAllocator::Reset"))?;
        unsafe { self.list.Reset(&self.allocator, None) }
            .map_err(|err| sync_failed(err, "ID3D12GraphicsCommandList::Reset"))?;

        let dst = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { std::mem::transmute_copy(&self.buffer) },
            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: footprint,
            },
        };
        let src = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { std::mem::transmute_copy(back_buffer) },
            Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                SubresourceIndex: 0,
            },
        };

        unsafe {
            self.list.ResourceBarrier(&[transition_barrier(
                back_buffer,
                D3D12_RESOURCE_STATE_PRESENT,
                D3D12_RESOURCE_STATE_COPY_SOURCE,
            )]);
            self.list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);
            self.list.ResourceBarrier(&[transition_barrier(
                back_buffer,
                D3D12_RESOURCE_STATE_COPY_SOURCE,
                D3D12_RESOURCE_STATE_PRESENT,
            )]);
        }
        unsafe { self.list.Close() }
            .map_err(|err| sync_failed(err, "ID3D12GraphicsCommandList::Close"))
    }

    /// Submit the recorded copy on the host queue and wait for it.
    fn submit_and_wait(&mut self, queue: &ID3D12CommandQueue) -> CaptureResult<()> {
        let list: ID3D12CommandList = self
            .list
            .cast()
            .map_err(|err| sync_failed(err, "command list as ID3D12CommandList"))?;
        unsafe { queue.ExecuteCommandLists(&[Some(list)]) };

        self.fence_value += 1;
        unsafe { queue.Signal(&self.fence, self.fence_value) }
            .map_err(|err| sync_failed(err, "ID3D12CommandQueue::Signal"))?;

        if unsafe { self.fence.GetCompletedValue() } < self.fence_value {
            unsafe { self.fence.SetEventOnCompletion(self.fence_value, self.event.0) }
                .map_err(|err| sync_failed(err, "ID3D12Fence::SetEventOnCompletion"))?;
            let wait = unsafe { WaitForSingleObject(self.event.0, INFINITE) };
            if wait != WAIT_OBJECT_0 {
                return Err(CaptureError::Synchronization(anyhow::anyhow!(
                    "waiting for the readback fence returned {:#x}",
                    wait.0
                )));
            }
        }
        Ok(())
    }

    fn read(
        &self,
        footprint: &D3D12_PLACED_SUBRESOURCE_FOOTPRINT,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> CaptureResult<RawFrame> {
        let read_range = D3D12_RANGE {
            Begin: 0,
            End: self.capacity as usize,
        };
        let mut data: *mut c_void = std::ptr::null_mut();
        unsafe { self.buffer.Map(0, Some(&read_range), Some(&mut data)) }
            .map_err(|err| mapping_failed(err, "ID3D12Resource::Map(readback)"))?;

        let frame = unsafe {
            RawFrame::copy_from_mapped(
                (data as *const u8).wrapping_add(footprint.Offset as usize),
                width,
                height,
                footprint.Footprint.RowPitch as usize,
                format,
            )
        };

        let written = D3D12_RANGE { Begin: 0, End: 0 };
        unsafe { self.buffer.Unmap(0, Some(&written)) };
        frame
    }
}

/// Reads the current back buffer through the host's own command queue.
pub struct D3D12Pipeline {
    command_queue_offset: usize,
    readback: Option<Readback>,
}

impl D3D12Pipeline {
    pub(crate) fn new(command_queue_offset: usize) -> Self {
        Self {
            command_queue_offset,
            readback: None,
        }
    }

    fn ensure_readback(
        &mut self,
        device: &ID3D12Device,
        required: u64,
    ) -> CaptureResult<&mut Readback> {
        if let Some(existing) = self.readback.take() {
            if existing.fits(device, required) {
                return Ok(self.readback.insert(existing));
            }
        }
        Ok(self.readback.insert(Readback::create(device, required)?))
    }

    pub(crate) fn capture(&mut self, swap_chain: &IDXGISwapChain) -> CaptureResult<RawFrame> {
        let swap_chain3 = ensure_d3d12_swap_chain(swap_chain)?;
        let queue = unsafe { host_command_queue(swap_chain, self.command_queue_offset)? };

        let index = unsafe { swap_chain3.GetCurrentBackBufferIndex() };
        let back_buffer: ID3D12Resource = unsafe { swap_chain.GetBuffer(index) }
            .map_err(|err| creation_failed(err, "IDXGISwapChain::GetBuffer"))?;

        let mut device: Option<ID3D12Device> = None;
        unsafe { queue.GetDevice(&mut device) }
            .map_err(|err| creation_failed(err, "ID3D12CommandQueue::GetDevice"))?;
        let device = device.ok_or_else(|| {
            CaptureError::ResourceCreation(anyhow::anyhow!("command queue returned no device"))
        })?;

        let desc = unsafe { back_buffer.GetDesc() };
        ensure_single_sampled(&desc.SampleDesc)?;
        let format = pixel_format(desc.Format)?;
        let width = u32::try_from(desc.Width).map_err(|_| CaptureError::BufferOverflow)?;
        let height = desc.Height;

        let mut footprint = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
        let mut total_bytes = 0u64;
        unsafe {
            device.GetCopyableFootprints(
                &desc,
                0,
                1,
                0,
                Some(&mut footprint),
                None,
                None,
                Some(&mut total_bytes),
            )
        };
        if total_bytes == 0 || total_bytes == u64::MAX {
            return Err(CaptureError::UnsupportedFormat(format!(
                "no copyable footprint for {:?}",
                desc.Format
            )));
        }

        let readback = self.ensure_readback(&device, total_bytes)?;
        readback.record_copy(&back_buffer, footprint)?;
        readback.submit_and_wait(&queue)?;
        readback.read(&footprint, width, height, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::windows::d3d11::D3D11Bootstrap;
    use crate::platform::windows::window::HiddenWindow;

    #[test]
    fn refuses_d3d11_swap_chains_before_reading_a_queue() {
        let window = HiddenWindow::create("present-hook d3d12 test", 64, 64).unwrap();
        let bootstrap =
            D3D11Bootstrap::create(window.hwnd(), 64, 64, &AdapterPolicy::software_first())
                .unwrap();

        // Far outside any swap chain object; reading it would fault.
        let mut pipeline = D3D12Pipeline::new(0x4000_0000);
        let err = pipeline.capture(bootstrap.swap_chain()).unwrap_err();
        assert!(matches!(err, CaptureError::ResourceCreation(_)));
        assert!(err.chain_message().contains("D3D11 device"), "{}", err.chain_message());
    }
}
