use std::mem::ManuallyDrop;

use anyhow::{Context, Result};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::{
    D3D12CreateDevice, ID3D12CommandAllocator, ID3D12CommandList, ID3D12CommandQueue,
    ID3D12DescriptorHeap, ID3D12Device, ID3D12Fence, ID3D12GraphicsCommandList, ID3D12Resource,
    D3D12_BOX, D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC,
    D3D12_CPU_DESCRIPTOR_HANDLE, D3D12_DESCRIPTOR_HEAP_DESC, D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
    D3D12_FENCE_FLAG_NONE, D3D12_HEAP_FLAG_NONE, D3D12_HEAP_PROPERTIES, D3D12_HEAP_TYPE_UPLOAD,
    D3D12_PLACED_SUBRESOURCE_FOOTPRINT, D3D12_RANGE, D3D12_RESOURCE_BARRIER,
    D3D12_RESOURCE_BARRIER_0, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
    D3D12_RESOURCE_BARRIER_FLAG_NONE, D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
    D3D12_RESOURCE_DESC, D3D12_RESOURCE_DIMENSION_BUFFER, D3D12_RESOURCE_DIMENSION_TEXTURE2D,
    D3D12_RESOURCE_STATES, D3D12_RESOURCE_STATE_COPY_DEST, D3D12_RESOURCE_STATE_GENERIC_READ,
    D3D12_RESOURCE_STATE_PRESENT, D3D12_RESOURCE_STATE_RENDER_TARGET,
    D3D12_RESOURCE_TRANSITION_BARRIER, D3D12_TEXTURE_COPY_LOCATION,
    D3D12_TEXTURE_COPY_LOCATION_0, D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
    D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX, D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory4, IDXGISwapChain3, DXGI_ADAPTER_FLAG_SOFTWARE,
    DXGI_PRESENT, DXGI_SWAP_CHAIN_DESC1, DXGI_SWAP_EFFECT_FLIP_DISCARD,
    DXGI_USAGE_RENDER_TARGET_OUTPUT,
};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use crate::pattern::{checkerboard_rgba, Scroller};
use crate::{Renderer, CLEAR_COLOR, PICTURE_TOP, PICTURE_WIDTH};

const FRAME_COUNT: u32 = 2;

fn create_device(factory: &IDXGIFactory4) -> Result<ID3D12Device> {
    let mut index = 0;
    while let Ok(adapter) = unsafe { factory.EnumAdapters1(index) } {
        index += 1;
        let desc = unsafe { adapter.GetDesc1() }?;
        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            continue;
        }
        let mut device = None;
        if unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }.is_ok() {
            if let Some(device) = device {
                return Ok(device);
            }
        }
    }

    tracing::warn!("no hardware D3D12 adapter, using WARP");
    let warp: IDXGIAdapter1 = unsafe { factory.EnumWarpAdapter() }?;
    let mut device = None;
    unsafe { D3D12CreateDevice(&warp, D3D_FEATURE_LEVEL_11_0, &mut device) }?;
    device.context("no D3D12 device")
}

fn transition(
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

/// Checkerboard in an upload heap, laid out as a placed footprint so it
/// can be copied straight into a back buffer.
struct UploadedPicture {
    buffer: ID3D12Resource,
    footprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT,
}

impl UploadedPicture {
    fn create(device: &ID3D12Device) -> Result<Self> {
        let texture_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Width: PICTURE_WIDTH as u64,
            Height: PICTURE_WIDTH,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            ..Default::default()
        };
        let mut footprint = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
        let mut total = 0u64;
        unsafe {
            device.GetCopyableFootprints(
                &texture_desc,
                0,
                1,
                0,
                Some(&mut footprint),
                None,
                None,
                Some(&mut total),
            )
        };

        let buffer_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: total,
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
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_UPLOAD,
            ..Default::default()
        };
        let mut buffer: Option<ID3D12Resource> = None;
        unsafe {
            device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &buffer_desc,
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut buffer,
            )
        }
        .context("CreateCommittedResource(upload) failed")?;
        let buffer = buffer.context("no upload buffer")?;

        let pixels = checkerboard_rgba(PICTURE_WIDTH);
        let row_bytes = PICTURE_WIDTH as usize * 4;
        let row_pitch = footprint.Footprint.RowPitch as usize;
        let mut mapped: *mut std::ffi::c_void = std::ptr::null_mut();
        unsafe {
            buffer.Map(0, Some(&D3D12_RANGE { Begin: 0, End: 0 }), Some(&mut mapped))?;
            let base = (mapped as *mut u8).add(footprint.Offset as usize);
            for (y, row) in pixels.chunks_exact(row_bytes).enumerate() {
                std::ptr::copy_nonoverlapping(row.as_ptr(), base.add(y * row_pitch), row_bytes);
            }
            buffer.Unmap(0, None);
        }

        Ok(Self { buffer, footprint })
    }
}

pub struct D3D12Renderer {
    queue: ID3D12CommandQueue,
    swap_chain: IDXGISwapChain3,
    back_buffers: Vec<ID3D12Resource>,
    rtv_heap: ID3D12DescriptorHeap,
    rtv_increment: usize,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    fence: ID3D12Fence,
    fence_value: u64,
    fence_event: HANDLE,
    picture: UploadedPicture,
    scroller: Scroller,
    _device: ID3D12Device,
}

impl D3D12Renderer {
    pub fn new(hwnd: HWND, width: u32, height: u32) -> Result<Self> {
        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory1() }?;
        let device = create_device(&factory)?;

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }?;

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: width,
            Height: height,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: FRAME_COUNT,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };
        let swap_chain: IDXGISwapChain3 =
            unsafe { factory.CreateSwapChainForHwnd(&queue, hwnd, &desc, None, None) }
                .context("CreateSwapChainForHwnd failed")?
                .cast()?;

        let rtv_heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                NumDescriptors: FRAME_COUNT,
                ..Default::default()
            })
        }?;
        let rtv_increment =
            unsafe { device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV) }
                as usize;
        let rtv_start = unsafe { rtv_heap.GetCPUDescriptorHandleForHeapStart() };
        let back_buffers = (0..FRAME_COUNT)
            .map(|index| -> Result<ID3D12Resource> {
                let buffer: ID3D12Resource = unsafe { swap_chain.GetBuffer(index) }?;
                let handle = D3D12_CPU_DESCRIPTOR_HANDLE {
                    ptr: rtv_start.ptr + index as usize * rtv_increment,
                };
                unsafe { device.CreateRenderTargetView(&buffer, None, handle) };
                Ok(buffer)
            })
            .collect::<Result<Vec<_>>>()?;

        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }?;
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }?;
        unsafe { list.Close() }?;

        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        let fence_event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }?;

        Ok(Self {
            queue,
            swap_chain,
            back_buffers,
            rtv_heap,
            rtv_increment,
            allocator,
            list,
            fence,
            fence_value: 0,
            fence_event,
            picture: UploadedPicture::create(&device)?,
            scroller: Scroller::new(PICTURE_WIDTH, width),
            _device: device,
        })
    }

    fn record(&self, index: usize) -> Result<()> {
        let back_buffer = &self.back_buffers[index];
        let rtv = D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: unsafe { self.rtv_heap.GetCPUDescriptorHandleForHeapStart() }.ptr
                + index * self.rtv_increment,
        };

        unsafe {
            self.allocator.Reset()?;
            self.list.Reset(&self.allocator, None)?;

            self.list.ResourceBarrier(&[transition(
                back_buffer,
                D3D12_RESOURCE_STATE_PRESENT,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
            )]);
            self.list.ClearRenderTargetView(rtv, &CLEAR_COLOR, None);
            self.list.ResourceBarrier(&[transition(
                back_buffer,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
                D3D12_RESOURCE_STATE_COPY_DEST,
            )]);

            if let Some(span) = self.scroller.span() {
                let dst = D3D12_TEXTURE_COPY_LOCATION {
                    pResource: std::mem::transmute_copy(back_buffer),
                    Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        SubresourceIndex: 0,
                    },
                };
                let src = D3D12_TEXTURE_COPY_LOCATION {
                    pResource: std::mem::transmute_copy(&self.picture.buffer),
                    Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        PlacedFootprint: self.picture.footprint,
                    },
                };
                let region = D3D12_BOX {
                    left: span.src_x,
                    top: 0,
                    front: 0,
                    right: span.src_x + span.width,
                    bottom: PICTURE_WIDTH,
                    back: 1,
                };
                self.list
                    .CopyTextureRegion(&dst, span.dst_x, PICTURE_TOP, 0, &src, Some(&region));
            }

            self.list.ResourceBarrier(&[transition(
                back_buffer,
                D3D12_RESOURCE_STATE_COPY_DEST,
                D3D12_RESOURCE_STATE_PRESENT,
            )]);
            self.list.Close()?;
        }
        Ok(())
    }

    fn wait_for_gpu(&mut self) -> Result<()> {
        self.fence_value += 1;
        unsafe {
            self.queue.Signal(&self.fence, self.fence_value)?;
            if self.fence.GetCompletedValue() < self.fence_value {
                self.fence
                    .SetEventOnCompletion(self.fence_value, self.fence_event)?;
                WaitForSingleObject(self.fence_event, INFINITE);
            }
        }
        Ok(())
    }
}

impl Renderer for D3D12Renderer {
    fn render(&mut self) -> Result<()> {
        let index = unsafe { self.swap_chain.GetCurrentBackBufferIndex() } as usize;
        self.record(index)?;

        let list: ID3D12CommandList = self.list.cast()?;
        unsafe {
            self.queue.ExecuteCommandLists(&[Some(list)]);
            self.swap_chain.Present(1, DXGI_PRESENT(0)).ok()?;
        }
        self.wait_for_gpu()?;
        self.scroller.advance();
        Ok(())
    }
}

impl Drop for D3D12Renderer {
    fn drop(&mut self) {
        let _ = self.wait_for_gpu();
        unsafe {
            let _ = CloseHandle(self.fence_event);
        }
    }
}
