use anyhow::{Context, Result};
use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE, D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11RenderTargetView,
    ID3D11Texture2D, D3D11_BIND_SHADER_RESOURCE, D3D11_BOX, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_SDK_VERSION, D3D11_SUBRESOURCE_DATA, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIFactory2, IDXGISwapChain1, DXGI_PRESENT,
    DXGI_SWAP_CHAIN_DESC1, DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL, DXGI_USAGE_RENDER_TARGET_OUTPUT,
};

use crate::pattern::{checkerboard_rgba, Scroller};
use crate::{Renderer, CLEAR_COLOR, PICTURE_TOP, PICTURE_WIDTH};

pub struct D3D11Renderer {
    context: ID3D11DeviceContext,
    swap_chain: IDXGISwapChain1,
    back_buffer: ID3D11Texture2D,
    render_target: ID3D11RenderTargetView,
    picture: ID3D11Texture2D,
    scroller: Scroller,
    _device: ID3D11Device,
}

fn create_device(driver_type: D3D_DRIVER_TYPE) -> Result<(ID3D11Device, ID3D11DeviceContext)> {
    let mut device = None;
    let mut context = None;
    unsafe {
        D3D11CreateDevice(
            None::<&IDXGIAdapter>,
            driver_type,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
    }?;
    Ok((
        device.context("no D3D11 device")?,
        context.context("no D3D11 device context")?,
    ))
}

impl D3D11Renderer {
    pub fn new(hwnd: HWND, width: u32, height: u32) -> Result<Self> {
        let (device, context) = create_device(D3D_DRIVER_TYPE_HARDWARE)
            .or_else(|err| {
                tracing::warn!(error = %err, "hardware D3D11 device unavailable, using WARP");
                create_device(D3D_DRIVER_TYPE_WARP)
            })
            .context("D3D11CreateDevice failed")?;

        let factory: IDXGIFactory2 = unsafe {
            let adapter: IDXGIAdapter = device.cast::<IDXGIDevice>()?.GetParent()?;
            adapter.GetParent()?
        };
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
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL,
            ..Default::default()
        };
        let swap_chain = unsafe { factory.CreateSwapChainForHwnd(&device, hwnd, &desc, None, None) }
            .context("CreateSwapChainForHwnd failed")?;

        let back_buffer: ID3D11Texture2D = unsafe { swap_chain.GetBuffer(0) }?;
        let mut render_target = None;
        unsafe { device.CreateRenderTargetView(&back_buffer, None, Some(&mut render_target)) }
            .context("CreateRenderTargetView failed")?;

        let pixels = checkerboard_rgba(PICTURE_WIDTH);
        let picture_desc = D3D11_TEXTURE2D_DESC {
            Width: PICTURE_WIDTH,
            Height: PICTURE_WIDTH,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let initial = D3D11_SUBRESOURCE_DATA {
            pSysMem: pixels.as_ptr().cast(),
            SysMemPitch: PICTURE_WIDTH * 4,
            SysMemSlicePitch: 0,
        };
        let mut picture = None;
        unsafe { device.CreateTexture2D(&picture_desc, Some(&initial), Some(&mut picture)) }
            .context("CreateTexture2D(picture) failed")?;

        Ok(Self {
            context,
            swap_chain,
            back_buffer,
            render_target: render_target.context("no render target view")?,
            picture: picture.context("no picture texture")?,
            scroller: Scroller::new(PICTURE_WIDTH, width),
            _device: device,
        })
    }
}

impl Renderer for D3D11Renderer {
    fn render(&mut self) -> Result<()> {
        unsafe {
            self.context
                .ClearRenderTargetView(&self.render_target, &CLEAR_COLOR);
            if let Some(span) = self.scroller.span() {
                let src = D3D11_BOX {
                    left: span.src_x,
                    top: 0,
                    front: 0,
                    right: span.src_x + span.width,
                    bottom: PICTURE_WIDTH,
                    back: 1,
                };
                self.context.CopySubresourceRegion(
                    &self.back_buffer,
                    0,
                    span.dst_x,
                    PICTURE_TOP,
                    0,
                    &self.picture,
                    0,
                    Some(&src),
                );
            }
            self.swap_chain.Present(1, DXGI_PRESENT(0)).ok()?;
        }
        self.scroller.advance();
        Ok(())
    }
}
