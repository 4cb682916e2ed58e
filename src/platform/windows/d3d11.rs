use anyhow::{Context, Result};
use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE, D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_REFERENCE, D3D_DRIVER_TYPE_WARP,
    D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_11_0,
    D3D_FEATURE_LEVEL_9_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_CPU_ACCESS_WRITE, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE_STAGING, D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Resource,
    ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIFactory2, IDXGISwapChain, DXGI_SWAP_CHAIN_DESC1,
    DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL, DXGI_USAGE_RENDER_TARGET_OUTPUT,
};

use crate::backend::{select_adapter, AdapterCandidate, AdapterPolicy, AdapterPreference};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::RawFrame;

use super::surface::{ensure_single_sampled, pixel_format};
use super::{creation_failed, mapping_failed};

const FEATURE_LEVELS: [D3D_FEATURE_LEVEL; 4] = [
    D3D_FEATURE_LEVEL_11_0,
    D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_10_0,
    D3D_FEATURE_LEVEL_9_1,
];

fn driver_candidates(policy: &AdapterPolicy) -> Vec<AdapterCandidate<D3D_DRIVER_TYPE>> {
    let candidate = |preference, driver_type: D3D_DRIVER_TYPE, label: &str| AdapterCandidate {
        preference,
        key: driver_type.0 as u64,
        label: label.to_string(),
        adapter: driver_type,
    };

    let mut candidates = Vec::new();
    for preference in policy.effective_priority() {
        match preference {
            AdapterPreference::HighPerformance | AdapterPreference::Hardware => {
                candidates.push(candidate(preference, D3D_DRIVER_TYPE_HARDWARE, "hardware"));
            }
            AdapterPreference::Software => {
                candidates.push(candidate(preference, D3D_DRIVER_TYPE_WARP, "warp"));
                candidates.push(candidate(preference, D3D_DRIVER_TYPE_REFERENCE, "reference"));
            }
        }
    }
    candidates
}

fn create_d3d11_device(
    driver_type: D3D_DRIVER_TYPE,
) -> Result<(ID3D11Device, ID3D11DeviceContext)> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;

    unsafe {
        D3D11CreateDevice(
            None::<&IDXGIAdapter>,
            driver_type,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&FEATURE_LEVELS),
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
    }
    .context("D3D11CreateDevice failed")?;

    let device = device.context("D3D11CreateDevice did not return a device")?;
    let context = context.context("D3D11CreateDevice did not return a device context")?;
    Ok((device, context))
}

/// Throwaway D3D11 device and swap chain used to locate `Present`.
pub(crate) struct D3D11Bootstrap {
    swap_chain: IDXGISwapChain,
    _context: ID3D11DeviceContext,
    _device: ID3D11Device,
}

impl D3D11Bootstrap {
    pub(crate) fn create(
        hwnd: HWND,
        width: u32,
        height: u32,
        policy: &AdapterPolicy,
    ) -> CaptureResult<Self> {
        let (chosen, (device, context)) =
            select_adapter(driver_candidates(policy), |candidate| {
                create_d3d11_device(candidate.adapter)
                    .map_err(CaptureError::ResourceCreation)
            })?;
        tracing::debug!(driver = %chosen.label, "bootstrap D3D11 device created");

        let swap_chain = create_swap_chain(&device, hwnd, width, height)
            .map_err(CaptureError::ResourceCreation)?;
        Ok(Self {
            swap_chain,
            _context: context,
            _device: device,
        })
    }

    pub(crate) fn swap_chain(&self) -> &IDXGISwapChain {
        &self.swap_chain
    }
}

fn create_swap_chain(
    device: &ID3D11Device,
    hwnd: HWND,
    width: u32,
    height: u32,
) -> Result<IDXGISwapChain> {
    let dxgi_device: IDXGIDevice = device
        .cast()
        .context("failed to query IDXGIDevice from the D3D11 device")?;
    let adapter: IDXGIAdapter =
        unsafe { dxgi_device.GetParent() }.context("IDXGIDevice::GetParent(IDXGIAdapter) failed")?;
    let factory: IDXGIFactory2 =
        unsafe { adapter.GetParent() }.context("IDXGIAdapter::GetParent(IDXGIFactory2) failed")?;

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

    let swap_chain = unsafe { factory.CreateSwapChainForHwnd(device, hwnd, &desc, None, None) }
        .context("IDXGIFactory2::CreateSwapChainForHwnd failed")?;
    swap_chain
        .cast()
        .context("failed to query IDXGISwapChain from IDXGISwapChain1")
}

/// Staging texture kept between frames while the device and back buffer
/// layout stay the same.
struct StagingTexture {
    device: ID3D11Device,
    texture: ID3D11Texture2D,
    resource: ID3D11Resource,
    desc: D3D11_TEXTURE2D_DESC,
}

impl StagingTexture {
    fn matches(&self, device: &ID3D11Device, src: &D3D11_TEXTURE2D_DESC) -> bool {
        self.device.as_raw() == device.as_raw()
            && self.desc.Width == src.Width
            && self.desc.Height == src.Height
            && self.desc.Format == src.Format
    }
}

/// Unmaps the staging texture when dropped.
struct MappedStaging<'a> {
    context: &'a ID3D11DeviceContext,
    resource: &'a ID3D11Resource,
    mapped: D3D11_MAPPED_SUBRESOURCE,
}

impl<'a> MappedStaging<'a> {
    fn map(context: &'a ID3D11DeviceContext, resource: &'a ID3D11Resource) -> CaptureResult<Self> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // Blocks until the copy into the staging texture has finished.
        unsafe { context.Map(resource, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .map_err(|err| mapping_failed(err, "ID3D11DeviceContext::Map(staging)"))?;
        Ok(Self {
            context,
            resource,
            mapped,
        })
    }
}

impl Drop for MappedStaging<'_> {
    fn drop(&mut self) {
        unsafe {
            self.context.Unmap(self.resource, 0);
        }
    }
}

/// Reads back buffer 0 through a staging texture and a blocking map.
#[derive(Default)]
pub struct D3D11Pipeline {
    staging: Option<StagingTexture>,
}

impl D3D11Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_staging(
        &mut self,
        device: &ID3D11Device,
        src: &D3D11_TEXTURE2D_DESC,
    ) -> CaptureResult<&StagingTexture> {
        if let Some(existing) = self.staging.take() {
            if existing.matches(device, src) {
                return Ok(self.staging.insert(existing));
            }
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: src.Width,
            Height: src.Height,
            MipLevels: 1,
            ArraySize: 1,
            Format: src.Format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: (D3D11_CPU_ACCESS_READ.0 | D3D11_CPU_ACCESS_WRITE.0) as u32,
            MiscFlags: 0,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(|err| creation_failed(err, "ID3D11Device::CreateTexture2D(staging)"))?;
        let texture = texture.ok_or_else(|| {
            CaptureError::ResourceCreation(anyhow::anyhow!(
                "CreateTexture2D returned no staging texture"
            ))
        })?;
        let resource: ID3D11Resource = texture
            .cast()
            .map_err(|err| creation_failed(err, "staging texture as ID3D11Resource"))?;
        tracing::debug!(
            width = desc.Width,
            height = desc.Height,
            format = ?desc.Format,
            "created staging texture"
        );

        Ok(self.staging.insert(StagingTexture {
            device: device.clone(),
            texture,
            resource,
            desc,
        }))
    }

    pub(crate) fn capture(&mut self, swap_chain: &IDXGISwapChain) -> CaptureResult<RawFrame> {
        // A process may own several D3D11 devices; the one that created
        // this swap chain is the only one that can read its buffers.
        let device: ID3D11Device = unsafe { swap_chain.GetDevice() }
            .map_err(|err| creation_failed(err, "IDXGISwapChain::GetDevice(ID3D11Device)"))?;
        let context = unsafe { device.GetImmediateContext() }
            .map_err(|err| creation_failed(err, "ID3D11Device::GetImmediateContext"))?;
        let back_buffer: ID3D11Texture2D = unsafe { swap_chain.GetBuffer(0) }
            .map_err(|err| creation_failed(err, "IDXGISwapChain::GetBuffer(0)"))?;

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { back_buffer.GetDesc(&mut desc) };
        ensure_single_sampled(&desc.SampleDesc)?;
        let format = pixel_format(desc.Format)?;

        let staging = self.ensure_staging(&device, &desc)?;
        unsafe { context.CopyResource(&staging.texture, &back_buffer) };

        let mapped = MappedStaging::map(&context, &staging.resource)?;
        unsafe {
            RawFrame::copy_from_mapped(
                mapped.mapped.pData as *const u8,
                desc.Width,
                desc.Height,
                mapped.mapped.RowPitch as usize,
                format,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_candidates_follow_policy_order() {
        let candidates = driver_candidates(&AdapterPolicy::software_first());
        let drivers: Vec<D3D_DRIVER_TYPE> = candidates.iter().map(|c| c.adapter).collect();
        assert_eq!(
            drivers,
            vec![
                D3D_DRIVER_TYPE_WARP,
                D3D_DRIVER_TYPE_REFERENCE,
                D3D_DRIVER_TYPE_HARDWARE,
                D3D_DRIVER_TYPE_HARDWARE,
            ]
        );
    }
}
