//! In-process capture of frames presented through DXGI swap chains.
//!
//! [`PresentHook`] patches the shared `IDXGISwapChain::Present` of the
//! selected graphics API. Once a capture is armed for a window, the next
//! frames presented into it are copied to CPU memory and written as
//! numbered BMP files before the original `Present` runs.

pub mod backend;
pub mod detour;
pub mod encode;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod hook;
pub mod interceptor;
mod platform;
pub mod request;
pub mod surface;

pub use backend::{
    AdapterPolicy, AdapterPreference, CapturePipeline, GraphicsApi, ResolvedPresent,
    PRESENT_VTABLE_SLOT,
};
pub use error::{CaptureError, CaptureErrorClass, CaptureResult};
pub use frame::{PixelFormat, RawFrame};
pub use hook::{PresentHook, PresentHookBuilder, PresentHookConfig};
pub use interceptor::{FrameInterceptor, InterceptorState};
pub use request::CaptureRequest;
pub use surface::SurfaceId;

#[cfg(target_os = "windows")]
pub use platform::windows::{D3D11Pipeline, D3D12Pipeline, SwapChainPipeline};
