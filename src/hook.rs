use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::backend::{AdapterPolicy, CapturePipeline, GraphicsApi, ResolvedPresent};
use crate::detour::{BinaryInterceptor, InlineDetour, TrampolineHandle};
use crate::error::{CaptureError, CaptureResult};
use crate::interceptor::{FrameInterceptor, InterceptorState};
use crate::platform::NativePresent;
use crate::request::CaptureRequest;
use crate::surface::SurfaceId;

const DEFAULT_BOOTSTRAP_WIDTH: u32 = 800;
const DEFAULT_BOOTSTRAP_HEIGHT: u32 = 600;

#[derive(Clone, Debug)]
pub struct PresentHookConfig {
    pub api: GraphicsApi,
    /// Order in which adapters are tried for the throwaway device.
    pub adapter_policy: AdapterPolicy,
    /// Client size of the hidden window the throwaway swap chain targets.
    pub bootstrap_width: u32,
    pub bootstrap_height: u32,
}

impl Default for PresentHookConfig {
    fn default() -> Self {
        Self {
            api: GraphicsApi::default(),
            adapter_policy: AdapterPolicy::default(),
            bootstrap_width: DEFAULT_BOOTSTRAP_WIDTH,
            bootstrap_height: DEFAULT_BOOTSTRAP_HEIGHT,
        }
    }
}

/// Platform half of the hook: finds `Present`, builds the readback
/// pipeline, and owns the replacement function together with the slot it
/// dispatches through.
pub(crate) trait PresentPlatform {
    type Pipeline: CapturePipeline + 'static;

    fn resolve(config: &PresentHookConfig) -> CaptureResult<ResolvedPresent>;

    fn create_pipeline(
        config: &PresentHookConfig,
        resolved: &ResolvedPresent,
    ) -> CaptureResult<Self::Pipeline>;

    /// Address of the function that replaces `Present`.
    fn replacement() -> usize;

    /// The one slot the replacement reads. A raw function pointer carries
    /// no context, so this is the only process-wide state.
    fn slot() -> &'static OnceLock<HookSlot<Self::Pipeline>>;
}

/// Everything the replacement needs to handle a call.
pub(crate) struct HookSlot<P> {
    trampoline: usize,
    interceptor: Arc<FrameInterceptor<P>>,
    patch: Mutex<TrampolineHandle>,
}

impl<P> HookSlot<P> {
    /// Entry point of the original `Present`.
    pub(crate) fn trampoline(&self) -> usize {
        self.trampoline
    }

    pub(crate) fn interceptor(&self) -> &FrameInterceptor<P> {
        &self.interceptor
    }

    fn patch(&self) -> MutexGuard<'_, TrampolineHandle> {
        self.patch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_enabled(&self) -> bool {
        self.patch().is_installed()
    }
}

fn already_installed() -> CaptureError {
    CaptureError::Patch("already installed".to_string())
}

/// Resolve, build the trampoline and publish the slot. The patch stays
/// disabled until [`enable_patch`], so the slot is visible before the first
/// redirected call can happen.
fn install<Pl: PresentPlatform>(
    config: &PresentHookConfig,
    detour: &dyn BinaryInterceptor,
) -> CaptureResult<&'static HookSlot<Pl::Pipeline>> {
    let slot = Pl::slot();
    if slot.get().is_some() {
        return Err(already_installed());
    }

    let resolved = Pl::resolve(config)?;
    tracing::debug!(
        present = format_args!("{:#x}", resolved.address),
        command_queue_offset = ?resolved.command_queue_offset,
        "resolved Present"
    );
    let pipeline = Pl::create_pipeline(config, &resolved)?;
    let handle = unsafe { detour.prepare(resolved.address, Pl::replacement())? };

    slot.set(HookSlot {
        trampoline: handle.trampoline_address(),
        interceptor: Arc::new(FrameInterceptor::new(pipeline)),
        patch: Mutex::new(handle),
    })
    .map_err(|_| already_installed())?;
    slot.get().ok_or_else(already_installed)
}

fn enable_patch<P>(installed: &HookSlot<P>) -> CaptureResult<()> {
    let patch = installed.patch();
    if patch.is_installed() {
        return Err(already_installed());
    }
    unsafe { patch.enable() }
}

/// Publish the slot on first use, then enable the patch. The slot is kept
/// even when enabling fails, so a retry only repeats the patch.
fn hook_slot<Pl: PresentPlatform>(
    installed: &mut Option<&'static HookSlot<Pl::Pipeline>>,
    config: &PresentHookConfig,
    detour: &dyn BinaryInterceptor,
) -> CaptureResult<()> {
    let slot = match *installed {
        Some(slot) => slot,
        None => *installed.insert(install::<Pl>(config, detour)?),
    };
    enable_patch(slot)
}

fn not_hooked() -> CaptureError {
    CaptureError::InvalidConfig("present hook is not installed; call hook() first".to_string())
}

pub struct PresentHookBuilder {
    config: PresentHookConfig,
}

impl PresentHookBuilder {
    pub fn new() -> Self {
        Self {
            config: PresentHookConfig::default(),
        }
    }

    pub fn api(mut self, api: GraphicsApi) -> Self {
        self.config.api = api;
        self
    }

    pub fn adapter_policy(mut self, adapter_policy: AdapterPolicy) -> Self {
        self.config.adapter_policy = adapter_policy;
        self
    }

    pub fn bootstrap_size(mut self, width: u32, height: u32) -> Self {
        self.config.bootstrap_width = width;
        self.config.bootstrap_height = height;
        self
    }

    pub fn build(self) -> CaptureResult<PresentHook> {
        if self.config.bootstrap_width == 0 || self.config.bootstrap_height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "bootstrap window must have a non-empty client area, got {}x{}",
                self.config.bootstrap_width, self.config.bootstrap_height
            )));
        }
        Ok(PresentHook {
            config: self.config,
            installed: None,
        })
    }
}

impl Default for PresentHookBuilder {
    fn default() -> Self {
        Self::new()
    }
}

type NativeSlot = HookSlot<<NativePresent as PresentPlatform>::Pipeline>;

/// Captures frames presented by any swap chain of the selected graphics
/// API in this process.
///
/// Only one hook can be installed per process. Installing patches the
/// shared `Present` code; a thread that is executing its first
/// instructions at that moment is not synchronized with the patch.
pub struct PresentHook {
    config: PresentHookConfig,
    installed: Option<&'static NativeSlot>,
}

impl PresentHook {
    pub fn builder() -> PresentHookBuilder {
        PresentHookBuilder::new()
    }

    pub fn new(api: GraphicsApi) -> CaptureResult<Self> {
        Self::builder().api(api).build()
    }

    pub fn config(&self) -> &PresentHookConfig {
        &self.config
    }

    /// Redirect `Present` through the capture path. After
    /// [`unhook`](Self::unhook) this re-enables the same redirect.
    #[tracing::instrument(skip(self), fields(api = self.config.api.as_str()))]
    pub fn hook(&mut self) -> CaptureResult<()> {
        hook_slot::<NativePresent>(&mut self.installed, &self.config, &InlineDetour)?;
        tracing::info!("present hook installed");
        Ok(())
    }

    /// Restore the original `Present`. Captures stop; an armed request
    /// stays armed until the hook is enabled again or it is cancelled.
    pub fn unhook(&mut self) -> CaptureResult<()> {
        if let Some(installed) = self.installed {
            unsafe { installed.patch().uninstall()? };
            tracing::info!("present hook removed");
        }
        Ok(())
    }

    pub fn is_hooked(&self) -> bool {
        self.installed.is_some_and(HookSlot::is_enabled)
    }

    /// Arm a capture of the next `max_frames` frames presented into
    /// `target`, written as `<output_dir><n>.bmp`.
    pub fn capture_frames(
        &self,
        target: SurfaceId,
        output_dir: &str,
        max_frames: u32,
    ) -> CaptureResult<()> {
        self.installed
            .ok_or_else(not_hooked)?
            .interceptor()
            .capture_frames(target, output_dir, max_frames)
    }

    pub fn state(&self) -> InterceptorState {
        self.installed
            .map_or(InterceptorState::Idle, |installed| installed.interceptor().state())
    }

    pub fn request(&self) -> Option<CaptureRequest> {
        self.installed
            .and_then(|installed| installed.interceptor().request())
    }

    pub fn cancel(&self) -> bool {
        self.installed
            .is_some_and(|installed| installed.interceptor().cancel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;

    struct MockSwapChain {
        window: isize,
    }

    struct MockPipeline;

    impl CapturePipeline for MockPipeline {
        type Source = MockSwapChain;

        fn surface_id(&self, source: &MockSwapChain) -> Option<SurfaceId> {
            Some(SurfaceId::from_raw_handle(source.window))
        }

        fn capture_frame(&mut self, _source: &MockSwapChain) -> CaptureResult<RawFrame> {
            RawFrame::from_rgba8(1, 1, vec![1, 2, 3, 255])
        }
    }

    struct UnresolvablePlatform;

    impl PresentPlatform for UnresolvablePlatform {
        type Pipeline = MockPipeline;

        fn resolve(_config: &PresentHookConfig) -> CaptureResult<ResolvedPresent> {
            Err(CaptureError::ResourceCreation(anyhow::anyhow!("no swap chain")))
        }

        fn create_pipeline(
            _config: &PresentHookConfig,
            _resolved: &ResolvedPresent,
        ) -> CaptureResult<MockPipeline> {
            Ok(MockPipeline)
        }

        fn replacement() -> usize {
            0
        }

        fn slot() -> &'static OnceLock<HookSlot<MockPipeline>> {
            static SLOT: OnceLock<HookSlot<MockPipeline>> = OnceLock::new();
            &SLOT
        }
    }

    #[test]
    fn builder_rejects_empty_bootstrap_window() {
        assert!(matches!(
            PresentHook::builder().bootstrap_size(0, 600).build(),
            Err(CaptureError::InvalidConfig(_))
        ));
        let hook = PresentHook::builder()
            .api(GraphicsApi::D3D12)
            .bootstrap_size(64, 64)
            .build()
            .unwrap();
        assert_eq!(hook.config().api, GraphicsApi::D3D12);
        assert_eq!(hook.config().bootstrap_width, 64);
    }

    #[test]
    fn capture_before_hook_is_rejected() {
        let hook = PresentHook::new(GraphicsApi::D3D11).unwrap();
        assert!(!hook.is_hooked());
        assert_eq!(hook.state(), InterceptorState::Idle);
        assert!(matches!(
            hook.capture_frames(SurfaceId::from_raw_handle(1), "", 1),
            Err(CaptureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn failed_resolution_leaves_the_slot_empty() {
        let err = install::<UnresolvablePlatform>(&PresentHookConfig::default(), &InlineDetour)
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::ResourceCreation(_)));
        assert!(UnresolvablePlatform::slot().get().is_none());
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    mod redirected {
        use super::*;
        use crate::encode::tests::scratch_dir;

        type PresentFn = extern "C" fn(*const MockSwapChain, u32) -> i32;

        #[inline(never)]
        extern "C" fn mock_present(chain: *const MockSwapChain, sync_interval: u32) -> i32 {
            let chain = std::hint::black_box(chain);
            std::hint::black_box(sync_interval as i32 + 100 + (chain.is_null() as i32))
        }

        extern "C" fn mock_present_detour(chain: *const MockSwapChain, sync_interval: u32) -> i32 {
            let slot = MockPlatform::slot().get().unwrap();
            let original: PresentFn = unsafe { std::mem::transmute(slot.trampoline()) };
            let source = unsafe { &*chain };
            slot.interceptor()
                .on_present(source, || original(chain, sync_interval))
        }

        struct MockPlatform;

        impl PresentPlatform for MockPlatform {
            type Pipeline = MockPipeline;

            fn resolve(_config: &PresentHookConfig) -> CaptureResult<ResolvedPresent> {
                Ok(ResolvedPresent {
                    address: mock_present as usize,
                    command_queue_offset: None,
                })
            }

            fn create_pipeline(
                _config: &PresentHookConfig,
                _resolved: &ResolvedPresent,
            ) -> CaptureResult<MockPipeline> {
                Ok(MockPipeline)
            }

            fn replacement() -> usize {
                mock_present_detour as usize
            }

            fn slot() -> &'static OnceLock<HookSlot<MockPipeline>> {
                static SLOT: OnceLock<HookSlot<MockPipeline>> = OnceLock::new();
                &SLOT
            }
        }

        #[test]
        fn hooked_present_captures_and_forwards() -> CaptureResult<()> {
            let present: PresentFn = std::hint::black_box(mock_present);
            let target = MockSwapChain { window: 77 };
            let other = MockSwapChain { window: 78 };
            let dir = scratch_dir("hook");
            let prefix = format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR);

            let config = PresentHookConfig::default();
            let mut slot = None;
            hook_slot::<MockPlatform>(&mut slot, &config, &InlineDetour)?;
            let installed = slot.unwrap();
            assert!(installed.is_enabled());
            assert!(matches!(
                install::<MockPlatform>(&config, &InlineDetour),
                Err(CaptureError::Patch(_))
            ));
            assert!(matches!(
                hook_slot::<MockPlatform>(&mut slot, &config, &InlineDetour),
                Err(CaptureError::Patch(_))
            ));

            installed
                .interceptor()
                .capture_frames(SurfaceId::from_raw_handle(77), &prefix, 2)?;
            assert_eq!(present(&other, 1), 101);
            assert_eq!(present(&target, 1), 101);
            assert_eq!(present(&target, 0), 100);
            assert_eq!(present(&target, 0), 100);
            assert_eq!(installed.interceptor().state(), InterceptorState::Idle);
            assert!(dir.join("0.bmp").exists());
            assert!(dir.join("1.bmp").exists());
            assert!(!dir.join("2.bmp").exists());

            unsafe { installed.patch().uninstall()? };
            assert!(!installed.is_enabled());
            installed
                .interceptor()
                .capture_frames(SurfaceId::from_raw_handle(77), &prefix, 1)?;
            assert_eq!(present(&target, 2), 102);
            assert_eq!(installed.interceptor().state(), InterceptorState::Armed);

            enable_patch(installed)?;
            assert_eq!(present(&target, 2), 102);
            assert_eq!(installed.interceptor().state(), InterceptorState::Idle);
            assert!(dir.join("2.bmp").exists());

            unsafe { installed.patch().uninstall()? };
            Ok(())
        }

        #[inline(never)]
        extern "C" fn guarded_present(chain: *const MockSwapChain, sync_interval: u32) -> i32 {
            let chain = std::hint::black_box(chain);
            std::hint::black_box(sync_interval as i32 + 200 + (chain.is_null() as i32))
        }

        extern "C" fn guarded_present_detour(
            chain: *const MockSwapChain,
            sync_interval: u32,
        ) -> i32 {
            let slot = GuardedPlatform::slot().get().unwrap();
            let original: PresentFn = unsafe { std::mem::transmute(slot.trampoline()) };
            let source = unsafe { &*chain };
            slot.interceptor()
                .on_present(source, || original(chain, sync_interval))
        }

        /// Present whose first patch attempt is refused.
        struct GuardedPlatform;

        impl PresentPlatform for GuardedPlatform {
            type Pipeline = MockPipeline;

            fn resolve(_config: &PresentHookConfig) -> CaptureResult<ResolvedPresent> {
                Ok(ResolvedPresent {
                    address: guarded_present as usize,
                    command_queue_offset: None,
                })
            }

            fn create_pipeline(
                _config: &PresentHookConfig,
                _resolved: &ResolvedPresent,
            ) -> CaptureResult<MockPipeline> {
                Ok(MockPipeline)
            }

            fn replacement() -> usize {
                guarded_present_detour as usize
            }

            fn slot() -> &'static OnceLock<HookSlot<MockPipeline>> {
                static SLOT: OnceLock<HookSlot<MockPipeline>> = OnceLock::new();
                &SLOT
            }
        }

        struct RefusingDetour;

        impl BinaryInterceptor for RefusingDetour {
            unsafe fn prepare(
                &self,
                target: usize,
                replacement: usize,
            ) -> CaptureResult<TrampolineHandle> {
                let handle = unsafe { InlineDetour.prepare(target, replacement)? };
                Ok(handle.refusing_next_enable())
            }
        }

        #[test]
        fn failed_patch_can_be_retried() -> CaptureResult<()> {
            let present: PresentFn = std::hint::black_box(guarded_present);
            let target = MockSwapChain { window: 5 };
            let config = PresentHookConfig::default();
            let mut slot = None;

            let err =
                hook_slot::<GuardedPlatform>(&mut slot, &config, &RefusingDetour).unwrap_err();
            assert!(matches!(err, CaptureError::Patch(_)));
            assert!(!err.to_string().contains("already installed"), "{err}");
            let installed = slot.unwrap();
            assert!(!installed.is_enabled());
            assert_eq!(present(&target, 1), 201);

            hook_slot::<GuardedPlatform>(&mut slot, &config, &RefusingDetour)?;
            assert!(installed.is_enabled());
            assert_eq!(present(&target, 1), 201);

            let dir = scratch_dir("hook-retry");
            let prefix = format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR);
            installed
                .interceptor()
                .capture_frames(SurfaceId::from_raw_handle(5), &prefix, 1)?;
            assert_eq!(present(&target, 3), 203);
            assert!(dir.join("0.bmp").exists());

            unsafe { installed.patch().uninstall()? };
            Ok(())
        }
    }
}
