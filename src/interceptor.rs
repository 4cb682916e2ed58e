use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::CapturePipeline;
use crate::encode::FrameSink;
use crate::error::{CaptureError, CaptureResult};
use crate::request::CaptureRequest;
use crate::surface::SurfaceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterceptorState {
    /// No request, or the last request already captured all its frames.
    Idle,
    Armed,
}

struct Inner<P> {
    request: Option<CaptureRequest>,
    pipeline: P,
    sink: FrameSink,
}

/// Decides per present call whether to capture, and always forwards.
///
/// The request, the pipeline and the file counter share one lock, so
/// arming from an application thread never races the render thread that
/// is reading the request.
pub struct FrameInterceptor<P> {
    inner: Mutex<Inner<P>>,
}

impl<P: CapturePipeline> FrameInterceptor<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            inner: Mutex::new(Inner {
                request: None,
                pipeline,
                sink: FrameSink::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        // A panic inside a capture leaves the state consistent enough to
        // keep going; the request is re-checked on every call.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a capture of the next `max_frames` presents into `target`.
    pub fn capture_frames(
        &self,
        target: SurfaceId,
        output_dir: &str,
        max_frames: u32,
    ) -> CaptureResult<()> {
        let mut inner = self.lock();
        if inner.request.as_ref().is_some_and(|request| request.active) {
            return Err(CaptureError::Busy);
        }
        if max_frames == 0 {
            return Err(CaptureError::InvalidConfig(
                "max_frames must be at least 1".to_string(),
            ));
        }
        let request = CaptureRequest::new(target, output_dir, max_frames);
        tracing::info!(
            surface = %target.stable_id(),
            output_dir = %request.output_dir,
            max_frames,
            "capture armed"
        );
        inner.request = Some(request);
        Ok(())
    }

    pub fn state(&self) -> InterceptorState {
        match &self.lock().request {
            Some(request) if request.active => InterceptorState::Armed,
            _ => InterceptorState::Idle,
        }
    }

    /// Snapshot of the current (or most recently finished) request.
    pub fn request(&self) -> Option<CaptureRequest> {
        self.lock().request.clone()
    }

    /// Disarm without waiting for the remaining frames. Returns whether a
    /// request was active.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        match inner.request.as_mut() {
            Some(request) if request.active => {
                request.active = false;
                tracing::info!(frames = request.frame_index, "capture cancelled");
                true
            }
            _ => false,
        }
    }

    /// Handle one present call: capture when it targets the armed surface,
    /// then run `forward` exactly once and return its result unchanged.
    ///
    /// Nothing from the capture path, including a panic, reaches the
    /// caller. `forward` runs after the lock is released.
    pub fn on_present<R>(&self, source: &P::Source, forward: impl FnOnce() -> R) -> R {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.intercept(source)));
        if outcome.is_err() {
            tracing::error!("frame capture panicked; present forwarded without capture");
        }
        forward()
    }

    fn intercept(&self, source: &P::Source) {
        let mut guard = self.lock();
        let Inner {
            request,
            pipeline,
            sink,
        } = &mut *guard;

        let Some(request) = request.as_mut().filter(|request| request.active) else {
            return;
        };
        let Some(surface) = pipeline.surface_id(source) else {
            tracing::trace!("present source has no output window");
            return;
        };
        if !request.matches(surface) {
            return;
        }

        let frame = match pipeline.capture_frame(source) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(
                    frame = request.frame_index,
                    error = %err.chain_message(),
                    "frame capture failed, skipping"
                );
                return;
            }
        };

        match sink.save(&request.output_dir, &frame) {
            Ok(path) => tracing::debug!(
                path = %path.display(),
                frame = request.frame_index,
                width = frame.width(),
                height = frame.height(),
                "frame saved"
            ),
            Err(err) => tracing::warn!(
                frame = request.frame_index,
                error = %err.chain_message(),
                "failed to write captured frame"
            ),
        }

        request.record_frame();
        if !request.active {
            tracing::info!(frames = request.frame_index, "capture complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::encode::tests::scratch_dir;
    use crate::frame::RawFrame;

    struct MockSwapChain {
        window: isize,
    }

    enum Behavior {
        Succeed,
        FailOnce,
        Panic,
    }

    struct MockPipeline {
        captures: Arc<AtomicUsize>,
        behavior: Behavior,
    }

    impl MockPipeline {
        fn new(behavior: Behavior) -> (Self, Arc<AtomicUsize>) {
            let captures = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    captures: Arc::clone(&captures),
                    behavior,
                },
                captures,
            )
        }
    }

    impl CapturePipeline for MockPipeline {
        type Source = MockSwapChain;

        fn surface_id(&self, source: &MockSwapChain) -> Option<SurfaceId> {
            (source.window != 0).then(|| SurfaceId::from_raw_handle(source.window))
        }

        fn capture_frame(&mut self, _source: &MockSwapChain) -> CaptureResult<RawFrame> {
            let attempt = self.captures.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::FailOnce if attempt == 0 => {
                    return Err(CaptureError::Mapping(anyhow::anyhow!("device removed")));
                }
                Behavior::Panic => panic!("pipeline exploded"),
                _ => {}
            }
            RawFrame::from_rgba8(2, 2, vec![0x80; 16])
        }
    }

    fn dir_prefix(dir: &std::path::Path) -> String {
        format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR)
    }

    fn bmp_files(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort_by_key(|name| name.trim_end_matches(".bmp").parse::<u32>().unwrap_or(u32::MAX));
        names
    }

    #[test]
    fn rejects_second_request_while_armed() -> CaptureResult<()> {
        let dir = scratch_dir("interceptor-busy");
        let (pipeline, captures) = MockPipeline::new(Behavior::Succeed);
        let interceptor = FrameInterceptor::new(pipeline);
        let window = SurfaceId::from_raw_handle(11);

        interceptor.capture_frames(window, &dir_prefix(&dir), 3)?;
        interceptor.on_present(&MockSwapChain { window: 11 }, || ());
        let armed = interceptor.request().unwrap();
        assert_eq!(armed.frame_index, 1);

        let err = interceptor
            .capture_frames(SurfaceId::from_raw_handle(12), "second", 5)
            .unwrap_err();
        assert!(matches!(err, CaptureError::Busy));
        // A zero-frame request is still a second request.
        let err = interceptor
            .capture_frames(SurfaceId::from_raw_handle(12), "second", 0)
            .unwrap_err();
        assert!(matches!(err, CaptureError::Busy));

        assert_eq!(interceptor.request().unwrap(), armed);
        assert_eq!(interceptor.request().unwrap().output_dir, dir_prefix(&dir));
        assert_eq!(interceptor.state(), InterceptorState::Armed);

        interceptor.on_present(&MockSwapChain { window: 11 }, || ());
        assert_eq!(captures.load(Ordering::SeqCst), 2);
        assert_eq!(bmp_files(&dir), vec!["0.bmp".to_string(), "1.bmp".to_string()]);
        Ok(())
    }

    #[test]
    fn zero_frames_is_invalid() {
        let (pipeline, _) = MockPipeline::new(Behavior::Succeed);
        let interceptor = FrameInterceptor::new(pipeline);
        let err = interceptor
            .capture_frames(SurfaceId::from_raw_handle(1), "out", 0)
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidConfig(_)));
        assert_eq!(interceptor.state(), InterceptorState::Idle);
    }

    #[test]
    fn forwards_every_call_and_returns_its_result() {
        let (pipeline, captures) = MockPipeline::new(Behavior::Succeed);
        let interceptor = FrameInterceptor::new(pipeline);
        let forwarded = AtomicUsize::new(0);

        for window in [0, 5, 6] {
            let result = interceptor.on_present(&MockSwapChain { window }, || {
                forwarded.fetch_add(1, Ordering::SeqCst);
                0x887A_0005_u32
            });
            assert_eq!(result, 0x887A_0005);
        }
        assert_eq!(forwarded.load(Ordering::SeqCst), 3);
        assert_eq!(captures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn captures_exactly_max_frames_then_goes_idle() -> CaptureResult<()> {
        let dir = scratch_dir("interceptor");
        let (pipeline, captures) = MockPipeline::new(Behavior::Succeed);
        let interceptor = FrameInterceptor::new(pipeline);
        let target = MockSwapChain { window: 42 };
        let other = MockSwapChain { window: 43 };
        let mut forwarded = 0;

        interceptor.capture_frames(SurfaceId::from_raw_handle(42), &dir_prefix(&dir), 10)?;
        for _ in 0..12 {
            interceptor.on_present(&other, || forwarded += 1);
            interceptor.on_present(&target, || forwarded += 1);
        }

        assert_eq!(forwarded, 24);
        assert_eq!(captures.load(Ordering::SeqCst), 10);
        assert_eq!(interceptor.state(), InterceptorState::Idle);
        assert_eq!(interceptor.request().unwrap().frame_index, 10);

        let expected: Vec<String> = (0..10).map(|i| format!("{i}.bmp")).collect();
        assert_eq!(bmp_files(&dir), expected);
        let first = std::fs::read(dir.join("0.bmp")).unwrap();
        assert_eq!(&first[0..2], b"BM");
        Ok(())
    }

    #[test]
    fn failed_capture_does_not_consume_a_frame() -> CaptureResult<()> {
        let dir = scratch_dir("interceptor-fail");
        let (pipeline, captures) = MockPipeline::new(Behavior::FailOnce);
        let interceptor = FrameInterceptor::new(pipeline);
        let target = MockSwapChain { window: 9 };

        interceptor.capture_frames(SurfaceId::from_raw_handle(9), &dir_prefix(&dir), 2)?;
        interceptor.on_present(&target, || ());
        assert_eq!(interceptor.request().unwrap().frame_index, 0);

        interceptor.on_present(&target, || ());
        interceptor.on_present(&target, || ());
        assert_eq!(captures.load(Ordering::SeqCst), 3);
        assert_eq!(interceptor.state(), InterceptorState::Idle);
        assert_eq!(bmp_files(&dir), vec!["0.bmp".to_string(), "1.bmp".to_string()]);
        Ok(())
    }

    #[test]
    fn write_failure_still_counts_the_frame() -> CaptureResult<()> {
        let dir = scratch_dir("interceptor-missing");
        let missing = dir.join("does-not-exist");
        let (pipeline, _) = MockPipeline::new(Behavior::Succeed);
        let interceptor = FrameInterceptor::new(pipeline);

        interceptor.capture_frames(SurfaceId::from_raw_handle(3), &dir_prefix(&missing), 1)?;
        interceptor.on_present(&MockSwapChain { window: 3 }, || ());
        assert_eq!(interceptor.state(), InterceptorState::Idle);
        assert!(!missing.exists());
        Ok(())
    }

    #[test]
    fn panicking_pipeline_never_blocks_the_present() -> CaptureResult<()> {
        let (pipeline, captures) = MockPipeline::new(Behavior::Panic);
        let interceptor = FrameInterceptor::new(pipeline);
        interceptor.capture_frames(SurfaceId::from_raw_handle(4), "", 1)?;

        let value = interceptor.on_present(&MockSwapChain { window: 4 }, || 7);
        assert_eq!(value, 7);
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        // Still usable after the poisoned lock.
        assert_eq!(interceptor.state(), InterceptorState::Armed);
        assert!(interceptor.cancel());
        Ok(())
    }

    #[test]
    fn cancel_returns_to_idle_and_allows_rearming() -> CaptureResult<()> {
        let (pipeline, captures) = MockPipeline::new(Behavior::Succeed);
        let interceptor = FrameInterceptor::new(pipeline);
        let window = SurfaceId::from_raw_handle(8);

        assert!(!interceptor.cancel());
        interceptor.capture_frames(window, "", 4)?;
        assert!(interceptor.cancel());
        assert_eq!(interceptor.state(), InterceptorState::Idle);

        interceptor.on_present(&MockSwapChain { window: 8 }, || ());
        assert_eq!(captures.load(Ordering::SeqCst), 0);

        interceptor.capture_frames(window, "", 4)?;
        assert_eq!(interceptor.state(), InterceptorState::Armed);
        interceptor.cancel();
        Ok(())
    }
}
