//! Binary interception of a single function.
//!
//! All instruction patching lives behind [`BinaryInterceptor`]. The inline
//! implementation is backed by `retour`, which decodes the target's
//! prologue, copies whole instructions into a trampoline that jumps back to
//! the rest of the original function, and overwrites the prologue with a
//! jump to the replacement. The jump encoding (and with it the number of
//! bytes that must be relocated) depends on the target architecture and is
//! chosen at build time.
//!
//! Patching is not synchronized with threads that are already executing the
//! target: a call in flight while the prologue is rewritten may observe a
//! torn instruction stream.

use crate::error::{CaptureError, CaptureResult};

/// Installs a redirect from one function to another.
pub trait BinaryInterceptor {
    /// Build the trampoline for `target` without patching it yet.
    ///
    /// # Safety
    ///
    /// `target` and `replacement` must be executable functions with the same
    /// signature and calling convention, and `target` must stay mapped for
    /// as long as the returned handle is enabled.
    unsafe fn prepare(&self, target: usize, replacement: usize) -> CaptureResult<TrampolineHandle>;

    /// Build the trampoline and patch `target` immediately.
    ///
    /// # Safety
    ///
    /// Same contract as [`prepare`](Self::prepare).
    unsafe fn install(&self, target: usize, replacement: usize) -> CaptureResult<TrampolineHandle> {
        let handle = unsafe { self.prepare(target, replacement)? };
        unsafe { handle.enable()? };
        Ok(handle)
    }
}

/// A redirect of one function and the stub that still reaches the
/// original code.
pub struct TrampolineHandle {
    original: usize,
    trampoline: usize,
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    patch: retour::RawDetour,
    #[cfg(test)]
    refuse_next_enable: std::sync::atomic::AtomicBool,
}

// SAFETY: the detour only holds addresses and an owned trampoline
// allocation; toggling it from another thread is serialized by the owner.
unsafe impl Send for TrampolineHandle {}

impl TrampolineHandle {
    pub fn original_address(&self) -> usize {
        self.original
    }

    /// Address of the stub that executes the relocated prologue and then
    /// continues in the unpatched remainder of the original function.
    pub fn trampoline_address(&self) -> usize {
        self.trampoline
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn is_installed(&self) -> bool {
        self.patch.is_enabled()
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    pub fn is_installed(&self) -> bool {
        false
    }

    /// Make the next [`enable`](Self::enable) fail without touching the
    /// target.
    #[cfg(test)]
    pub(crate) fn refusing_next_enable(self) -> Self {
        self.refuse_next_enable
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self
    }

    /// Write the jump into the original function.
    ///
    /// # Safety
    ///
    /// Every thread may start executing the replacement as soon as this
    /// returns; it must be ready to handle calls.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub unsafe fn enable(&self) -> CaptureResult<()> {
        #[cfg(test)]
        {
            if self
                .refuse_next_enable
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(CaptureError::Patch("target is write-protected".to_string()));
            }
        }
        unsafe { self.patch.enable() }.map_err(patch_error)?;
        tracing::debug!(
            original = format_args!("{:#x}", self.original),
            trampoline = format_args!("{:#x}", self.trampoline),
            "detour enabled"
        );
        Ok(())
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    pub unsafe fn enable(&self) -> CaptureResult<()> {
        Err(unsupported_arch())
    }

    /// Restore the original prologue. The trampoline stays callable until
    /// the handle is dropped.
    ///
    /// # Safety
    ///
    /// Same hazard as installation: a thread executing the prologue while it
    /// is restored may observe a torn instruction stream.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub unsafe fn uninstall(&self) -> CaptureResult<()> {
        unsafe { self.patch.disable() }.map_err(patch_error)?;
        tracing::debug!(
            original = format_args!("{:#x}", self.original),
            "detour disabled"
        );
        Ok(())
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    pub unsafe fn uninstall(&self) -> CaptureResult<()> {
        Err(unsupported_arch())
    }
}

impl std::fmt::Debug for TrampolineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrampolineHandle")
            .field("original", &format_args!("{:#x}", self.original))
            .field("trampoline", &format_args!("{:#x}", self.trampoline))
            .field("installed", &self.is_installed())
            .finish()
    }
}

/// Inline prologue patch for the architecture this crate is built for.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDetour;

impl BinaryInterceptor for InlineDetour {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    unsafe fn prepare(&self, target: usize, replacement: usize) -> CaptureResult<TrampolineHandle> {
        if target == 0 || replacement == 0 {
            return Err(CaptureError::Patch("null function address".to_string()));
        }
        let patch = unsafe { retour::RawDetour::new(target as *const (), replacement as *const ()) }
            .map_err(patch_error)?;
        let trampoline = patch.trampoline() as *const () as usize;
        Ok(TrampolineHandle {
            original: target,
            trampoline,
            patch,
            #[cfg(test)]
            refuse_next_enable: Default::default(),
        })
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    unsafe fn prepare(
        &self,
        _target: usize,
        _replacement: usize,
    ) -> CaptureResult<TrampolineHandle> {
        Err(unsupported_arch())
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn patch_error(err: retour::Error) -> CaptureError {
    CaptureError::Patch(err.to_string())
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn unsupported_arch() -> CaptureError {
    CaptureError::BackendUnavailable(format!(
        "inline detours are not implemented for {}",
        std::env::consts::ARCH
    ))
}
