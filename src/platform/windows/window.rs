use anyhow::Context;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, RECT, WPARAM};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    AdjustWindowRect, CreateWindowExW, DefWindowProcW, DestroyWindow, RegisterClassW,
    CW_USEDEFAULT, WNDCLASSW, WS_OVERLAPPEDWINDOW,
};

use crate::error::{CaptureError, CaptureResult};

const CLASS_NAME: &str = "PresentHookBootstrapWindow";

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// A never-shown top-level window that exists only so a throwaway swap
/// chain can be created. Destroyed on drop.
pub(crate) struct HiddenWindow {
    hwnd: HWND,
}

impl HiddenWindow {
    pub(crate) fn create(
        title: &str,
        client_width: u32,
        client_height: u32,
    ) -> CaptureResult<Self> {
        Self::create_inner(title, client_width, client_height)
            .map_err(CaptureError::ResourceCreation)
    }

    fn create_inner(title: &str, client_width: u32, client_height: u32) -> anyhow::Result<Self> {
        let class_name = wide(CLASS_NAME);
        let window_name = wide(title);

        let hinstance = unsafe { GetModuleHandleW(None) }.context("GetModuleHandleW failed")?;

        let wc = WNDCLASSW {
            lpfnWndProc: Some(bootstrap_wnd_proc),
            hInstance: hinstance.into(),
            lpszClassName: PCWSTR(class_name.as_ptr()),
            ..Default::default()
        };
        // Registration fails harmlessly when the class already exists.
        unsafe {
            RegisterClassW(&wc);
        }

        let width = i32::try_from(client_width).context("client width out of range")?;
        let height = i32::try_from(client_height).context("client height out of range")?;
        let mut rect = RECT {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        };
        unsafe { AdjustWindowRect(&mut rect, WS_OVERLAPPEDWINDOW, false) }
            .context("AdjustWindowRect failed")?;

        let hwnd = unsafe {
            CreateWindowExW(
                Default::default(),
                PCWSTR(class_name.as_ptr()),
                PCWSTR(window_name.as_ptr()),
                WS_OVERLAPPEDWINDOW,
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                rect.right - rect.left,
                rect.bottom - rect.top,
                HWND::default(),
                None,
                hinstance,
                None,
            )
        }
        .context("CreateWindowExW for the bootstrap window failed")?;

        tracing::trace!(hwnd = hwnd.0 as isize, "bootstrap window created");
        Ok(Self { hwnd })
    }

    pub(crate) fn hwnd(&self) -> HWND {
        self.hwnd
    }
}

impl Drop for HiddenWindow {
    fn drop(&mut self) {
        if !self.hwnd.0.is_null() {
            unsafe {
                let _ = DestroyWindow(self.hwnd);
            }
        }
    }
}

unsafe extern "system" fn bootstrap_wnd_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}
