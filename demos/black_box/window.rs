use anyhow::{Context, Result};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, RECT, WPARAM};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    AdjustWindowRect, CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW,
    LoadCursorW, PeekMessageW, PostQuitMessage, RegisterClassW, ShowWindow, TranslateMessage,
    CS_HREDRAW, CS_VREDRAW, CW_USEDEFAULT, IDC_ARROW, MSG, PM_REMOVE, SW_SHOW, WM_DESTROY,
    WM_QUIT, WNDCLASSW, WS_OVERLAPPEDWINDOW,
};

const CLASS_NAME: &str = "BlackBoxDXWindow";

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

pub struct BlackBoxWindow {
    hwnd: HWND,
}

impl BlackBoxWindow {
    pub fn create(title: &str, client_width: u32, client_height: u32) -> Result<Self> {
        let class_name = wide(CLASS_NAME);
        let window_name = wide(title);
        let hinstance = unsafe { GetModuleHandleW(None) }.context("GetModuleHandleW failed")?;

        let wc = WNDCLASSW {
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(wnd_proc),
            hInstance: hinstance.into(),
            hCursor: unsafe { LoadCursorW(None, IDC_ARROW) }.unwrap_or_default(),
            lpszClassName: PCWSTR(class_name.as_ptr()),
            ..Default::default()
        };
        if unsafe { RegisterClassW(&wc) } == 0 {
            anyhow::bail!("RegisterClassW failed: {}", windows::core::Error::from_win32());
        }

        let mut rect = RECT {
            left: 0,
            top: 0,
            right: i32::try_from(client_width)?,
            bottom: i32::try_from(client_height)?,
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
        .context("CreateWindowExW failed")?;

        Ok(Self { hwnd })
    }

    pub fn hwnd(&self) -> HWND {
        self.hwnd
    }

    pub fn show(&self) {
        unsafe {
            let _ = ShowWindow(self.hwnd, SW_SHOW);
        }
    }

    /// Pump messages, calling `on_idle` whenever the queue is empty, until
    /// the window is closed.
    pub fn run(&self, mut on_idle: impl FnMut() -> Result<()>) -> Result<()> {
        let mut msg = MSG::default();
        loop {
            if unsafe { PeekMessageW(&mut msg, HWND::default(), 0, 0, PM_REMOVE) }.as_bool() {
                if msg.message == WM_QUIT {
                    return Ok(());
                }
                unsafe {
                    let _ = TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                }
            } else {
                on_idle()?;
            }
        }
    }
}

impl Drop for BlackBoxWindow {
    fn drop(&mut self) {
        unsafe {
            let _ = DestroyWindow(self.hwnd);
        }
    }
}

unsafe extern "system" fn wnd_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_DESTROY {
        unsafe { PostQuitMessage(0) };
        return LRESULT(0);
    }
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}
