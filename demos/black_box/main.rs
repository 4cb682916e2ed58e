//! Renders a scrolling checkerboard with D3D11 or D3D12, hooks its own
//! `Present` and captures the first ten frames as BMP files.
//!
//! ```text
//! cargo run --example black_box -- [11|12] [output-dir]
//! ```

#[cfg_attr(not(windows), allow(dead_code))]
mod pattern;

#[cfg(windows)]
mod d3d11;
#[cfg(windows)]
mod d3d12;
#[cfg(windows)]
mod window;

use std::process::ExitCode;

use anyhow::Result;
use present_hook::GraphicsApi;
use tracing_subscriber::EnvFilter;

const WINDOW_WIDTH: u32 = 1280;
const WINDOW_HEIGHT: u32 = 720;
const CAPTURED_FRAMES: u32 = 10;

#[cfg_attr(not(windows), allow(dead_code))]
const PICTURE_WIDTH: u32 = 256;
#[cfg_attr(not(windows), allow(dead_code))]
const PICTURE_TOP: u32 = 200;
#[cfg_attr(not(windows), allow(dead_code))]
const CLEAR_COLOR: [f32; 4] = [0.0, 0.2, 0.4, 1.0];

#[cfg_attr(not(windows), allow(dead_code))]
trait Renderer {
    /// Draw one frame and present it.
    fn render(&mut self) -> Result<()>;
}

struct Args {
    api: GraphicsApi,
    output_dir: String,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let api = match args.next() {
        Some(raw) => raw.parse::<GraphicsApi>()?,
        None => GraphicsApi::D3D11,
    };
    Ok(Args {
        api,
        output_dir: args.next().unwrap_or_default(),
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match parse_args().and_then(run) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "black box failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(windows)]
fn run(args: Args) -> Result<()> {
    use present_hook::{InterceptorState, PresentHook, SurfaceId};

    let title = match args.api {
        GraphicsApi::D3D11 => "DirectX 11 Black Box Window",
        GraphicsApi::D3D12 => "DirectX 12 Black Box Window",
    };
    let window = window::BlackBoxWindow::create(title, WINDOW_WIDTH, WINDOW_HEIGHT)?;
    let mut renderer: Box<dyn Renderer> = match args.api {
        GraphicsApi::D3D11 => Box::new(d3d11::D3D11Renderer::new(
            window.hwnd(),
            WINDOW_WIDTH,
            WINDOW_HEIGHT,
        )?),
        GraphicsApi::D3D12 => Box::new(d3d12::D3D12Renderer::new(
            window.hwnd(),
            WINDOW_WIDTH,
            WINDOW_HEIGHT,
        )?),
    };

    let mut hook = PresentHook::new(args.api)?;
    hook.hook()?;
    let target = SurfaceId::from_raw_handle(window.hwnd().0 as isize);
    hook.capture_frames(target, &args.output_dir, CAPTURED_FRAMES)?;

    window.show();
    let mut reported = false;
    window.run(|| {
        renderer.render()?;
        if !reported && hook.state() == InterceptorState::Idle {
            reported = true;
            let captured = hook.request().map_or(0, |request| request.frame_index);
            tracing::info!(captured, output_dir = %args.output_dir, "capture finished");
        }
        Ok(())
    })?;

    hook.unhook()?;
    Ok(())
}

#[cfg(not(windows))]
fn run(args: Args) -> Result<()> {
    anyhow::bail!(
        "the black box demo needs Windows (requested {}, {WINDOW_WIDTH}x{WINDOW_HEIGHT}, {CAPTURED_FRAMES} frames into {:?})",
        args.api.as_str(),
        args.output_dir
    )
}
