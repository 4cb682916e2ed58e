use crate::surface::SurfaceId;

/// Append a trailing path separator unless the directory already ends in
/// one (`/` or `\`). An empty string stays empty so frames land in the
/// working directory.
pub fn normalize_output_dir(dir: &str) -> String {
    if dir.is_empty() || dir.ends_with('/') || dir.ends_with('\\') {
        return dir.to_string();
    }
    let mut normalized = String::with_capacity(dir.len() + 1);
    normalized.push_str(dir);
    normalized.push(std::path::MAIN_SEPARATOR);
    normalized
}

/// An armed request to capture frames presented into one surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureRequest {
    pub target: SurfaceId,
    /// Always normalized with [`normalize_output_dir`].
    pub output_dir: String,
    pub max_frames: u32,
    pub frame_index: u32,
    pub active: bool,
}

impl CaptureRequest {
    pub fn new(target: SurfaceId, output_dir: &str, max_frames: u32) -> Self {
        Self {
            target,
            output_dir: normalize_output_dir(output_dir),
            max_frames,
            frame_index: 0,
            active: true,
        }
    }

    pub fn matches(&self, surface: SurfaceId) -> bool {
        self.active && self.target == surface
    }

    /// Count one captured frame, disarming once `max_frames` is reached.
    pub(crate) fn record_frame(&mut self) {
        self.frame_index = self.frame_index.saturating_add(1).min(self.max_frames);
        if self.frame_index >= self.max_frames {
            self.active = false;
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_frames.saturating_sub(self.frame_index)
    }
}
