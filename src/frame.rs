use crate::error::{CaptureError, CaptureResult};

/// Channel order of a 4-byte-per-pixel frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    /// Byte offsets of the red, green and blue channels inside a pixel.
    pub(crate) const fn rgb_offsets(self) -> [usize; 3] {
        match self {
            Self::Rgba8 => [0, 1, 2],
            Self::Bgra8 => [2, 1, 0],
        }
    }
}

/// A frame read back from GPU memory.
///
/// Rows are stored top-down exactly as the GPU laid them out, so the row
/// pitch may exceed `width * 4`. Consumers must index rows by
/// [`row_pitch`](Self::row_pitch).
pub struct RawFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    row_pitch: usize,
    format: PixelFormat,
}

impl RawFrame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        row_pitch: usize,
        format: PixelFormat,
    ) -> CaptureResult<Self> {
        let required = required_len(width, height, row_pitch)?;
        if data.len() < required {
            return Err(CaptureError::InvalidConfig(format!(
                "frame data length mismatch: got {}, need at least {} for {}x{} with pitch {}",
                data.len(),
                required,
                width,
                height,
                row_pitch
            )));
        }

        Ok(Self {
            data,
            width,
            height,
            row_pitch,
            format,
        })
    }

    /// Tightly packed RGBA frame (`row_pitch == width * 4`).
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> CaptureResult<Self> {
        let pitch = (width as usize)
            .checked_mul(4)
            .ok_or(CaptureError::BufferOverflow)?;
        Self::new(data, width, height, pitch, PixelFormat::Rgba8)
    }

    /// Copy a mapped GPU surface into an owned frame, keeping the GPU row
    /// pitch.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `(height - 1) * row_pitch + width * 4`
    /// bytes for the duration of the call.
    pub(crate) unsafe fn copy_from_mapped(
        src: *const u8,
        width: u32,
        height: u32,
        row_pitch: usize,
        format: PixelFormat,
    ) -> CaptureResult<Self> {
        if src.is_null() {
            return Err(CaptureError::Mapping(anyhow::anyhow!("mapped pointer is null")));
        }
        let required = required_len(width, height, row_pitch)?;
        let total = row_pitch
            .checked_mul(height as usize)
            .ok_or(CaptureError::BufferOverflow)?;

        let mut data = vec![0u8; total];
        // The last row may end before the full pitch, so only `required`
        // bytes are guaranteed readable.
        unsafe { std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), required) };
        Self::new(data, width, height, row_pitch, format)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pixel bytes of row `y` (top-down), excluding pitch padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = (y as usize) * self.row_pitch;
        let len = (self.width as usize) * 4;
        self.data.get(start..start + len)
    }
}

fn required_len(width: u32, height: u32, row_pitch: usize) -> CaptureResult<usize> {
    let row_len = (width as usize)
        .checked_mul(4)
        .ok_or(CaptureError::BufferOverflow)?;
    if row_pitch < row_len {
        return Err(CaptureError::InvalidConfig(format!(
            "row pitch {row_pitch} is smaller than the {row_len}-byte row"
        )));
    }
    if height == 0 {
        return Ok(0);
    }
    row_pitch
        .checked_mul(height as usize - 1)
        .and_then(|base| base.checked_add(row_len))
        .ok_or(CaptureError::BufferOverflow)
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_pitch", &self.row_pitch)
            .field("format", &self.format)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_pitch_smaller_than_row() {
        let err = RawFrame::new(vec![0; 64], 4, 4, 12, PixelFormat::Rgba8).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidConfig(_)));
    }

    #[test]
    fn row_skips_pitch_padding() {
        let mut data = vec![0u8; 2 * 16];
        data[16..24].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let frame = RawFrame::new(data, 2, 2, 16, PixelFormat::Rgba8).unwrap();
        assert_eq!(frame.row(1).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(frame.row(2).is_none());
    }

    #[test]
    fn copy_from_mapped_reads_only_the_last_row_prefix() {
        // Two rows of width 1 with a 256-byte pitch; the source ends right
        // after the last pixel like a tightly sized readback allocation.
        let mut src = vec![0u8; 256 + 4];
        src[0..4].copy_from_slice(&[10, 20, 30, 40]);
        src[256..260].copy_from_slice(&[50, 60, 70, 80]);

        let frame =
            unsafe { RawFrame::copy_from_mapped(src.as_ptr(), 1, 2, 256, PixelFormat::Bgra8) }
                .unwrap();
        assert_eq!(frame.row_pitch(), 256);
        assert_eq!(frame.row(0).unwrap(), &[10, 20, 30, 40]);
        assert_eq!(frame.row(1).unwrap(), &[50, 60, 70, 80]);
        assert_eq!(frame.format(), PixelFormat::Bgra8);
    }

    #[test]
    fn copy_from_null_is_a_mapping_error() {
        let err =
            unsafe { RawFrame::copy_from_mapped(std::ptr::null(), 1, 1, 4, PixelFormat::Rgba8) }
                .unwrap_err();
        assert!(matches!(err, CaptureError::Mapping(_)));
    }
}
