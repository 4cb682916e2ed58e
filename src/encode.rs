use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CaptureError, CaptureResult};
use crate::frame::RawFrame;

const FILE_HEADER_LEN: usize = 14;
const INFO_HEADER_LEN: usize = 40;
/// Offset of the pixel array from the start of the file.
pub const BMP_DATA_OFFSET: usize = FILE_HEADER_LEN + INFO_HEADER_LEN;
const BMP_SIGNATURE: [u8; 2] = *b"BM";
const BMP_BITS_PER_PIXEL: u16 = 24;

/// Extension used for every captured frame file.
pub const FRAME_FILE_EXTENSION: &str = "bmp";

fn bmp_row_len(width: u32) -> CaptureResult<usize> {
    let stride = (width as usize)
        .checked_mul(3)
        .ok_or(CaptureError::BufferOverflow)?;
    let padding = (4 - stride % 4) % 4;
    stride
        .checked_add(padding)
        .ok_or(CaptureError::BufferOverflow)
}

/// Size in bytes of the BMP file produced for a `width x height` frame.
pub fn bmp_len(width: u32, height: u32) -> CaptureResult<usize> {
    bmp_row_len(width)?
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_add(BMP_DATA_OFFSET))
        .ok_or(CaptureError::BufferOverflow)
}

/// Encode a frame as an uncompressed 24-bit bottom-up BMP.
pub fn encode_bmp(frame: &RawFrame) -> CaptureResult<Vec<u8>> {
    let width = frame.width();
    let height = frame.height();
    let total_len = bmp_len(width, height)?;
    let file_size = u32::try_from(total_len).map_err(|_| CaptureError::BufferOverflow)?;
    let width_field = i32::try_from(width).map_err(|_| CaptureError::BufferOverflow)?;
    let height_field = i32::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;
    let row_len = bmp_row_len(width)?;
    let image_size = file_size - BMP_DATA_OFFSET as u32;

    let mut out = Vec::with_capacity(total_len);

    // BITMAPFILEHEADER
    out.extend_from_slice(&BMP_SIGNATURE);
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(BMP_DATA_OFFSET as u32).to_le_bytes());

    // BITMAPINFOHEADER
    out.extend_from_slice(&(INFO_HEADER_LEN as u32).to_le_bytes());
    out.extend_from_slice(&width_field.to_le_bytes());
    out.extend_from_slice(&height_field.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&BMP_BITS_PER_PIXEL.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // BI_RGB
    out.extend_from_slice(&image_size.to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);
    debug_assert_eq!(out.len(), BMP_DATA_OFFSET);

    let [r, g, b] = frame.format().rgb_offsets();
    let padding = row_len - (width as usize) * 3;
    for y in (0..height).rev() {
        let row = frame.row(y).ok_or(CaptureError::BufferOverflow)?;
        for px in row.chunks_exact(4) {
            out.extend_from_slice(&[px[b], px[g], px[r]]);
        }
        out.extend(std::iter::repeat(0u8).take(padding));
    }

    debug_assert_eq!(out.len(), total_len);
    Ok(out)
}

/// Write `bytes` to a file that must not exist yet.
pub fn write_new_file(path: &Path, bytes: &[u8]) -> CaptureResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| CaptureError::io(path, err))?;
    file.write_all(bytes)
        .and_then(|()| file.flush())
        .map_err(|err| CaptureError::io(path, err))
}

/// Numbers and writes captured frames.
///
/// The counter starts at 0 and only moves forward for the lifetime of the
/// sink, across capture requests.
#[derive(Debug, Default)]
pub struct FrameSink {
    next_index: u64,
}

impl FrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Encode `frame` and write it as `<output_dir><index>.bmp`.
    ///
    /// `output_dir` is expected to be normalized (empty or ending in a
    /// separator). The index is consumed even when the write fails.
    pub fn save(&mut self, output_dir: &str, frame: &RawFrame) -> CaptureResult<PathBuf> {
        let index = self.next_index;
        self.next_index += 1;

        let path = PathBuf::from(format!("{output_dir}{index}.{FRAME_FILE_EXTENSION}"));
        let bytes = encode_bmp(frame)?;
        write_new_file(&path, &bytes)?;
        Ok(path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn scratch_dir(label: &str) -> PathBuf {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "present-hook-{label}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn gradient(width: u32, height: u32, pitch: usize, format: PixelFormat) -> RawFrame {
        let mut data = vec![0xEEu8; pitch * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let px = &mut data[y * pitch + x * 4..][..4];
                let (r, g, b) = (x as u8 * 10, y as u8 * 10, 200);
                match format {
                    PixelFormat::Rgba8 => px.copy_from_slice(&[r, g, b, 255]),
                    PixelFormat::Bgra8 => px.copy_from_slice(&[b, g, r, 255]),
                }
            }
        }
        RawFrame::new(data, width, height, pitch, format).unwrap()
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn sixteen_square_is_822_bytes() {
        assert_eq!(bmp_len(16, 16).unwrap(), 822);
        let bmp = encode_bmp(&gradient(16, 16, 64, PixelFormat::Rgba8)).unwrap();
        assert_eq!(bmp.len(), 822);
        assert_eq!(&bmp[0..2], b"BM");
        assert_eq!(u32_at(&bmp, 2), 822);
        assert_eq!(u32_at(&bmp, 10), 54);
        assert_eq!(u32_at(&bmp, 14), 40);
        assert_eq!(u32_at(&bmp, 18), 16);
        assert_eq!(u32_at(&bmp, 22), 16);
        assert_eq!(u16_at(&bmp, 26), 1);
        assert_eq!(u16_at(&bmp, 28), 24);
    }

    #[test]
    fn rows_are_padded_and_pitch_is_honored() {
        // 3 px wide: 9 bytes of BGR + 3 padding bytes per row.
        let frame = gradient(3, 2, 32, PixelFormat::Rgba8);
        let bmp = encode_bmp(&frame).unwrap();
        assert_eq!(bmp.len(), 54 + 2 * 12);

        // First stored row is the bottom source row (y = 1).
        assert_eq!(&bmp[54..57], &[200, 10, 0]);
        assert_eq!(&bmp[60..63], &[200, 10, 20]);
        assert_eq!(&bmp[63..66], &[0, 0, 0]);
        // Second stored row is the top source row (y = 0).
        assert_eq!(&bmp[66..69], &[200, 0, 0]);
    }

    #[test]
    fn decodes_to_source_pixels() {
        let frame = gradient(5, 4, 24, PixelFormat::Rgba8);
        let bmp = encode_bmp(&frame).unwrap();
        let decoded = image::load_from_memory_with_format(&bmp, image::ImageFormat::Bmp)
            .unwrap()
            .to_rgb8();
        assert_eq!(decoded.dimensions(), (5, 4));
        for y in 0..4u32 {
            for x in 0..5u32 {
                let px = decoded.get_pixel(x, y);
                assert_eq!(px.0, [x as u8 * 10, y as u8 * 10, 200], "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn bgra_matches_rgba() {
        let rgba = encode_bmp(&gradient(7, 3, 28, PixelFormat::Rgba8)).unwrap();
        let bgra = encode_bmp(&gradient(7, 3, 40, PixelFormat::Bgra8)).unwrap();
        assert_eq!(rgba, bgra);
    }

    #[test]
    fn write_new_file_refuses_existing_path() {
        let dir = scratch_dir("exists");
        let path = dir.join("0.bmp");
        write_new_file(&path, b"first").unwrap();
        let err = write_new_file(&path, b"second").unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
    }

    #[test]
    fn sink_numbers_files_and_skips_failed_indices() {
        let dir = scratch_dir("sink");
        let prefix = format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR);
        std::fs::write(dir.join("1.bmp"), b"taken").unwrap();

        let frame = gradient(2, 2, 8, PixelFormat::Rgba8);
        let mut sink = FrameSink::new();
        assert_eq!(sink.save(&prefix, &frame).unwrap(), dir.join("0.bmp"));
        assert!(sink.save(&prefix, &frame).is_err());
        assert_eq!(sink.save(&prefix, &frame).unwrap(), dir.join("2.bmp"));
        assert_eq!(sink.next_index(), 3);
    }
}
