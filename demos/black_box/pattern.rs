/// Square RGBA picture of 8×8 alternating black and white cells, fully
/// opaque. `width` should be a multiple of 8.
pub fn checkerboard_rgba(width: u32) -> Vec<u8> {
    let cell = (width / 8).max(1);
    let mut data = Vec::with_capacity(width as usize * width as usize * 4);
    for y in 0..width {
        for x in 0..width {
            let value = if (x / cell) % 2 == (y / cell) % 2 { 0x00 } else { 0xFF };
            data.extend_from_slice(&[value, value, value, 0xFF]);
        }
    }
    data
}

/// Columns of a `picture`-wide image at horizontal position `left` that
/// land inside a `viewport`-wide target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VisibleSpan {
    pub dst_x: u32,
    pub src_x: u32,
    pub width: u32,
}

pub fn visible_span(left: i32, picture: u32, viewport: u32) -> Option<VisibleSpan> {
    let start = left.max(0) as i64;
    let end = (left as i64 + picture as i64).min(viewport as i64);
    if end <= start {
        return None;
    }
    Some(VisibleSpan {
        dst_x: start as u32,
        src_x: (start - left as i64) as u32,
        width: (end - start) as u32,
    })
}

/// Horizontal scroll of the picture: 5 pixels per frame, re-entering from
/// the left once it has left the viewport.
#[derive(Clone, Copy, Debug)]
pub struct Scroller {
    left: i32,
    picture: u32,
    viewport: u32,
}

impl Scroller {
    pub const STEP: i32 = 5;

    pub fn new(picture: u32, viewport: u32) -> Self {
        Self {
            left: 0,
            picture,
            viewport,
        }
    }

    pub fn span(&self) -> Option<VisibleSpan> {
        visible_span(self.left, self.picture, self.viewport)
    }

    pub fn advance(&mut self) {
        self.left += Self::STEP;
        if self.left > self.viewport as i32 {
            self.left = -(self.picture as i32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let data = checkerboard_rgba(16);
        assert_eq!(data.len(), 16 * 16 * 4);
        let pixel = |x: usize, y: usize| &data[(y * 16 + x) * 4..(y * 16 + x) * 4 + 4];
        assert_eq!(pixel(0, 0), &[0, 0, 0, 255]);
        assert_eq!(pixel(2, 0), &[255, 255, 255, 255]);
        assert_eq!(pixel(2, 2), &[0, 0, 0, 255]);
        assert_eq!(pixel(15, 0), &[255, 255, 255, 255]);
        assert!(data.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn span_clips_both_edges() {
        assert_eq!(
            visible_span(-56, 256, 1280),
            Some(VisibleSpan { dst_x: 0, src_x: 56, width: 200 })
        );
        assert_eq!(
            visible_span(1200, 256, 1280),
            Some(VisibleSpan { dst_x: 1200, src_x: 0, width: 80 })
        );
        assert_eq!(visible_span(-256, 256, 1280), None);
        assert_eq!(visible_span(1280, 256, 1280), None);
    }

    #[test]
    fn scroller_wraps_after_leaving_viewport() {
        let mut scroller = Scroller::new(256, 10);
        scroller.advance();
        scroller.advance();
        assert_eq!(scroller.left, 10);
        scroller.advance();
        assert_eq!(scroller.left, -256);
    }
}
