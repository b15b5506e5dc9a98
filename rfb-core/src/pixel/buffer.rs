//! Pixel storage.
//!
//! [`PixelBuffer`] is read access to a rectangle of pixels in one
//! [`PixelFormat`]; [`ModifiablePixelBuffer`] adds writes. Both address
//! pixels in framebuffer coordinates and reject rects that reach
//! outside [`rect`](PixelBuffer::rect) with [`RfbError::OutOfBounds`].
//! Strides are always counted in pixels.

use crate::error::RfbError;
use crate::geometry::{Point, Rect};
use crate::pixel::{Pixel, PixelFormat};

fn check_bounds(r: &Rect, bounds: &Rect) -> Result<(), RfbError> {
    if r.enclosed_by(bounds) && r.width() >= 0 && r.height() >= 0 {
        Ok(())
    } else {
        Err(RfbError::OutOfBounds {
            rect: *r,
            bounds: *bounds,
        })
    }
}

/// Byte length of a `w`×`h` block with `stride` pixels per row.
fn span_len(w: usize, h: usize, stride: usize, bpp: usize) -> usize {
    if w == 0 || h == 0 {
        0
    } else {
        ((h - 1) * stride + w) * bpp
    }
}

// ── PixelView ────────────────────────────────────────────────────

/// Borrowed rectangle of pixels, the input every encoder works on.
#[derive(Debug, Clone, Copy)]
pub struct PixelView<'a> {
    pf: PixelFormat,
    data: &'a [u8],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a> PixelView<'a> {
    /// # Panics
    ///
    /// Panics if `data` is too short for the described block.
    pub fn new(
        pf: PixelFormat,
        data: &'a [u8],
        width: usize,
        height: usize,
        stride: usize,
    ) -> Self {
        assert!(
            data.len() >= span_len(width, height, stride, pf.bytes_per_pixel()),
            "pixel view data too short"
        );
        Self {
            pf,
            data,
            width,
            height,
            stride,
        }
    }

    pub fn pf(&self) -> &PixelFormat {
        &self.pf
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// Bytes of row `y`, exactly `width` pixels.
    pub fn row(&self, y: usize) -> &'a [u8] {
        let bpp = self.pf.bytes_per_pixel();
        let start = y * self.stride * bpp;
        &self.data[start..start + self.width * bpp]
    }

    #[inline]
    pub fn pixel<P: Pixel>(&self, x: usize, y: usize) -> P {
        P::load(&self.data[(y * self.stride + x) * P::BYTES..])
    }

    /// A sub-rectangle of this view, in view-local coordinates.
    pub fn sub(&self, x: usize, y: usize, w: usize, h: usize) -> PixelView<'a> {
        debug_assert!(x + w <= self.width && y + h <= self.height);
        let bpp = self.pf.bytes_per_pixel();
        let start = (y * self.stride + x) * bpp;
        PixelView {
            pf: self.pf,
            data: &self.data[start..],
            width: w,
            height: h,
            stride: self.stride,
        }
    }
}

// ── PixelBuffer ──────────────────────────────────────────────────

/// Read access to pixels.
pub trait PixelBuffer {
    fn pf(&self) -> &PixelFormat;

    /// Area covered by this buffer.
    fn rect(&self) -> Rect;

    /// Bytes starting at `r.tl` and the stride in pixels.
    fn get_buffer(&self, r: &Rect) -> Result<(&[u8], usize), RfbError>;

    fn width(&self) -> i32 {
        self.rect().width()
    }

    fn height(&self) -> i32 {
        self.rect().height()
    }

    fn view(&self, r: &Rect) -> Result<PixelView<'_>, RfbError> {
        let (data, stride) = self.get_buffer(r)?;
        Ok(PixelView::new(
            *self.pf(),
            data,
            r.width() as usize,
            r.height() as usize,
            stride,
        ))
    }

    /// Copy `r` into `dst` in this buffer's format. A `dst_stride` of 0
    /// means tightly packed.
    fn get_image(&self, dst: &mut [u8], r: &Rect, dst_stride: usize) -> Result<(), RfbError> {
        let (src, src_stride) = self.get_buffer(r)?;
        if r.is_empty() {
            return Ok(());
        }
        let bpp = self.pf().bytes_per_pixel();
        let w = r.width() as usize;
        let dst_stride = if dst_stride == 0 { w } else { dst_stride };
        let row = w * bpp;
        for y in 0..r.height() as usize {
            dst[y * dst_stride * bpp..][..row].copy_from_slice(&src[y * src_stride * bpp..][..row]);
        }
        Ok(())
    }

    /// Copy `r` into `dst` converted to `pf`.
    fn get_image_pf(
        &self,
        pf: &PixelFormat,
        dst: &mut [u8],
        r: &Rect,
        dst_stride: usize,
    ) -> Result<(), RfbError> {
        let (src, src_stride) = self.get_buffer(r)?;
        let w = r.width() as usize;
        let dst_stride = if dst_stride == 0 { w } else { dst_stride };
        pf.buffer_from_buffer(
            dst,
            self.pf(),
            src,
            w,
            r.height() as usize,
            dst_stride,
            src_stride,
        );
        Ok(())
    }
}

// ── ModifiablePixelBuffer ────────────────────────────────────────

/// Write access to pixels.
pub trait ModifiablePixelBuffer: PixelBuffer {
    /// Mutable bytes starting at `r.tl` and the stride in pixels.
    fn get_buffer_rw(&mut self, r: &Rect) -> Result<(&mut [u8], usize), RfbError>;

    /// Called after a write through [`get_buffer_rw`](Self::get_buffer_rw)
    /// finished. Buffers backed by something other than memory flush here.
    fn commit_buffer_rw(&mut self, _r: &Rect) {}

    /// Fill `r` with one pixel given as buffer bytes.
    fn fill_rect(&mut self, r: &Rect, pix: &[u8]) -> Result<(), RfbError> {
        if r.is_empty() {
            return Ok(());
        }
        let bpp = self.pf().bytes_per_pixel();
        let w = r.width() as usize;
        let h = r.height() as usize;
        let (buf, stride) = self.get_buffer_rw(r)?;
        for y in 0..h {
            for px in buf[y * stride * bpp..][..w * bpp].chunks_exact_mut(bpp) {
                px.copy_from_slice(&pix[..bpp]);
            }
        }
        self.commit_buffer_rw(r);
        Ok(())
    }

    /// Copy pixels in this buffer's format into `r`. A `src_stride` of 0
    /// means tightly packed.
    fn image_rect(&mut self, r: &Rect, src: &[u8], src_stride: usize) -> Result<(), RfbError> {
        if r.is_empty() {
            return Ok(());
        }
        let bpp = self.pf().bytes_per_pixel();
        let w = r.width() as usize;
        let h = r.height() as usize;
        let src_stride = if src_stride == 0 { w } else { src_stride };
        let (buf, stride) = self.get_buffer_rw(r)?;
        for y in 0..h {
            buf[y * stride * bpp..][..w * bpp]
                .copy_from_slice(&src[y * src_stride * bpp..][..w * bpp]);
        }
        self.commit_buffer_rw(r);
        Ok(())
    }

    /// Copy the pixels at `dest - delta` to `dest`. Source and
    /// destination may overlap.
    fn copy_rect(&mut self, dest: &Rect, delta: Point) -> Result<(), RfbError> {
        if dest.is_empty() {
            return Ok(());
        }
        let src = dest.translate(delta.negate());
        let bounds = self.rect();
        check_bounds(dest, &bounds)?;
        check_bounds(&src, &bounds)?;

        let bpp = self.pf().bytes_per_pixel();
        let all = dest.union_boundary(&src);
        let w = dest.width() as usize;
        let h = dest.height() as usize;
        let (buf, stride) = self.get_buffer_rw(&all)?;

        let offset = |p: Point| -> usize {
            (((p.y - all.tl.y) as usize) * stride + (p.x - all.tl.x) as usize) * bpp
        };
        let s0 = offset(src.tl);
        let d0 = offset(dest.tl);
        let row = w * bpp;

        // moving down: walk rows bottom-up so unread rows are not clobbered
        let rows: Box<dyn Iterator<Item = usize>> = if delta.y > 0 {
            Box::new((0..h).rev())
        } else {
            Box::new(0..h)
        };
        for y in rows {
            let s = s0 + y * stride * bpp;
            let d = d0 + y * stride * bpp;
            buf.copy_within(s..s + row, d);
        }
        self.commit_buffer_rw(&all);
        Ok(())
    }

    /// Fill `r` with pixel value `pix` expressed in `pf`.
    fn fill_rect_pf(&mut self, pf: &PixelFormat, r: &Rect, pix: u32) -> Result<(), RfbError> {
        let own = *self.pf();
        let mut bytes = [0u8; 4];
        own.buffer_from_pixel(&mut bytes, own.pixel_from_pixel(pf, pix));
        self.fill_rect(r, &bytes)
    }

    /// Copy pixels in `pf` into `r`, converting to this buffer's format.
    fn image_rect_pf(
        &mut self,
        pf: &PixelFormat,
        r: &Rect,
        src: &[u8],
        src_stride: usize,
    ) -> Result<(), RfbError> {
        let own = *self.pf();
        let w = r.width() as usize;
        let h = r.height() as usize;
        let src_stride = if src_stride == 0 { w } else { src_stride };
        let (buf, stride) = self.get_buffer_rw(r)?;
        own.buffer_from_buffer(buf, pf, src, w, h, stride, src_stride);
        self.commit_buffer_rw(r);
        Ok(())
    }
}

// ── ManagedPixelBuffer ───────────────────────────────────────────

/// A pixel buffer owning its memory.
///
/// The covered rect need not start at the origin, which lets a decoder
/// stage one incoming rect at its real framebuffer coordinates.
#[derive(Debug, Clone)]
pub struct ManagedPixelBuffer {
    pf: PixelFormat,
    rect: Rect,
    stride: usize,
    data: Vec<u8>,
}

impl ManagedPixelBuffer {
    /// A `width`×`height` buffer at the origin, zero filled.
    pub fn new(pf: PixelFormat, width: i32, height: i32) -> Self {
        Self::with_rect(pf, Rect::new(0, 0, width, height))
    }

    /// A zero-filled buffer covering `rect`.
    pub fn with_rect(pf: PixelFormat, rect: Rect) -> Self {
        let w = rect.width().max(0) as usize;
        let h = rect.height().max(0) as usize;
        Self {
            pf,
            rect,
            stride: w,
            data: vec![0; w * h * pf.bytes_per_pixel()],
        }
    }

    /// Resize to `width`×`height`, keeping the overlapping pixels.
    pub fn set_size(&mut self, width: i32, height: i32) {
        let mut next = Self::new(self.pf, width, height);
        let keep = self.rect.intersect(&next.rect);
        if let Ok((src, stride)) = self.get_buffer(&keep) {
            let _ = next.image_rect(&keep, src, stride);
        }
        *self = next;
    }

    /// Move the covered area without touching the pixels.
    pub fn set_origin(&mut self, tl: Point) {
        self.rect = Rect::from_xywh(tl.x, tl.y, self.rect.width(), self.rect.height());
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn offset(&self, p: Point) -> usize {
        (((p.y - self.rect.tl.y) as usize) * self.stride + (p.x - self.rect.tl.x) as usize)
            * self.pf.bytes_per_pixel()
    }
}

impl PixelBuffer for ManagedPixelBuffer {
    fn pf(&self) -> &PixelFormat {
        &self.pf
    }

    fn rect(&self) -> Rect {
        self.rect
    }

    fn get_buffer(&self, r: &Rect) -> Result<(&[u8], usize), RfbError> {
        check_bounds(r, &self.rect)?;
        if r.is_empty() {
            return Ok((&[], self.stride));
        }
        let start = self.offset(r.tl);
        let len = span_len(
            r.width() as usize,
            r.height() as usize,
            self.stride,
            self.pf.bytes_per_pixel(),
        );
        Ok((&self.data[start..start + len], self.stride))
    }
}

impl ModifiablePixelBuffer for ManagedPixelBuffer {
    fn get_buffer_rw(&mut self, r: &Rect) -> Result<(&mut [u8], usize), RfbError> {
        check_bounds(r, &self.rect)?;
        if r.is_empty() {
            return Ok((&mut [], self.stride));
        }
        let start = self.offset(r.tl);
        let len = span_len(
            r.width() as usize,
            r.height() as usize,
            self.stride,
            self.pf.bytes_per_pixel(),
        );
        Ok((&mut self.data[start..start + len], self.stride))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(w: i32, h: i32) -> ManagedPixelBuffer {
        let mut pb = ManagedPixelBuffer::new(PixelFormat::BGR233, w, h);
        for (i, b) in pb.data_mut().iter_mut().enumerate() {
            *b = i as u8;
        }
        pb
    }

    #[test]
    fn view_reads_rows_and_pixels() {
        let pb = numbered(8, 4);
        let v = pb.view(&Rect::new(2, 1, 5, 3)).unwrap();
        assert_eq!(v.width(), 3);
        assert_eq!(v.row(0), &[10, 11, 12]);
        assert_eq!(v.row(1), &[18, 19, 20]);
        assert_eq!(v.pixel::<u8>(2, 1), 20);
        let s = v.sub(1, 1, 2, 1);
        assert_eq!(s.row(0), &[19, 20]);
    }

    #[test]
    fn out_of_bounds_rejected() {
        let pb = numbered(4, 4);
        let err = pb.get_buffer(&Rect::new(2, 2, 5, 3)).unwrap_err();
        assert!(matches!(err, RfbError::OutOfBounds { .. }));
    }

    #[test]
    fn fill_and_image() {
        let mut pb = ManagedPixelBuffer::new(PixelFormat::RGB565, 4, 4);
        pb.fill_rect(&Rect::new(1, 1, 3, 3), &[0xAB, 0xCD]).unwrap();
        let mut out = vec![0u8; 4 * 4 * 2];
        pb.get_image(&mut out, &Rect::new(0, 0, 4, 4), 0).unwrap();
        assert_eq!(&out[(4 + 1) * 2..(4 + 1) * 2 + 2], &[0xAB, 0xCD]);
        assert_eq!(&out[0..2], &[0, 0]);

        pb.image_rect(&Rect::new(0, 0, 2, 1), &[1, 2, 3, 4], 0).unwrap();
        assert_eq!(&pb.data()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn copy_rect_overlapping_down_right() {
        let mut pb = numbered(6, 6);
        let before = pb.clone();
        let dest = Rect::new(1, 1, 5, 5);
        pb.copy_rect(&dest, Point::new(1, 1)).unwrap();
        for y in 1..5 {
            for x in 1..5 {
                assert_eq!(
                    pb.data()[(y * 6 + x) as usize],
                    before.data()[((y - 1) * 6 + x - 1) as usize]
                );
            }
        }
    }

    #[test]
    fn copy_rect_overlapping_up_left() {
        let mut pb = numbered(6, 6);
        let before = pb.clone();
        pb.copy_rect(&Rect::new(0, 0, 4, 4), Point::new(-2, -1)).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(
                    pb.data()[(y * 6 + x) as usize],
                    before.data()[((y + 1) * 6 + x + 2) as usize]
                );
            }
        }
    }

    #[test]
    fn copy_rect_source_outside_fails() {
        let mut pb = numbered(4, 4);
        assert!(pb.copy_rect(&Rect::new(0, 0, 2, 2), Point::new(1, 1)).is_err());
    }

    #[test]
    fn offset_buffer_addresses_framebuffer_coordinates() {
        let mut pb = ManagedPixelBuffer::with_rect(PixelFormat::BGR233, Rect::new(10, 20, 12, 22));
        pb.fill_rect(&Rect::new(11, 21, 12, 22), &[9]).unwrap();
        assert_eq!(pb.data(), &[0, 0, 0, 9]);
        assert!(pb.get_buffer(&Rect::new(0, 0, 1, 1)).is_err());
    }

    #[test]
    fn convert_on_write_and_read() {
        let mut pb = ManagedPixelBuffer::new(PixelFormat::RGB565, 2, 1);
        let src_pf = PixelFormat::RGB888;
        let mut src = [0u8; 8];
        src_pf.buffer_from_pixel(&mut src[..4], src_pf.pixel_from_rgb(255, 255, 255));
        pb.image_rect_pf(&src_pf, &Rect::new(0, 0, 2, 1), &src, 0).unwrap();
        assert_eq!(PixelFormat::RGB565.pixel_from_buffer(&pb.data()[0..2]), 0xFFFF);
        assert_eq!(PixelFormat::RGB565.pixel_from_buffer(&pb.data()[2..4]), 0);

        let mut back = [0u8; 8];
        pb.get_image_pf(&src_pf, &mut back, &Rect::new(0, 0, 2, 1), 0).unwrap();
        assert_eq!(src_pf.pixel_from_buffer(&back[..4]), 0x00FF_FFFF);

        pb.fill_rect_pf(&src_pf, &Rect::new(1, 0, 2, 1), 0x00FF_0000).unwrap();
        assert_eq!(PixelFormat::RGB565.pixel_from_buffer(&pb.data()[2..4]), 0xF800);
    }

    #[test]
    fn resize_keeps_overlap() {
        let mut pb = numbered(4, 4);
        pb.set_size(2, 6);
        assert_eq!(pb.rect(), Rect::new(0, 0, 2, 6));
        assert_eq!(&pb.data()[0..4], &[0, 1, 4, 5]);
        assert_eq!(pb.data()[8], 0);
    }
}
