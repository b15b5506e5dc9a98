//! Synthetic desktop used to drive a session.
//!
//! A solid background with a gradient taskbar, one window bouncing
//! around (moved with a copy, so CopyRect gets exercised), a clock in
//! the taskbar that repaints every frame and a patch of noise every
//! tenth frame. Every change is reported to the tracker passed to
//! [`Scene::step`], the way a real server's capture layer would.

use rfb_core::{
    ManagedPixelBuffer, ModifiablePixelBuffer, PixelBuffer, PixelFormat, Point, Rect, Region,
    RfbError, UpdateTracker,
};

const TASKBAR_HEIGHT: i32 = 24;
const CLOCK_WIDTH: i32 = 48;
const NOISE_SIZE: i32 = 32;
const NOISE_EVERY: u64 = 10;

// ── Scene ────────────────────────────────────────────────────────

pub struct Scene {
    fb: ManagedPixelBuffer,
    frame: u64,
    window: Rect,
    velocity: Point,
    background: u32,
    seed: u32,
}

impl Scene {
    /// Paint the initial desktop.
    pub fn new(pf: PixelFormat, width: i32, height: i32) -> Result<Self, RfbError> {
        let mut fb = ManagedPixelBuffer::new(pf, width, height);
        let background = pf.pixel_from_rgb(0x20, 0x50, 0x80);

        let desktop = Rect::new(0, 0, width, height - TASKBAR_HEIGHT);
        fb.fill_rect_pf(&pf, &desktop, background)?;
        paint(&mut fb, &Rect::new(0, height - TASKBAR_HEIGHT, width, height), |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            pf.pixel_from_rgb(v / 4, v / 4, 0x40 + v / 2)
        })?;

        let ww = (width / 4).max(32);
        let wh = (desktop.height() / 4).max(32);
        let window = Rect::from_xywh(8, 8, ww, wh);
        paint_window(&mut fb, &window)?;

        Ok(Self {
            fb,
            frame: 0,
            window,
            velocity: Point::new(7, 5),
            background,
            seed: 0x1234_5678,
        })
    }

    pub fn framebuffer(&self) -> &ManagedPixelBuffer {
        &self.fb
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Advance one frame, reporting what changed to `tracker`.
    pub fn step(&mut self, tracker: &mut dyn UpdateTracker) -> Result<(), RfbError> {
        self.frame += 1;
        self.move_window(tracker)?;
        self.draw_clock(tracker)?;
        if self.frame % NOISE_EVERY == 0 {
            self.draw_noise(tracker)?;
        }
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────

    fn desktop(&self) -> Rect {
        Rect::new(0, 0, self.fb.width(), self.fb.height() - TASKBAR_HEIGHT)
    }

    fn move_window(&mut self, tracker: &mut dyn UpdateTracker) -> Result<(), RfbError> {
        let desktop = self.desktop();
        let old = self.window;

        let mut next = old.translate(self.velocity);
        if next.tl.x < desktop.tl.x || next.br.x > desktop.br.x {
            self.velocity.x = -self.velocity.x;
        }
        if next.tl.y < desktop.tl.y || next.br.y > desktop.br.y {
            self.velocity.y = -self.velocity.y;
        }
        next = old.translate(self.velocity);
        if !next.enclosed_by(&desktop) {
            return Ok(());
        }

        let delta = next.tl.subtract(old.tl);
        self.fb.copy_rect(&next, delta)?;
        tracker.add_copied(&Region::from(next), delta);

        let exposed = Region::from(old).subtract(&Region::from(next));
        let pf = *self.fb.pf();
        for r in exposed.rects() {
            self.fb.fill_rect_pf(&pf, r, self.background)?;
        }
        tracker.add_changed(&exposed);

        self.window = next;
        Ok(())
    }

    fn draw_clock(&mut self, tracker: &mut dyn UpdateTracker) -> Result<(), RfbError> {
        let w = self.fb.width();
        let h = self.fb.height();
        let r = Rect::new(w - CLOCK_WIDTH - 4, h - TASKBAR_HEIGHT + 4, w - 4, h - 4);
        let pf = *self.fb.pf();
        let colours = [
            pf.pixel_from_rgb(0, 0, 0),
            pf.pixel_from_rgb(0xFF, 0xFF, 0xFF),
            pf.pixel_from_rgb(0xC0, 0xC0, 0xC0),
            pf.pixel_from_rgb(0xFF, 0xC0, 0x00),
        ];
        // seconds tick every 8 frames; most frames repaint identical pixels
        let tick = (self.frame / 8) as i32;
        paint(&mut self.fb, &r, |x, y| {
            colours[((x / 6 + y / 4 + tick) & 3) as usize]
        })?;
        tracker.add_changed(&Region::from(r));
        Ok(())
    }

    fn draw_noise(&mut self, tracker: &mut dyn UpdateTracker) -> Result<(), RfbError> {
        let desktop = self.desktop();
        let span_x = (desktop.width() - NOISE_SIZE).max(1);
        let span_y = (desktop.height() - NOISE_SIZE).max(1);
        let x = (self.next_random() % span_x as u32) as i32;
        let y = (self.next_random() % span_y as u32) as i32;
        let r = Rect::from_xywh(x, y, NOISE_SIZE, NOISE_SIZE).intersect(&desktop);

        let pf = *self.fb.pf();
        let mut seed = self.next_random();
        paint(&mut self.fb, &r, |_, _| {
            seed = xorshift(seed);
            pf.pixel_from_rgb(seed as u8, (seed >> 8) as u8, (seed >> 16) as u8)
        })?;
        tracker.add_changed(&Region::from(r));
        Ok(())
    }

    fn next_random(&mut self) -> u32 {
        self.seed = xorshift(self.seed);
        self.seed
    }
}

// ── Painting ─────────────────────────────────────────────────────

fn xorshift(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// Fill `r` with `f(x, y)` pixels given in the buffer's own format.
fn paint(
    fb: &mut ManagedPixelBuffer,
    r: &Rect,
    mut f: impl FnMut(i32, i32) -> u32,
) -> Result<(), RfbError> {
    let pf = *fb.pf();
    let bpp = pf.bytes_per_pixel();
    let mut buf = vec![0u8; r.area() as usize * bpp];
    let mut px = buf.chunks_exact_mut(bpp);
    for y in r.tl.y..r.br.y {
        for x in r.tl.x..r.br.x {
            if let Some(out) = px.next() {
                pf.buffer_from_pixel(out, f(x, y));
            }
        }
    }
    fb.image_rect(r, &buf, 0)
}

/// Title bar plus two-colour "text" lines.
fn paint_window(fb: &mut ManagedPixelBuffer, r: &Rect) -> Result<(), RfbError> {
    let pf = *fb.pf();
    let title = pf.pixel_from_rgb(0x00, 0x30, 0x90);
    let paper = pf.pixel_from_rgb(0xF0, 0xF0, 0xF0);
    let ink = pf.pixel_from_rgb(0x10, 0x10, 0x10);
    let top = r.tl.y;
    paint(fb, r, |x, y| {
        let row = y - top;
        if row < 12 {
            return title;
        }
        let line = (row - 12) % 10;
        let glyph = (x * 3 + (row / 10) * 7) % 11;
        if line < 7 && glyph < 5 && (x + line) % 3 != 0 { ink } else { paper }
    })
}

// ── Tests ────────────────────────────────────────────────────────
