//! The decoded screen: a fixed-size grid of packed `0x00RRGGBB` pixels.

use std::io::{self, Write};

use super::wire::{RectPayload, Rectangle};

/// Bytes per pixel in the format the client requests (32 bpp).
pub const BYTES_PER_PIXEL: usize = 4;

/// An update did not fit the frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("rectangle {w}x{h}+{x}+{y} exceeds {frame_w}x{frame_h} frame")]
    OutOfBounds {
        x: u16,
        y: u16,
        w: u16,
        h: u16,
        frame_w: u16,
        frame_h: u16,
    },
    #[error("raw rectangle needs {expected} bytes, got {actual}")]
    ShortPayload { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u16,
    height: u16,
    pixels: Vec<u32>,
}

impl FrameBuffer {
    /// A black frame of the given size.
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; usize::from(width) * usize::from(height)],
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Row-major pixels, `width * height` long.
    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(self.index(x, y)).copied()
    }

    /// `(red, green, blue)` at `(x, y)`.
    pub fn rgb(&self, x: u16, y: u16) -> Option<(u8, u8, u8)> {
        self.pixel(x, y).map(unpack)
    }

    fn index(&self, x: u16, y: u16) -> usize {
        usize::from(y) * usize::from(self.width) + usize::from(x)
    }

    fn check_bounds(&self, x: u16, y: u16, w: u16, h: u16) -> Result<(), FrameError> {
        let fits = u32::from(x) + u32::from(w) <= u32::from(self.width)
            && u32::from(y) + u32::from(h) <= u32::from(self.height);
        if fits {
            Ok(())
        } else {
            Err(FrameError::OutOfBounds {
                x,
                y,
                w,
                h,
                frame_w: self.width,
                frame_h: self.height,
            })
        }
    }

    /// Apply one decoded rectangle.
    pub fn apply(&mut self, rect: &Rectangle) -> Result<(), FrameError> {
        match &rect.payload {
            RectPayload::Raw(data) => self.put_raw(rect.x, rect.y, rect.width, rect.height, data),
            RectPayload::CopyRect { src_x, src_y } => {
                self.copy_rect(*src_x, *src_y, rect.x, rect.y, rect.width, rect.height)
            }
        }
    }

    /// Write raw pixel data, 4 bytes per pixel as (blue, green, red, unused).
    pub fn put_raw(&mut self, x: u16, y: u16, w: u16, h: u16, data: &[u8]) -> Result<(), FrameError> {
        self.check_bounds(x, y, w, h)?;
        let expected = usize::from(w) * usize::from(h) * BYTES_PER_PIXEL;
        if data.len() < expected {
            return Err(FrameError::ShortPayload {
                expected,
                actual: data.len(),
            });
        }
        if w == 0 {
            return Ok(());
        }

        let row_bytes = usize::from(w) * BYTES_PER_PIXEL;
        for (row, src) in data[..expected].chunks_exact(row_bytes).enumerate() {
            let start = self.index(x, y + row as u16);
            let dst = &mut self.pixels[start..start + usize::from(w)];
            for (px, bgrx) in dst.iter_mut().zip(src.chunks_exact(BYTES_PER_PIXEL)) {
                *px = pack(bgrx[2], bgrx[1], bgrx[0]);
            }
        }
        Ok(())
    }

    /// Copy the `w`x`h` block at `(src_x, src_y)` to `(x, y)`. Overlapping
    /// source and destination are handled.
    pub fn copy_rect(
        &mut self,
        src_x: u16,
        src_y: u16,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
    ) -> Result<(), FrameError> {
        self.check_bounds(src_x, src_y, w, h)?;
        self.check_bounds(x, y, w, h)?;

        let len = usize::from(w);
        let mut copy_row = |row: u16| {
            let from = self.index(src_x, src_y + row);
            let to = self.index(x, y + row);
            self.pixels.copy_within(from..from + len, to);
        };

        // Moving down: walk bottom-up so source rows are read before being overwritten.
        if y > src_y {
            (0..h).rev().for_each(&mut copy_row);
        } else {
            (0..h).for_each(&mut copy_row);
        }
        Ok(())
    }

    /// Write the frame as a binary PPM (`P6`) image.
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        let mut bytes = Vec::with_capacity(self.pixels.len() * 3);
        for &px in &self.pixels {
            let (r, g, b) = unpack(px);
            bytes.extend_from_slice(&[r, g, b]);
        }
        out.write_all(&bytes)?;
        out.flush()
    }
}

pub fn pack(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

pub fn unpack(px: u32) -> (u8, u8, u8) {
    ((px >> 16) as u8, (px >> 8) as u8, px as u8)
}
