//! Compass composite of the eight directional frames.
//!
//! Frames are tiled on a 3×3 grid with forward at the top centre and the
//! remaining headings placed clockwise around it:
//!
//! ```text
//! ┌────────────┬────────┬─────────────┐
//! │ Front-Left │ Front  │ Front-Right │
//! ├────────────┼────────┼─────────────┤
//! │ Left       │ (dial) │ Right       │
//! ├────────────┼────────┼─────────────┤
//! │ Back-Left  │ Back   │ Back-Right  │
//! └────────────┴────────┴─────────────┘
//! ```
//!
//! The centre tile is a dark dial with a lighter ring.  Headings without a
//! frame are filled with a darker grey.  Composites are only built from raw
//! [`PixelFormat::Rgb8`] frames that all share one size.
//!
//! [`encode_png`] turns raw frames into PNG, both for composites on disk and
//! for images attached to reasoning requests.

use std::fs;
use std::io;
use std::path::Path;

use subnav_types::{Direction, PixelFormat, SensorFrame};

use crate::aggregator::DirectionalFrame;

const CENTER_SHADE: u8 = 50;
const RING_SHADE: u8 = 100;
const EMPTY_SHADE: u8 = 30;

/// `(row, col)` of each heading in [`Direction::ALL`] order.
const GRID: [(usize, usize); 8] = [
    (0, 1),
    (0, 2),
    (1, 2),
    (2, 2),
    (2, 1),
    (2, 0),
    (1, 0),
    (0, 0),
];

/// Grid cell a heading is drawn in.
pub fn cell(direction: Direction) -> (usize, usize) {
    GRID[direction.index()]
}

/// Build the composite, or `None` when the frames cannot be tiled (encoded
/// images, mixed sizes, or no frames at all).
pub fn render(frames: &[DirectionalFrame]) -> Option<SensorFrame> {
    let first = frames.first()?;
    let (w, h) = (first.frame.width as usize, first.frame.height as usize);
    let tileable = frames.iter().all(|f| {
        f.frame.format == PixelFormat::Rgb8
            && f.frame.width as usize == w
            && f.frame.height as usize == h
            && f.frame.data.len() == w * h * 3
    });
    if !tileable || w == 0 || h == 0 {
        return None;
    }

    let out_w = w * 3;
    let mut out = SensorFrame::solid(out_w as u32, (h * 3) as u32, [EMPTY_SHADE; 3]);

    for f in frames {
        let (row, col) = cell(f.direction);
        blit(&mut out.data, out_w, &f.frame.data, w, h, row, col);
    }

    let dial = dial(w, h);
    blit(&mut out.data, out_w, &dial, w, h, 1, 1);
    Some(out)
}

fn blit(dst: &mut [u8], dst_w: usize, src: &[u8], w: usize, h: usize, row: usize, col: usize) {
    for y in 0..h {
        let src_start = y * w * 3;
        let dst_start = ((row * h + y) * dst_w + col * w) * 3;
        dst[dst_start..dst_start + w * 3].copy_from_slice(&src[src_start..src_start + w * 3]);
    }
}

fn dial(w: usize, h: usize) -> Vec<u8> {
    let mut data = vec![CENTER_SHADE; w * h * 3];
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let radius = w.min(h) as f64 / 3.0;
    for y in 0..h {
        for x in 0..w {
            let d = ((x as f64 + 0.5 - cx).powi(2) + (y as f64 + 0.5 - cy).powi(2)).sqrt();
            if (d - radius).abs() < 1.0 {
                let i = (y * w + x) * 3;
                data[i..i + 3].fill(RING_SHADE);
            }
        }
    }
    data
}

/// Encode a raw RGB frame as PNG.
pub fn encode_png(frame: &SensorFrame) -> io::Result<Vec<u8>> {
    if frame.format != PixelFormat::Rgb8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "only raw RGB frames can be encoded as PNG",
        ));
    }
    let mut out = Vec::new();
    let mut encoder = png::Encoder::new(&mut out, frame.width, frame.height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().map_err(io::Error::other)?;
    writer
        .write_image_data(&frame.data)
        .map_err(io::Error::other)?;
    writer.finish().map_err(io::Error::other)?;
    Ok(out)
}

/// Write a raw RGB frame as a PNG file.
pub fn write_png(path: &Path, frame: &SensorFrame) -> io::Result<()> {
    fs::write(path, encode_png(frame)?)
}
