// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use canonical_error::{invalid_argument_error, failed_precondition_error, CanonicalError};
use image::{ImageBuffer, Luma};
use imageproc::rect::Rect;
use log::{info, warn};

/// 12-bit camera samples carried in 16-bit words.
pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Clears bits 12-15 of each transferred 16-bit word. The camera delivers
/// 12-bit samples; the top nibble is not guaranteed to be zero after DMA.
/// Postcondition: every output value is <= 4095.
pub fn unpack_mono12(packed: &[u16], unpacked: &mut [u16]) {
    for (src, dst) in packed.iter().zip(unpacked.iter_mut()) {
        *dst = src & 0x0fff;
    }
}

/// Persistent hot-pixel list backed by a newline-delimited "x,y" text file.
/// File rows use the image-frame y convention; y is flipped to memory order
/// (stored as height - y) on load and flipped back when stamping.
pub struct StaticHotPixelMap {
    path: PathBuf,
    height: usize,

    // Memory-order (x, y) coordinates.
    pixels: Vec<(usize, usize)>,
}

impl StaticHotPixelMap {
    pub fn new<P: AsRef<Path>>(path: P, height: usize) -> Self {
        StaticHotPixelMap {
            path: path.as_ref().to_path_buf(),
            height,
            pixels: Vec::with_capacity(100),
        }
    }

    /// Reads the hot-pixel file, replacing the in-memory list. A missing
    /// file is not an error (there may not be a map yet for this sensor);
    /// a malformed file is.
    pub fn load(&mut self) -> Result<usize, CanonicalError> {
        self.pixels.clear();
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => {
                warn!("No static hot pixel map at {:?}", self.path);
                return Ok(0);
            }
        };
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| failed_precondition_error(
                format!("Error reading {:?}: {:?}", self.path, e).as_str()))?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.trim().split(',');
            let x = fields.next().and_then(|f| f.trim().parse::<usize>().ok());
            let y = fields.next().and_then(|f| f.trim().parse::<usize>().ok());
            match (x, y) {
                (Some(x), Some(y)) if y <= self.height => {
                    // Map the file's image-frame y to memory order.
                    self.pixels.push((x, self.height - y));
                }
                _ => {
                    return Err(invalid_argument_error(
                        format!("Bad hot pixel entry {:?} in {:?}",
                                line, self.path).as_str()));
                }
            }
        }
        info!("Loaded {} static hot pixels from {:?}",
              self.pixels.len(), self.path);
        Ok(self.pixels.len())
    }

    /// Scans `image` for pixels whose raw value exceeds `threshold`, rewrites
    /// the hot-pixel file with their coordinates (image-frame y convention),
    /// and reloads the in-memory list.
    pub fn stamp_from_image(&mut self, image: &[u16], width: usize,
                            threshold: u16) -> Result<usize, CanonicalError> {
        let file = File::create(&self.path).map_err(|e| failed_precondition_error(
            format!("Error creating {:?}: {:?}", self.path, e).as_str()))?;
        let mut writer = BufWriter::new(file);
        let mut count = 0;
        for yp in 0..self.height {
            for xp in 0..width {
                if image[yp * width + xp] > threshold {
                    writeln!(writer, "{},{}", xp, self.height - yp).map_err(
                        |e| failed_precondition_error(
                            format!("Error writing {:?}: {:?}",
                                    self.path, e).as_str()))?;
                    count += 1;
                }
            }
        }
        writer.flush().map_err(|e| failed_precondition_error(
            format!("Error writing {:?}: {:?}", self.path, e).as_str()))?;
        info!("Stamped {} hot pixels above {} to {:?}",
              count, threshold, self.path);
        self.load()
    }

    /// Zeroes every listed pixel in `mask`.
    pub fn apply(&self, mask: &mut [u8], width: usize) {
        for &(x, y) in &self.pixels {
            let ind = y * width + x;
            if ind < mask.len() {
                mask[ind] = 0;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Builds the per-pixel inclusion mask (1 = included) over `region`.
///
/// The outer one-pixel border of the region is always zeroed. With
/// `dynamic_hot_pixels`, an interior pixel is included iff its level (scaled
/// by the spike limit) is strictly below both the 4-cross and 4-diagonal
/// neighbour sums; otherwise the interior is all ones. The static map, when
/// supplied, zeroes its listed pixels regardless of the dynamic decision.
pub fn make_mask(image: &[u16], width: usize, region: &Rect,
                 spike_limit: i32, dynamic_hot_pixels: bool,
                 static_map: Option<&StaticHotPixelMap>, mask: &mut [u8]) {
    let mut i0 = region.left() as usize;
    let mut j0 = region.top() as usize;
    let mut i1 = (region.left() + region.width() as i32) as usize;
    let mut j1 = (region.top() + region.height() as i32) as usize;

    // Zero out borders of the mask array.
    for i in i0..i1 {
        mask[i + width * j0] = 0;
        mask[i + (j1 - 1) * width] = 0;
    }
    for j in j0..j1 {
        mask[i0 + j * width] = 0;
        mask[i1 - 1 + j * width] = 0;
    }
    i0 += 1;
    j0 += 1;
    i1 -= 1;
    j1 -= 1;

    if dynamic_hot_pixels {
        let cutoff = (spike_limit as i64 * 100).max(1);
        let mut num_hot = 0;
        for j in j0..j1 {
            for i in i0..i1 {
                let p0 = 100 * image[i + j * width] as i64 / cutoff;
                // Pixels left/right, above/below.
                let cross = image[i - 1 + j * width] as i64
                    + image[i + 1 + j * width] as i64
                    + image[i + (j + 1) * width] as i64
                    + image[i + (j - 1) * width] as i64
                    + 4;
                // Pixels on the diagonals.
                let diag = image[i - 1 + (j - 1) * width] as i64
                    + image[i + 1 + (j + 1) * width] as i64
                    + image[i - 1 + (j + 1) * width] as i64
                    + image[i + 1 + (j - 1) * width] as i64
                    + 4;
                let included = p0 < cross && p0 < diag;
                mask[i + j * width] = included as u8;
                if !included {
                    num_hot += 1;
                }
            }
        }
        if num_hot > 0 {
            info!("Found {} dynamic hot pixels", num_hot);
        }
    } else {
        for j in j0..j1 {
            for i in i0..i1 {
                mask[i + j * width] = 1;
            }
        }
    }

    if let Some(static_map) = static_map {
        static_map.apply(mask, width);
    }
}

/// Reusable intermediate storage for the separable boxcar filter.
#[derive(Default)]
pub struct BoxcarScratch {
    row_sums: Vec<i64>,
    row_counts: Vec<i32>,
}

impl BoxcarScratch {
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve(&mut self, num_pix: usize) {
        if self.row_sums.len() < num_pix {
            self.row_sums.resize(num_pix, 0);
            self.row_counts.resize(num_pix, 0);
        }
    }
}

/// Mask-aware separable boxcar average of radius `radius` over `region`.
///
/// Row stage: a sliding sum and included-pixel count over a window of width
/// 2r+1, advanced by subtracting the leaving pixel and adding the entering
/// pixel (both mask-multiplied). Column stage: per-row sums and counts summed
/// over a vertical strip of height 2r+1. Output is sum/count when any window
/// pixel is included; a window with zero included pixels reuses the last
/// valid output, which keeps the result finite in fully masked spans.
///
/// Only the region interior inset by `radius` is written; the caller owns
/// whatever `filtered` held outside that.
pub fn boxcar_filter(image: &[u16], mask: &[u8], width: usize, region: &Rect,
                     radius: usize, scratch: &mut BoxcarScratch,
                     filtered: &mut [f64]) {
    let i0 = region.left() as usize;
    let j0 = region.top() as usize;
    let i1 = (region.left() + region.width() as i32) as usize;
    let j1 = (region.top() + region.height() as i32) as usize;
    let r = radius;
    if i1 - i0 < 2 * r + 1 || j1 - j0 < 2 * r + 1 {
        return;
    }
    scratch.reserve(image.len());
    let row_sums = &mut scratch.row_sums;
    let row_counts = &mut scratch.row_counts;

    for j in j0..j1 {
        let mut n: i32 = 0;
        let mut isx: i64 = 0;
        for i in i0..i0 + 2 * r + 1 {
            n += mask[i + j * width] as i32;
            isx += image[i + j * width] as i64 * mask[i + j * width] as i64;
        }
        let mut idx = width * j + i0 + r;
        for _ in r + i0..i1 - r - 1 {
            row_sums[idx] = isx;
            row_counts[idx] = n;
            isx += mask[idx + r + 1] as i64 * image[idx + r + 1] as i64
                - mask[idx - r] as i64 * image[idx - r] as i64;
            n += mask[idx + r + 1] as i32 - mask[idx - r] as i32;
            idx += 1;
        }
        row_sums[idx] = isx;
        row_counts[idx] = n;
    }

    let mut last_value = 0.0;
    for j in j0 + r..j1 - r {
        for i in i0 + r..i1 - r {
            let mut s: i64 = 0;
            let mut n: i32 = 0;
            for jp in -(r as isize)..=r as isize {
                let idx = (i as isize + (j as isize + jp) * width as isize) as usize;
                s += row_sums[idx];
                n += row_counts[idx];
            }
            let value = if n > 0 {
                last_value = s as f64 / n as f64;
                last_value
            } else {
                last_value
            };
            filtered[i + j * width] = value;
        }
    }
}

// mod tests.
