// SPDX-License-Identifier: GPL-3.0-only

//! HDR exposure fusion
//!
//! Three exposures of the same scene (dark, base, bright) are merged into one
//! image. Each non-base exposure gets a scalar gain that maps its brightness
//! onto the base exposure's scale; pixels are then averaged with weights that
//! favour well-exposed values and the result is compressed back into 8 bits
//! with a global Reinhard-style operator keyed on the log-average luminance.
//!
//! The fused image is written into the base exposure's buffer, split into
//! horizontal bands that are processed on scoped threads.

use crate::config::SaverConfig;
use crate::constants::{self, hdr as k};
use crate::errors::HdrError;
use image::RgbImage;
use tracing::{debug, info, warn};

/// Per-exposure scalar gain onto the base exposure's brightness scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseFunction {
    pub gain: f32,
}

impl ResponseFunction {
    pub const IDENTITY: ResponseFunction = ResponseFunction { gain: 1.0 };

    /// Fit `base ≈ gain * exposure` over the sample grid
    ///
    /// Weighted least squares through the origin. Weights fall off linearly
    /// from the middle of the sampled brightness range, so clipped shadows
    /// and highlights barely count.
    pub fn calibrate(exposure: &RgbImage, base: &RgbImage) -> Self {
        let samples: Vec<(f64, f64)> = sample_grid(exposure.width(), exposure.height())
            .map(|(x, y)| {
                (
                    average_rgb(exposure.get_pixel(x, y).0),
                    average_rgb(base.get_pixel(x, y).0),
                )
            })
            .collect();
        Self::fit(&samples)
    }

    /// Fit from `(exposure, base)` brightness pairs
    pub fn fit(samples: &[(f64, f64)]) -> Self {
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, _)| {
                (lo.min(x), hi.max(x))
            });
        let mid = 0.5 * (min + max);

        let (mut numer, mut denom) = (0.0, 0.0);
        for &(x, y) in samples {
            let weight = if x <= mid { x - min } else { max - x };
            numer += weight * x * y;
            denom += weight * x * x;
        }

        if denom < k::RESPONSE_DENOM_EPSILON {
            debug!(denom, "Response fit degenerate, using identity");
            return Self::IDENTITY;
        }
        Self {
            gain: (numer / denom) as f32,
        }
    }
}

/// 10x10 grid of evenly spaced interior positions, row by row
pub fn sample_grid(width: u32, height: u32) -> impl Iterator<Item = (u32, u32)> {
    let n = k::SAMPLE_GRID;
    (0..n).flat_map(move |row| {
        let alpha = (row as f64 + 1.0) / (n as f64 + 1.0);
        let y = (alpha * height as f64) as u32;
        (0..n).map(move |col| {
            let beta = (col as f64 + 1.0) / (n as f64 + 1.0);
            ((beta * width as f64) as u32, y)
        })
    })
}

fn average_rgb(rgb: [u8; 3]) -> f64 {
    (rgb[0] as f64 + rgb[1] as f64 + rgb[2] as f64) / 3.0
}

/// Weighted mean of the gain-corrected exposures at one pixel
///
/// Each exposure is weighted by how close its own brightness is to
/// mid-grey; 0 and 255 still get a small non-zero weight.
pub fn fuse_pixel(pixels: [[u8; 3]; 3], responses: &[ResponseFunction; 3]) -> [f32; 3] {
    let mut hdr = [0.0f32; 3];
    let mut sum_weight = 0.0f32;
    for (pixel, response) in pixels.iter().zip(responses) {
        let [r, g, b] = pixel.map(|c| c as f32);
        let avg = (r + g + b) / 3.0;
        let weight = 1.0 - k::WEIGHT_SCALE * (k::WEIGHT_CENTER - avg).abs();
        hdr[0] += weight * response.gain * r;
        hdr[1] += weight * response.gain * g;
        hdr[2] += weight * response.gain * b;
        sum_weight += weight;
    }
    hdr.map(|c| c / sum_weight)
}

/// Compress a fused value into 0-255
pub fn tonemap(hdr: [f32; 3], l_avg: f32) -> [u8; 3] {
    let max = hdr[0].max(hdr[1]).max(hdr[2]);
    let denom = l_avg / k::TONEMAP_KEY + max;
    if denom <= 0.0 || !denom.is_finite() {
        return [0; 3];
    }
    let scale = 255.0 / denom;
    hdr.map(|c| (scale * c).round().clamp(0.0, 255.0) as u8)
}

fn luminance(hdr: [f32; 3]) -> f64 {
    k::LUMA_R * hdr[0] as f64 + k::LUMA_G * hdr[1] as f64 + k::LUMA_B * hdr[2] as f64
}

/// `exp(mean(log(L + 1)))` of the fused image, estimated on the sample grid
pub fn log_average_luminance(exposures: [&RgbImage; 3], responses: &[ResponseFunction; 3]) -> f32 {
    let (width, height) = exposures[0].dimensions();
    let mut sum_log = 0.0f64;
    let mut count = 0usize;
    for (x, y) in sample_grid(width, height) {
        let pixels = exposures.map(|image| image.get_pixel(x, y).0);
        let hdr = fuse_pixel(pixels, responses);
        sum_log += (luminance(hdr) + 1.0).ln();
        count += 1;
    }
    (sum_log / count.max(1) as f64).exp() as f32
}

/// Runs HDR fusion on a fixed number of row bands
#[derive(Debug, Clone, Copy)]
pub struct HdrProcessor {
    threads: usize,
}

impl Default for HdrProcessor {
    fn default() -> Self {
        Self::new(constants::worker_threads())
    }
}

impl HdrProcessor {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn from_config(config: &SaverConfig) -> Self {
        Self::new(config.hdr_threads.unwrap_or_else(constants::worker_threads))
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Fuse dark, base and bright exposures
    ///
    /// Returns the base exposure's buffer holding the tonemapped result. The
    /// dark and bright buffers are only read and are released on return.
    pub fn process(&self, exposures: [RgbImage; 3]) -> Result<RgbImage, HdrError> {
        let [dark, mut base, bright] = exposures;
        let (width, height) = base.dimensions();
        if width == 0 || height == 0 {
            return Err(HdrError::EmptyImage);
        }
        for (index, image) in [(0, &dark), (2, &bright)] {
            if image.dimensions() != (width, height) {
                return Err(HdrError::DimensionMismatch {
                    index,
                    width: image.width(),
                    height: image.height(),
                    expected_width: width,
                    expected_height: height,
                });
            }
        }

        let responses = [
            ResponseFunction::calibrate(&dark, &base),
            ResponseFunction::IDENTITY,
            ResponseFunction::calibrate(&bright, &base),
        ];
        let l_avg = log_average_luminance([&dark, &base, &bright], &responses);
        info!(
            width,
            height,
            dark_gain = responses[0].gain,
            bright_gain = responses[2].gain,
            l_avg,
            threads = self.threads,
            "Fusing HDR exposures"
        );

        self.fuse_in_bands(&mut base, &dark, &bright, &responses, l_avg);
        drop(dark);
        drop(bright);

        debug!("HDR fusion complete");
        Ok(base)
    }

    fn fuse_in_bands(
        &self,
        base: &mut RgbImage,
        dark: &RgbImage,
        bright: &RgbImage,
        responses: &[ResponseFunction; 3],
        l_avg: f32,
    ) {
        let width = base.width() as usize;
        let height = base.height() as usize;
        let row_len = width * 3;
        let bands = self.threads.min(height);
        let dark = dark.as_raw().as_slice();
        let bright = bright.as_raw().as_slice();

        std::thread::scope(|scope| {
            let mut rest: &mut [u8] = &mut **base;
            let mut handles = Vec::with_capacity(bands);
            for band in 0..bands {
                let y_start = band * height / bands;
                let y_stop = (band + 1) * height / bands;
                let (rows, tail) = std::mem::take(&mut rest).split_at_mut((y_stop - y_start) * row_len);
                rest = tail;

                let worker = BandWorker {
                    y_start,
                    row_len,
                    dark,
                    bright,
                    responses: *responses,
                    l_avg,
                };
                handles.push((band, scope.spawn(move || worker.run(rows))));
            }

            for (band, handle) in handles {
                if handle.join().is_err() {
                    warn!(band, "HDR band worker panicked, keeping rows written so far");
                }
            }
        });
    }
}

/// Fuses one contiguous band of rows
struct BandWorker<'a> {
    y_start: usize,
    row_len: usize,
    dark: &'a [u8],
    bright: &'a [u8],
    responses: [ResponseFunction; 3],
    l_avg: f32,
}

impl BandWorker<'_> {
    fn run(&self, rows: &mut [u8]) {
        let mut scratch = vec![0u8; self.row_len];
        for (index, out_row) in rows.chunks_exact_mut(self.row_len).enumerate() {
            let offset = (self.y_start + index) * self.row_len;
            let dark_row = &self.dark[offset..offset + self.row_len];
            let bright_row = &self.bright[offset..offset + self.row_len];
            scratch.copy_from_slice(out_row);

            for ((out, base), (dark, bright)) in out_row
                .chunks_exact_mut(3)
                .zip(scratch.chunks_exact(3))
                .zip(dark_row.chunks_exact(3).zip(bright_row.chunks_exact(3)))
            {
                let pixels = [
                    [dark[0], dark[1], dark[2]],
                    [base[0], base[1], base[2]],
                    [bright[0], bright[1], bright[2]],
                ];
                let hdr = fuse_pixel(pixels, &self.responses);
                out.copy_from_slice(&tonemap(hdr, self.l_avg));
            }
        }
    }
}
