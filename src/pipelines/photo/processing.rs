// SPDX-License-Identifier: GPL-3.0-only

//! Raster transform chain
//!
//! Stages run in a fixed order, each one optional:
//!
//! ```text
//! decode → auto-stabilise → mirror → stamp
//! ```
//!
//! Every stage takes its buffer by value and returns the replacement, so the
//! previous frame is released as soon as the next one exists. A full-size
//! frame is tens of megabytes; never hold two generations longer than the
//! transform itself needs.

use crate::errors::{PhotoError, PhotoResult};
use image::{Rgb, RgbImage};
use tracing::{debug, info, warn};

/// 2x3 affine transform mapping source coordinates to destination
/// coordinates (`x' = a*x + b*y + c`, `y' = d*x + e*y + f`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
}

impl Affine {
    pub const IDENTITY: Affine = Affine {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 0.0,
        e: 1.0,
        f: 0.0,
    };

    pub fn scale(sx: f64, sy: f64) -> Self {
        Affine {
            a: sx,
            e: sy,
            ..Self::IDENTITY
        }
    }

    pub fn translate(tx: f64, ty: f64) -> Self {
        Affine {
            c: tx,
            f: ty,
            ..Self::IDENTITY
        }
    }

    /// Clockwise rotation on screen (y axis pointing down)
    pub fn rotate_degrees(degrees: f64) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Affine {
            a: cos,
            b: -sin,
            c: 0.0,
            d: sin,
            e: cos,
            f: 0.0,
        }
    }

    /// `self` followed by `next`
    pub fn then(self, next: Affine) -> Affine {
        Affine {
            a: next.a * self.a + next.b * self.d,
            b: next.a * self.b + next.b * self.e,
            c: next.a * self.c + next.b * self.f + next.c,
            d: next.d * self.a + next.e * self.d,
            e: next.d * self.b + next.e * self.e,
            f: next.d * self.c + next.e * self.f + next.f,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.c,
            self.d * x + self.e * y + self.f,
        )
    }

    pub fn inverse(&self) -> Option<Affine> {
        let det = self.a * self.e - self.b * self.d;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let a = self.e / det;
        let b = -self.b / det;
        let d = -self.d / det;
        let e = self.a / det;
        Some(Affine {
            a,
            b,
            c: -(a * self.c + b * self.f),
            d,
            e,
            f: -(d * self.c + e * self.f),
        })
    }
}

/// Decode an encoded image to RGB
///
/// A failure here aborts only the image being decoded.
pub fn decode(data: &[u8]) -> PhotoResult<RgbImage> {
    let image = image::load_from_memory(data)
        .map_err(|e| PhotoError::DecodeFailed(e.to_string()))?;
    let rgb = image.into_rgb8();
    debug!(
        width = rgb.width(),
        height = rgb.height(),
        bytes = data.len(),
        "Decoded image"
    );
    Ok(rgb)
}

/// Decode a batch concurrently, one thread per image
///
/// Either every image decodes or the whole batch is released and the first
/// failure is returned.
pub fn decode_batch(images: &[Vec<u8>]) -> PhotoResult<Vec<RgbImage>> {
    let results: Vec<PhotoResult<RgbImage>> = std::thread::scope(|scope| {
        let handles: Vec<_> = images
            .iter()
            .map(|data| scope.spawn(move || decode(data)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(PhotoError::DecodeFailed("decoder thread panicked".into()))
                })
            })
            .collect()
    });

    // Dropping the partial Vec on error releases the images that did decode
    results.into_iter().collect()
}

/// Resample `src` through `transform`
///
/// The output is sized to the bounding box of the transformed source
/// rectangle and shifted so that box starts at the origin. Pixels that map
/// outside the source are left black. Sampling is bilinear at pixel centres,
/// so transforms that map centres onto centres copy pixels exactly.
pub fn transform_image(src: &RgbImage, transform: Affine) -> RgbImage {
    let (width, height) = src.dimensions();
    let (w, h) = (width as f64, height as f64);

    let corners = [
        transform.apply(0.0, 0.0),
        transform.apply(w, 0.0),
        transform.apply(0.0, h),
        transform.apply(w, h),
    ];
    let min_x = corners.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

    let out_width = ((max_x - min_x).round() as u32).max(1);
    let out_height = ((max_y - min_y).round() as u32).max(1);

    let placed = transform.then(Affine::translate(-min_x, -min_y));
    let Some(inverse) = placed.inverse() else {
        warn!("Degenerate transform, returning blank image");
        return RgbImage::new(out_width, out_height);
    };

    let mut out = RgbImage::new(out_width, out_height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = inverse.apply(x as f64 + 0.5, y as f64 + 0.5);
        if let Some(rgb) = sample_bilinear(src, sx, sy) {
            *pixel = rgb;
        }
    }
    out
}

/// Bilinear sample with source pixel centres at `i + 0.5`
fn sample_bilinear(src: &RgbImage, sx: f64, sy: f64) -> Option<Rgb<u8>> {
    let (width, height) = src.dimensions();
    if sx < 0.0 || sy < 0.0 || sx > width as f64 || sy > height as f64 {
        return None;
    }

    let fx = (sx - 0.5).clamp(0.0, (width - 1) as f64);
    let fy = (sy - 0.5).clamp(0.0, (height - 1) as f64);
    let x0 = fx.floor() as u32;
    let y0 = fy.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let tx = fx - x0 as f64;
    let ty = fy - y0 as f64;

    let p00 = src.get_pixel(x0, y0);
    let p10 = src.get_pixel(x1, y0);
    let p01 = src.get_pixel(x0, y1);
    let p11 = src.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let top = p00[c] as f64 * (1.0 - tx) + p10[c] as f64 * tx;
        let bottom = p01[c] as f64 * (1.0 - tx) + p11[c] as f64 * tx;
        *value = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgb(out))
}

/// Fold an angle into [-90, 90]
pub fn normalize_level_angle(mut angle: f64) -> f64 {
    while angle < -90.0 {
        angle += 180.0;
    }
    while angle > 90.0 {
        angle -= 180.0;
    }
    angle
}

/// Crop rectangle (x, y, width, height) that removes rotation borders
///
/// `w0`/`h0` are the scaled bounding box of the rotated frame, `w1`/`h1` the
/// scaled original frame, `buffer_width`/`buffer_height` the actual rotated
/// buffer. Returns None when the geometry is degenerate.
pub fn stabilise_crop(
    angle_rad_abs: f64,
    (w0, h0): (f64, f64),
    (w1, h1): (f64, f64),
    (buffer_width, buffer_height): (u32, u32),
) -> Option<(u32, u32, u32, u32)> {
    let tan_theta = angle_rad_abs.tan();
    let sin_theta = angle_rad_abs.sin();
    let denom = h0 / w0 + tan_theta;
    let alt_denom = w0 / h0 + tan_theta;
    if denom < 1.0e-14 || alt_denom < 1.0e-14 {
        return None;
    }

    // Width-constrained and height-constrained solutions; keep the narrower
    let mut w2 = ((h0 + 2.0 * h1 * sin_theta * tan_theta - w0 * tan_theta) / denom) as i64;
    let mut h2 = (w2 as f64 * h0 / w0) as i64;
    let alt_h2 = ((w0 + 2.0 * w1 * sin_theta * tan_theta - h0 * tan_theta) / alt_denom) as i64;
    let alt_w2 = (alt_h2 as f64 * w0 / h0) as i64;
    if alt_w2 < w2 {
        w2 = alt_w2;
        h2 = alt_h2;
    }

    let w2 = clamp_crop(w2, buffer_width);
    let h2 = clamp_crop(h2, buffer_height);
    let x0 = (buffer_width - w2) / 2;
    let y0 = (buffer_height - h2) / 2;
    Some((x0, y0, w2, h2))
}

/// Clamp to [1, dimension - 1]
fn clamp_crop(value: i64, dimension: u32) -> u32 {
    let upper = (dimension as i64 - 1).max(1);
    value.clamp(1, upper) as u32
}

/// Rotate the frame so the horizon is level, then crop the rotation borders
///
/// The rotation is scaled so the pixel count does not grow. Front-facing
/// captures are mirrored, so their correction runs the other way.
pub fn auto_stabilise(bitmap: RgbImage, level_angle: f64, is_front_facing: bool) -> RgbImage {
    let level_angle = normalize_level_angle(level_angle);
    if level_angle == 0.0 {
        return bitmap;
    }

    let (width, height) = bitmap.dimensions();
    info!(width, height, level_angle, is_front_facing, "Auto-stabilising");

    let angle_rad_abs = level_angle.to_radians().abs();
    let (mut w1, mut h1) = (width as f64, height as f64);
    let mut w0 = w1 * angle_rad_abs.cos() + h1 * angle_rad_abs.sin();
    let mut h0 = w1 * angle_rad_abs.sin() + h1 * angle_rad_abs.cos();

    let scale = ((w1 * h1) / (w0 * h0)).sqrt();
    w0 *= scale;
    h0 *= scale;
    w1 *= scale;
    h1 *= scale;
    debug!(scale, w0, h0, w1, h1, "Stabilise geometry");

    let rotation = if is_front_facing {
        -level_angle
    } else {
        level_angle
    };
    let transform = Affine::scale(scale, scale).then(Affine::rotate_degrees(rotation));
    let rotated = transform_image(&bitmap, transform);
    drop(bitmap);

    let dimensions = rotated.dimensions();
    match stabilise_crop(angle_rad_abs, (w0, h0), (w1, h1), dimensions) {
        Some((x0, y0, w2, h2)) => {
            debug!(x0, y0, w2, h2, "Cropping rotation borders");
            image::imageops::crop_imm(&rotated, x0, y0, w2, h2).to_image()
        }
        None => {
            warn!("Degenerate stabilise geometry, keeping uncropped rotation");
            rotated
        }
    }
}

/// Flip horizontally
pub fn mirror_image(bitmap: RgbImage) -> RgbImage {
    debug!(
        width = bitmap.width(),
        height = bitmap.height(),
        "Mirroring image"
    );
    transform_image(&bitmap, Affine::scale(-1.0, 1.0))
}
