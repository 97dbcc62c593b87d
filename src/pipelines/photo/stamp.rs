// SPDX-License-Identifier: GPL-3.0-only

//! Photo stamp overlay
//!
//! Burns date/time, location and free text into the bottom-right corner of
//! the image. Sizes are given in points and scaled as if the shorter side of
//! the image were printed 4" long, so a stamp looks the same on a 2MP and a
//! 50MP capture.

use super::request::GpsFix;
use crate::constants::stamp as metrics;
use chrono::{DateTime, Local};
use font8x8::UnicodeFonts;
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Glyph rendering style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StampStyle {
    /// Filled glyphs on a translucent dark box
    #[default]
    Plain,
    /// Filled glyphs with a dark outline and no box
    Shadowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateFormat {
    /// `Mar 9, 2024`
    #[default]
    Default,
    /// `2024/03/09`
    YearMonthDay,
    /// `09/03/2024`
    DayMonthYear,
    /// `03/09/2024`
    MonthDayYear,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeFormat {
    /// `2:05:07 PM`
    #[default]
    Default,
    /// `02:05:07 PM`
    TwelveHour,
    /// `14:05:07`
    TwentyFourHour,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GpsFormat {
    /// `51.50073, -0.12463`
    #[default]
    Decimal,
    /// `51°30'2"N, 0°7'28"W`
    Dms,
    None,
}

/// What to stamp and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StampOptions {
    /// Stamp date/time and location lines
    pub datetime_geo: bool,
    /// Free-form text stamped above the other lines (empty = none)
    pub text: String,
    /// Font size in points
    pub font_size: u32,
    pub color: [u8; 3],
    pub style: StampStyle,
    pub date_format: DateFormat,
    pub time_format: TimeFormat,
    pub gps_format: GpsFormat,
}

impl Default for StampOptions {
    fn default() -> Self {
        Self {
            datetime_geo: false,
            text: String::new(),
            font_size: metrics::DEFAULT_FONT_SIZE_PT,
            color: [255, 255, 255],
            style: StampStyle::Plain,
            date_format: DateFormat::Default,
            time_format: TimeFormat::Default,
            gps_format: GpsFormat::Decimal,
        }
    }
}

impl StampOptions {
    /// Whether the overlay would draw anything
    pub fn is_enabled(&self) -> bool {
        self.datetime_geo || !self.text.is_empty()
    }
}

/// Stamp size in pixels derived from the image's shorter side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampMetrics {
    pub font_px: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub line_pitch: u32,
}

impl StampMetrics {
    pub fn for_image(width: u32, height: u32, font_size: u32) -> Self {
        let smallest = width.min(height) as f32;
        let scale = smallest / (metrics::POINTS_PER_INCH * metrics::NOMINAL_INCHES);
        let to_px = |pt: f32| (pt * scale + 0.5) as u32;
        Self {
            font_px: to_px(font_size as f32),
            offset_x: to_px(metrics::EDGE_OFFSET_PT),
            offset_y: to_px(metrics::EDGE_OFFSET_PT),
            line_pitch: to_px(font_size as f32 + metrics::LINE_GAP_PT),
        }
    }
}

/// Date and time line; empty when both formats are `None`
pub fn datetime_text(date: &DateTime<Local>, date_format: DateFormat, time_format: TimeFormat) -> String {
    let date_part = match date_format {
        DateFormat::Default => date.format("%b %-d, %Y").to_string(),
        DateFormat::YearMonthDay => date.format("%Y/%m/%d").to_string(),
        DateFormat::DayMonthYear => date.format("%d/%m/%Y").to_string(),
        DateFormat::MonthDayYear => date.format("%m/%d/%Y").to_string(),
        DateFormat::None => String::new(),
    };
    let time_part = match time_format {
        TimeFormat::Default => date.format("%-I:%M:%S %p").to_string(),
        TimeFormat::TwelveHour => date.format("%I:%M:%S %p").to_string(),
        TimeFormat::TwentyFourHour => date.format("%H:%M:%S").to_string(),
        TimeFormat::None => String::new(),
    };

    match (date_part.is_empty(), time_part.is_empty()) {
        (false, false) => format!("{} {}", date_part, time_part),
        (false, true) => date_part,
        _ => time_part,
    }
}

/// Location line: coordinates, altitude and heading, each when available
pub fn gps_text(format: GpsFormat, location: Option<&GpsFix>, heading: Option<f64>) -> String {
    if format == GpsFormat::None {
        return String::new();
    }

    let mut parts = Vec::new();
    if let Some(fix) = location {
        match format {
            GpsFormat::Dms => {
                parts.push(to_dms(fix.latitude, 'N', 'S'));
                parts.push(to_dms(fix.longitude, 'E', 'W'));
            }
            _ => {
                parts.push(to_decimal(fix.latitude));
                parts.push(to_decimal(fix.longitude));
            }
        }
        if let Some(altitude) = fix.altitude {
            parts.push(format!("{:.1}m", altitude));
        }
    }
    if let Some(heading) = heading {
        let heading = if heading < 0.0 { heading + 360.0 } else { heading };
        parts.push(format!("{}°", heading.round() as i64));
    }
    parts.join(", ")
}

/// Up to five decimals, trailing zeros dropped
fn to_decimal(value: f64) -> String {
    let text = format!("{:.5}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" { "0".to_string() } else { text.to_string() }
}

fn to_dms(value: f64, positive: char, negative: char) -> String {
    let hemisphere = if value < 0.0 { negative } else { positive };
    let total_seconds = (value.abs() * 3600.0).round() as u64;
    let degrees = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{}°{}'{}\"{}", degrees, minutes, seconds, hemisphere)
}

/// Draw the configured lines onto `bitmap`
///
/// Lines stack upwards from the bottom-right corner: date/time, location,
/// then free text. The date/time slot is always reserved when date/geo
/// stamping is on, even if both formats are disabled.
pub fn stamp_overlay(
    bitmap: &mut RgbImage,
    options: &StampOptions,
    date: &DateTime<Local>,
    location: Option<&GpsFix>,
    heading: Option<f64>,
) {
    if !options.is_enabled() {
        return;
    }

    let (width, height) = bitmap.dimensions();
    let m = StampMetrics::for_image(width, height, options.font_size);
    let right = width as i64 - m.offset_x as i64;
    let mut ypos = height as i64 - m.offset_y as i64;
    debug!(
        width,
        height,
        font_px = m.font_px,
        line_pitch = m.line_pitch,
        "Stamping image"
    );

    let painter = TextPainter {
        cell: (m.font_px / metrics::GLYPH_CELLS).max(1),
        color: Rgb(options.color),
        style: options.style,
    };

    if options.datetime_geo {
        let datetime = datetime_text(date, options.date_format, options.time_format);
        if !datetime.is_empty() {
            painter.draw_right_aligned(bitmap, &datetime, right, ypos);
        }
        ypos -= m.line_pitch as i64;

        let gps = gps_text(options.gps_format, location, heading);
        if !gps.is_empty() {
            painter.draw_right_aligned(bitmap, &gps, right, ypos);
            ypos -= m.line_pitch as i64;
        }
    }
    if !options.text.is_empty() {
        painter.draw_right_aligned(bitmap, &options.text, right, ypos);
    }
}

struct TextPainter {
    /// Pixels per glyph cell
    cell: u32,
    color: Rgb<u8>,
    style: StampStyle,
}

impl TextPainter {
    fn glyph(c: char) -> [u8; 8] {
        font8x8::BASIC_FONTS
            .get(c)
            .or_else(|| font8x8::LATIN_FONTS.get(c))
            .or_else(|| font8x8::BASIC_FONTS.get('?'))
            .unwrap_or([0; 8])
    }

    /// Draw `text` ending at `right` with its bottom edge on `bottom`
    fn draw_right_aligned(&self, bitmap: &mut RgbImage, text: &str, right: i64, bottom: i64) {
        let glyph_px = (metrics::GLYPH_CELLS * self.cell) as i64;
        let text_width = glyph_px * text.chars().count() as i64;
        let left = right - text_width;
        let top = bottom - glyph_px;

        if self.style == StampStyle::Plain {
            let pad = self.cell as i64;
            darken_rect(bitmap, left - pad, top - pad, right + pad, bottom + pad);
        }

        for (index, c) in text.chars().enumerate() {
            let glyph = Self::glyph(c);
            let origin_x = left + index as i64 * glyph_px;
            if self.style == StampStyle::Shadowed {
                let step = self.cell as i64;
                for (dx, dy) in [(-step, 0), (step, 0), (0, -step), (0, step)] {
                    self.draw_glyph(bitmap, &glyph, origin_x + dx, top + dy, Rgb([0, 0, 0]));
                }
            }
            self.draw_glyph(bitmap, &glyph, origin_x, top, self.color);
        }
    }

    fn draw_glyph(&self, bitmap: &mut RgbImage, glyph: &[u8; 8], x: i64, y: i64, color: Rgb<u8>) {
        let cell = self.cell as i64;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..8 {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = x + col as i64 * cell;
                let py = y + row as i64 * cell;
                fill_rect(bitmap, px, py, px + cell, py + cell, color);
            }
        }
    }
}

/// Clip a rectangle to the image
fn clip(bitmap: &RgbImage, x0: i64, y0: i64, x1: i64, y1: i64) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = bitmap.dimensions();
    let x0 = x0.clamp(0, width as i64) as u32;
    let y0 = y0.clamp(0, height as i64) as u32;
    let x1 = x1.clamp(0, width as i64) as u32;
    let y1 = y1.clamp(0, height as i64) as u32;
    (x0 < x1 && y0 < y1).then_some((x0, y0, x1, y1))
}

fn fill_rect(bitmap: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    if let Some((x0, y0, x1, y1)) = clip(bitmap, x0, y0, x1, y1) {
        for y in y0..y1 {
            for x in x0..x1 {
                bitmap.put_pixel(x, y, color);
            }
        }
    }
}

fn darken_rect(bitmap: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64) {
    let keep = 1.0 - metrics::BACKGROUND_ALPHA;
    if let Some((x0, y0, x1, y1)) = clip(bitmap, x0, y0, x1, y1) {
        for y in y0..y1 {
            for x in x0..x1 {
                let pixel = bitmap.get_pixel_mut(x, y);
                for channel in pixel.0.iter_mut() {
                    *channel = (*channel as f32 * keep).round() as u8;
                }
            }
        }
    }
}
