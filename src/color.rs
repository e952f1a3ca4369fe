//! Dominant color extraction.
//!
//! Opaque pixels are binned by hue into 36 ten-degree bins, skipping washed
//! out and dark pixels. The result is the average hue, saturation and value of
//! the fullest bin, or white when no pixel qualifies.

use std::fmt;

use image::DynamicImage;

const HUE_BINS: usize = 36;
const MIN_ALPHA: u8 = 128;
const MIN_SATURATION: f32 = 0.35;
const MIN_VALUE: f32 = 0.35;

/// A packed `0xRRGGBB` color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(u32);

impl Color {
    pub const WHITE: Color = Color(0x00FF_FFFF);

    pub const fn from_rgb(red: u8, green: u8, blue: u8) -> Self {
        Self(((red as u32) << 16) | ((green as u32) << 8) | blue as u32)
    }

    pub const fn rgb(self) -> u32 {
        self.0
    }

    pub const fn red(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn green(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn blue(self) -> u8 {
        self.0 as u8
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::WHITE
    }
}

impl From<Color> for u32 {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HueBin {
    count: u32,
    hue: f32,
    saturation: f32,
    value: f32,
}

/// Compute the dominant color of a bitmap.
pub fn dominant_color(image: &DynamicImage) -> Color {
    let rgba = image.to_rgba8();
    let mut bins = [HueBin::default(); HUE_BINS];
    let mut fullest: Option<usize> = None;

    for pixel in rgba.pixels() {
        let [red, green, blue, alpha] = pixel.0;
        if alpha < MIN_ALPHA {
            continue;
        }
        let (hue, saturation, value) = rgb_to_hsv(red, green, blue);
        if saturation <= MIN_SATURATION || value <= MIN_VALUE {
            continue;
        }

        let index = ((hue / 10.0) as usize).min(HUE_BINS - 1);
        let bin = &mut bins[index];
        bin.count += 1;
        bin.hue += hue;
        bin.saturation += saturation;
        bin.value += value;
        let count = bin.count;

        if fullest.is_none_or(|best| count > bins[best].count) {
            fullest = Some(index);
        }
    }

    let Some(index) = fullest else {
        return Color::WHITE;
    };
    let bin = bins[index];
    let count = bin.count as f32;
    hsv_to_rgb(bin.hue / count, bin.saturation / count, bin.value / count)
}

fn rgb_to_hsv(red: u8, green: u8, blue: u8) -> (f32, f32, f32) {
    let r = f32::from(red) / 255.0;
    let g = f32::from(green) / 255.0;
    let b = f32::from(blue) / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    (hue, saturation, max)
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Color {
    let chroma = value * saturation;
    let sector = (hue / 60.0).rem_euclid(6.0);
    let x = chroma * (1.0 - ((sector % 2.0) - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let offset = value - chroma;
    let channel = |c: f32| ((c + offset) * 255.0).round().clamp(0.0, 255.0) as u8;
    Color::from_rgb(channel(r), channel(g), channel(b))
}
