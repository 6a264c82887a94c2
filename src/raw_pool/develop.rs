//! Full RAW development, run inside decoder workers.
//!
//! The sensor data is normalised against the camera's black and white
//! levels, white balanced with the as-shot coefficients, demosaiced per 2x2
//! CFA block and gamma encoded to 8-bit RGBA. Colour accuracy is out of
//! scope; the aim is a full-resolution bitmap that looks right.

use super::protocol::DecodedPixels;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

const OUTPUT_CHANNELS: usize = 4;
const GAMMA: f32 = 1.0 / 2.2;

/// Turns a RAW file into pixels. One instance lives in each worker.
pub trait RawDeveloper: Send {
    fn develop(&mut self, path: &Path) -> Result<DecodedPixels, String>;
}

/// [`RawDeveloper`] backed by `rawloader`.
pub struct RawloaderDeveloper {
    loader: rawloader::RawLoader,
}

impl RawloaderDeveloper {
    /// Load the camera tables. A failure here is fatal for the worker.
    pub fn initialize() -> Result<Self, String> {
        panic::catch_unwind(rawloader::RawLoader::new)
            .map(|loader| Self { loader })
            .map_err(|_| "rawloader failed to load its camera definitions".to_string())
    }
}

impl RawDeveloper for RawloaderDeveloper {
    fn develop(&mut self, path: &Path) -> Result<DecodedPixels, String> {
        let raw = self
            .loader
            .decode_file(path)
            .map_err(|e| format!("Failed to decode RAW: {:?}", e))?;

        let samples: Vec<u16> = match raw.data {
            rawloader::RawImageData::Integer(values) => values,
            rawloader::RawImageData::Float(values) => values
                .iter()
                .map(|&v| (v * 65535.0).clamp(0.0, 65535.0) as u16)
                .collect(),
        };

        let levels = Levels {
            black: raw.blacklevels,
            white: raw.whitelevels,
            wb: normalized_wb(raw.wb_coeffs),
        };

        let data = match raw.cpp {
            1 => {
                let cfa = &raw.cfa;
                develop_bayer(&samples, raw.width, raw.height, &levels, |row, col| {
                    cfa.color_at(row, col)
                })
            }
            3 => develop_rgb(&samples, raw.width, raw.height, &levels),
            cpp => return Err(format!("unsupported samples per pixel: {cpp}")),
        }?;

        Ok(DecodedPixels {
            width: raw.width as u32,
            height: raw.height as u32,
            channels: OUTPUT_CHANNELS,
            data,
        })
    }
}

struct Levels {
    black: [u16; 4],
    white: [u16; 4],
    wb: [f32; 3],
}

impl Levels {
    /// Sample of CFA colour `color` scaled to 0.0 - 1.0 and white balanced.
    fn scale(&self, value: u16, color: usize) -> f32 {
        let black = self.black[color.min(3)] as f32;
        let white = (self.white[color.min(3)] as f32).max(black + 1.0);
        let normalized = ((value as f32 - black) / (white - black)).clamp(0.0, 1.0);
        (normalized * self.wb[rgb_channel(color)]).min(1.0)
    }
}

/// White balance as `[r, g, b]` relative to green. Missing or invalid
/// coefficients become neutral.
fn normalized_wb(coeffs: [f32; 4]) -> [f32; 3] {
    let valid = |v: f32| v.is_finite() && v > 0.0;
    if !(valid(coeffs[0]) && valid(coeffs[1]) && valid(coeffs[2])) {
        return [1.0, 1.0, 1.0];
    }
    [coeffs[0] / coeffs[1], 1.0, coeffs[2] / coeffs[1]]
}

/// CFA colour index (R, G, B, second G/emerald) to RGB channel.
fn rgb_channel(color: usize) -> usize {
    match color {
        0 => 0,
        2 => 2,
        _ => 1,
    }
}

fn encode(value: f32) -> u8 {
    (value.powf(GAMMA) * 255.0).round().clamp(0.0, 255.0) as u8
}

fn develop_bayer<F>(
    samples: &[u16],
    width: usize,
    height: usize,
    levels: &Levels,
    color_at: F,
) -> Result<Vec<u8>, String>
where
    F: Fn(usize, usize) -> usize,
{
    if samples.len() < width * height {
        return Err(format!(
            "sensor data too short: {} samples for {width}x{height}",
            samples.len()
        ));
    }

    let mut out = vec![0u8; width * height * OUTPUT_CHANNELS];
    for by in (0..height).step_by(2) {
        for bx in (0..width).step_by(2) {
            let rows = by..(by + 2).min(height);
            let cols = bx..(bx + 2).min(width);

            let mut sum = [0f32; 3];
            let mut count = [0u32; 3];
            for y in rows.clone() {
                for x in cols.clone() {
                    let color = color_at(y, x);
                    let channel = rgb_channel(color);
                    sum[channel] += levels.scale(samples[y * width + x], color);
                    count[channel] += 1;
                }
            }
            let block: [f32; 3] =
                std::array::from_fn(|c| if count[c] > 0 { sum[c] / count[c] as f32 } else { 0.0 });

            for y in rows.clone() {
                for x in cols.clone() {
                    let color = color_at(y, x);
                    let mut rgb = block;
                    rgb[rgb_channel(color)] = levels.scale(samples[y * width + x], color);

                    let at = (y * width + x) * OUTPUT_CHANNELS;
                    out[at] = encode(rgb[0]);
                    out[at + 1] = encode(rgb[1]);
                    out[at + 2] = encode(rgb[2]);
                    out[at + 3] = 255;
                }
            }
        }
    }
    Ok(out)
}

fn develop_rgb(
    samples: &[u16],
    width: usize,
    height: usize,
    levels: &Levels,
) -> Result<Vec<u8>, String> {
    if samples.len() < width * height * 3 {
        return Err(format!(
            "sensor data too short: {} samples for {width}x{height}x3",
            samples.len()
        ));
    }

    let mut out = Vec::with_capacity(width * height * OUTPUT_CHANNELS);
    for rgb in samples.chunks_exact(3).take(width * height) {
        out.push(encode(levels.scale(rgb[0], 0)));
        out.push(encode(levels.scale(rgb[1], 1)));
        out.push(encode(levels.scale(rgb[2], 2)));
        out.push(255);
    }
    Ok(out)
}

/// Keeps a panicking developer from taking the worker loop down with it.
pub(crate) fn develop_guarded(
    developer: &mut dyn RawDeveloper,
    path: &Path,
) -> Result<DecodedPixels, String> {
    panic::catch_unwind(AssertUnwindSafe(|| developer.develop(path)))
        .unwrap_or_else(|_| Err(format!("decoder panicked on {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels() -> Levels {
        Levels {
            black: [0; 4],
            white: [1000; 4],
            wb: [1.0, 1.0, 1.0],
        }
    }

    /// RGGB
    fn rggb(row: usize, col: usize) -> usize {
        match (row % 2, col % 2) {
            (0, 0) => 0,
            (1, 1) => 2,
            _ => 1,
        }
    }

    #[test]
    fn test_white_balance_normalisation() {
        assert_eq!(normalized_wb([2.0, 1.0, 1.5, f32::NAN]), [2.0, 1.0, 1.5]);
        assert_eq!(normalized_wb([4.0, 2.0, 3.0, 2.0]), [2.0, 1.0, 1.5]);
        assert_eq!(normalized_wb([f32::NAN, 1.0, 1.0, 1.0]), [1.0, 1.0, 1.0]);
        assert_eq!(normalized_wb([0.0, 0.0, 0.0, 0.0]), [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_bayer_block_produces_full_resolution_rgba() {
        // Pure red scene: only R photosites are lit
        let samples = vec![1000, 0, 0, 0];
        let out = develop_bayer(&samples, 2, 2, &levels(), rggb).unwrap();

        assert_eq!(out.len(), 2 * 2 * 4);
        for px in out.chunks_exact(4) {
            assert_eq!(px, &[255, 0, 0, 255]);
        }
    }

    #[test]
    fn test_bayer_black_level_and_odd_dimensions() {
        let levels = Levels {
            black: [100; 4],
            white: [1100; 4],
            wb: [1.0, 1.0, 1.0],
        };
        // 3x3 sensor at black level except the last (red) photosite
        let mut samples = vec![100u16; 9];
        samples[8] = 1100;
        let out = develop_bayer(&samples, 3, 3, &levels, rggb).unwrap();

        assert_eq!(out.len(), 9 * 4);
        assert_eq!(&out[0..4], &[0, 0, 0, 255]);
        assert_eq!(&out[8 * 4..], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_short_sensor_data_is_an_error() {
        assert!(develop_bayer(&[0; 3], 2, 2, &levels(), rggb).is_err());
        assert!(develop_rgb(&[0; 5], 1, 2, &levels()).is_err());
    }

    #[test]
    fn test_rgb_samples() {
        let out = develop_rgb(&[1000, 0, 1000], 1, 1, &levels()).unwrap();
        assert_eq!(out, vec![255, 0, 255, 255]);
    }

    struct Exploding;

    impl RawDeveloper for Exploding {
        fn develop(&mut self, _path: &Path) -> Result<DecodedPixels, String> {
            panic!("bad huffman table")
        }
    }

    #[test]
    fn test_guard_converts_panic() {
        let err = develop_guarded(&mut Exploding, Path::new("x.nef")).unwrap_err();
        assert!(err.contains("panicked"));
    }
}
