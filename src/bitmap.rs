//! Decoded image data ready for display.

use std::fmt;

/// Which pipeline produced a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitmapSource {
    /// Standard formats decoded in-process
    Standard,
    /// Embedded preview extracted from a RAW file
    RawPreview,
    /// Full RAW development by a decoder worker
    RawFull,
}

/// An RGBA8 bitmap. This is what the cache stores and the UI paints.
pub struct Bitmap {
    /// RGBA pixel data, row major
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source: BitmapSource,
}

impl Bitmap {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, source: BitmapSource) -> Self {
        Self {
            pixels,
            width,
            height,
            source,
        }
    }

    /// Build from a decoder worker payload with the given channel count.
    /// Returns `None` if the buffer does not match the dimensions.
    pub fn from_channels(
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: usize,
        source: BitmapSource,
    ) -> Option<Self> {
        let expected = (width as usize) * (height as usize) * channels;
        if data.len() != expected {
            return None;
        }
        let pixels = match channels {
            4 => data,
            3 => data
                .chunks_exact(3)
                .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], 255])
                .collect(),
            1 => data.iter().flat_map(|&g| [g, g, g, 255]).collect(),
            _ => return None,
        };
        Some(Self::new(pixels, width, height, source))
    }

    /// Memory size in bytes
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.pixels.len()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("source", &self.source)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
