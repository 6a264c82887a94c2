//! Image decoding primitives.
//!
//! Standard formats decode in-process (zune-jpeg fast path, `image` for the
//! rest). RAW files are either served from their embedded preview JPEG, or
//! fully developed by a decoder worker (see [`crate::raw_pool`]).

use crate::bitmap::{Bitmap, BitmapSource};
use crate::error::DecodeError;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Bytes read from the start of a RAW file when sniffing the camera model.
const HEADER_PROBE_BYTES: u64 = 256 * 1024;

/// Embedded JPEG candidates tried, largest first, before giving up.
const PREVIEW_CANDIDATES: usize = 3;

/// TIFF `Model` tag.
const TIFF_TAG_MODEL: u16 = 0x0110;

/// Decoder for images - handles format detection and the in-process paths.
pub struct Decoder {
    /// Standard extensions (lowercase, no dot)
    standard_extensions: Vec<&'static str>,
    /// RAW extensions (lowercase, no dot)
    raw_extensions: Vec<&'static str>,
}

impl Decoder {
    pub fn new(raw_extensions: Vec<&'static str>) -> Self {
        Self {
            standard_extensions: vec!["jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff"],
            raw_extensions,
        }
    }

    /// Check if a file is supported
    pub fn is_supported(&self, path: &Path) -> bool {
        self.is_standard(path) || self.is_raw(path)
    }

    pub fn is_raw(&self, path: &Path) -> bool {
        has_extension(path, &self.raw_extensions)
    }

    fn is_standard(&self, path: &Path) -> bool {
        has_extension(path, &self.standard_extensions)
    }

    /// Get supported extensions
    pub fn extensions(&self) -> Vec<&'static str> {
        self.standard_extensions
            .iter()
            .chain(self.raw_extensions.iter())
            .copied()
            .collect()
    }

    /// Decode a standard (non-RAW) image.
    pub fn decode_standard(&self, path: &Path) -> Result<Bitmap, DecodeError> {
        if !self.is_standard(path) {
            return Err(DecodeError::Unsupported(path.to_path_buf()));
        }
        let data = read_file(path)?;

        let (rgba, width, height) = if Self::is_jpeg(path) {
            Self::decode_jpeg(&data)?
        } else {
            Self::decode_generic(&data)?
        };

        Ok(Bitmap::new(rgba, width, height, BitmapSource::Standard))
    }

    /// Extract and decode the largest embedded preview of a RAW file.
    pub fn extract_preview(&self, path: &Path) -> Result<Bitmap, DecodeError> {
        let data = read_file(path)?;

        let mut candidates = embedded_jpegs(&data);
        candidates.sort_by(|a, b| (b.end - b.start).cmp(&(a.end - a.start)));

        for range in candidates.into_iter().take(PREVIEW_CANDIDATES) {
            if let Ok((rgba, width, height)) = Self::decode_jpeg(&data[range]) {
                return Ok(Bitmap::new(rgba, width, height, BitmapSource::RawPreview));
            }
        }

        Err(DecodeError::NoEmbeddedPreview(path.to_path_buf()))
    }

    /// Check if file is JPEG by extension
    fn is_jpeg(path: &Path) -> bool {
        has_extension(path, &["jpg", "jpeg"])
    }

    /// Decode JPEG using zune-jpeg (fast)
    fn decode_jpeg(data: &[u8]) -> Result<(Vec<u8>, u32, u32), DecodeError> {
        let mut decoder = zune_jpeg::JpegDecoder::new(data);
        if let Ok(pixels) = decoder.decode() {
            if let Some(info) = decoder.info() {
                let rgba = Self::to_rgba(pixels, info.components);
                let (width, height) = (info.width as u32, info.height as u32);
                if rgba.len() == (width as usize) * (height as usize) * 4 {
                    return Ok((rgba, width, height));
                }
            }
        }

        // Fallback to image crate
        Self::decode_generic(data)
    }

    /// Decode using image crate (generic fallback)
    fn decode_generic(data: &[u8]) -> Result<(Vec<u8>, u32, u32), DecodeError> {
        let img = image::load_from_memory(data)?;
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok((rgba.into_raw(), width, height))
    }

    /// Convert raw pixels to RGBA
    fn to_rgba(pixels: Vec<u8>, components: u8) -> Vec<u8> {
        match components {
            4 => pixels,
            3 => pixels
                .chunks_exact(3)
                .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], 255])
                .collect(),
            1 => pixels.iter().flat_map(|&g| [g, g, g, 255]).collect(),
            _ => pixels,
        }
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            extensions.iter().any(|&e| e == ext_lower)
        })
        .unwrap_or(false)
}

fn read_file(path: &Path) -> Result<Vec<u8>, DecodeError> {
    fs::read(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Byte ranges of JPEG streams (SOI .. first EOI) embedded in a buffer.
fn embedded_jpegs(buffer: &[u8]) -> Vec<std::ops::Range<usize>> {
    const SOI: &[u8] = b"\xff\xd8\xff";
    const EOI: &[u8] = b"\xff\xd9";

    let mut found = Vec::new();
    let mut pos = 0;
    while pos + SOI.len() <= buffer.len() {
        let next = match buffer[pos..].iter().position(|&b| b == 0xff) {
            Some(offset) => pos + offset,
            None => break,
        };
        if !buffer[next..].starts_with(SOI) {
            pos = next + 1;
            continue;
        }
        match buffer[next..].windows(2).position(|w| w == EOI) {
            Some(end) => {
                let end = next + end + EOI.len();
                found.push(next..end);
                pos = end;
            }
            None => break,
        }
    }
    found
}

/// Camera model of a RAW file, read from its header without decoding.
///
/// Handles TIFF-based containers (NEF, CR2, ARW, DNG, ORF, RW2, PEF, ...)
/// and Fuji RAF. Returns `None` when the header carries no model.
pub fn camera_model(path: &Path) -> Option<String> {
    let mut buf = Vec::new();
    File::open(path)
        .ok()?
        .take(HEADER_PROBE_BYTES)
        .read_to_end(&mut buf)
        .ok()?;

    if buf.starts_with(b"FUJIFILMCCD-RAW") {
        return clean_ascii(buf.get(0x1c..0x3c)?);
    }
    tiff_model(&buf)
}

fn tiff_model(buf: &[u8]) -> Option<String> {
    let little_endian = match buf.get(0..2)? {
        b"II" => true,
        b"MM" => false,
        _ => return None,
    };

    let ifd = read_u32(buf, 4, little_endian)? as usize;
    let count = read_u16(buf, ifd, little_endian)? as usize;
    for i in 0..count {
        let entry = ifd + 2 + i * 12;
        if read_u16(buf, entry, little_endian)? != TIFF_TAG_MODEL {
            continue;
        }
        let len = read_u32(buf, entry + 4, little_endian)? as usize;
        let offset = if len <= 4 {
            entry + 8
        } else {
            read_u32(buf, entry + 8, little_endian)? as usize
        };
        return clean_ascii(buf.get(offset..offset.checked_add(len)?)?);
    }
    None
}

fn read_u16(buf: &[u8], at: usize, little_endian: bool) -> Option<u16> {
    let bytes: [u8; 2] = buf.get(at..at + 2)?.try_into().ok()?;
    Some(if little_endian {
        u16::from_le_bytes(bytes)
    } else {
        u16::from_be_bytes(bytes)
    })
}

fn read_u32(buf: &[u8], at: usize, little_endian: bool) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(if little_endian {
        u32::from_le_bytes(bytes)
    } else {
        u32::from_be_bytes(bytes)
    })
}

fn clean_ascii(bytes: &[u8]) -> Option<String> {
    let text: String = bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Scan a directory for supported images
pub fn scan_directory(dir: &Path, decoder: &Decoder) -> Vec<PathBuf> {
    let mut images: Vec<_> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| decoder.is_supported(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();

    images.sort();
    images
}
