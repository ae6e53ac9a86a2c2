//! Difference-hash fingerprints for recognising the same picture across
//! renames, recompression and small crops.

use image::imageops::{self, FilterType};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Grid width compared per row. The image is sampled one column wider.
pub const GRID_WIDTH: u32 = 8;
pub const GRID_HEIGHT: u32 = 8;

/// Length of a rendered fingerprint in hex nibbles.
pub const HASH_HEX_LEN: usize = (GRID_WIDTH * GRID_HEIGHT / 4) as usize;

/// Hamming distance (out of 64 bits) at or below which two fingerprints are
/// treated as the same picture. Tuned policy value; callers may override it
/// through `scanner.similarity_threshold`.
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 10;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("fingerprint length mismatch: {left} vs {right} nibbles")]
    InputMismatch { left: usize, right: usize },

    #[error("invalid hex digit {0:?} in fingerprint")]
    InvalidDigit(char),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A 64-bit perceptual fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(u64);

impl PerceptualHash {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn is_similar(&self, other: &PerceptualHash, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PerceptualHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN {
            return Err(HashError::InputMismatch {
                left: s.len(),
                right: HASH_HEX_LEN,
            });
        }
        let mut bits = 0u64;
        for c in s.chars() {
            let nibble = c.to_digit(16).ok_or(HashError::InvalidDigit(c))?;
            bits = (bits << 4) | nibble as u64;
        }
        Ok(Self(bits))
    }
}

/// Compute the fingerprint of an encoded image (JPEG, PNG, WebP, ...).
pub fn compute_fingerprint(bytes: &[u8]) -> Result<PerceptualHash, HashError> {
    let img = image::load_from_memory(bytes)?;
    Ok(fingerprint_image(&img))
}

/// Read and fingerprint an image file.
pub fn compute_fingerprint_file(path: &Path) -> Result<PerceptualHash, HashError> {
    let bytes = std::fs::read(path).map_err(|source| HashError::Io {
        path: path.display().to_string(),
        source,
    })?;
    compute_fingerprint(&bytes)
}

/// Fingerprint an already decoded image.
///
/// The picture is stretched to a 9x8 grid, reduced to luminance, and each
/// pixel is compared to its right neighbour. Bits are emitted row-major with
/// the first comparison in the most significant position.
pub fn fingerprint_image(img: &image::DynamicImage) -> PerceptualHash {
    // Alpha is ignored.
    let rgb = img.to_rgb8();
    let small = imageops::resize(&rgb, GRID_WIDTH + 1, GRID_HEIGHT, FilterType::Triangle);

    let mut bits = 0u64;
    for y in 0..GRID_HEIGHT {
        for x in 0..GRID_WIDTH {
            let left = luminance(small.get_pixel(x, y).0);
            let right = luminance(small.get_pixel(x + 1, y).0);
            bits = (bits << 1) | u64::from(left > right);
        }
    }

    PerceptualHash(bits)
}

fn luminance([r, g, b]: [u8; 3]) -> f64 {
    0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64
}

/// Bitwise distance between two hex fingerprints of equal length.
pub fn hamming_distance(hash_a: &str, hash_b: &str) -> Result<u32, HashError> {
    if hash_a.len() != hash_b.len() {
        return Err(HashError::InputMismatch {
            left: hash_a.len(),
            right: hash_b.len(),
        });
    }

    let mut distance = 0;
    for (a, b) in hash_a.chars().zip(hash_b.chars()) {
        let a = a.to_digit(16).ok_or(HashError::InvalidDigit(a))?;
        let b = b.to_digit(16).ok_or(HashError::InvalidDigit(b))?;
        distance += (a ^ b).count_ones();
    }

    Ok(distance)
}

pub fn are_similar(hash_a: &str, hash_b: &str, threshold: u32) -> Result<bool, HashError> {
    Ok(hamming_distance(hash_a, hash_b)? <= threshold)
}
