//! Run-length codec for binary raster masks (fog-of-war, annotation layers).
//!
//! Wire format:
//! ```text
//! ┌────────────┬──────────────┬──────────────┬─────┐
//! │ start bit  │ run₀ varint  │ run₁ varint  │ ... │
//! │ 1 byte 0/1 │ base-128 LEB │ base-128 LEB │     │
//! └────────────┴──────────────┴──────────────┴─────┘
//! ```
//!
//! Runs alternate value starting from the start bit, so only lengths are
//! stored. A stream that ends before `expected_len` leaves the remainder at
//! the background value (off). Empty input encodes to empty output.
//!
//! Stored masks are the encoded bytes wrapped in standard base64 text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Byte written for an "on" cell when decoding.
pub const ON: u8 = 1;
/// Byte written for an "off" cell when decoding (background).
pub const OFF: u8 = 0;

/// Default mask edge length used by fog-of-war and annotation layers.
pub const DEFAULT_MASK_SIZE: u32 = 1024;

/// Longest LEB128 encoding of a u64.
const MAX_VARINT_BYTES: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskError {
    #[error("invalid start value {0}, expected 0 or 1")]
    InvalidStartValue(u8),
    #[error("varint truncated at byte {0}")]
    TruncatedVarint(usize),
    #[error("varint at byte {0} exceeds 64 bits")]
    VarintOverflow(usize),
    #[error("run of {run} at position {position} overruns mask length {expected}")]
    RunOverrun {
        position: usize,
        run: u64,
        expected: usize,
    },
    #[error("mask dimensions {width}x{height} do not match {len} cells")]
    DimensionMismatch { width: u32, height: u32, len: usize },
    #[error("stored mask is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ───────────────────────────────────────────────────────────────────
// Codec
// ───────────────────────────────────────────────────────────────────

/// Encode a bitmap into the run-length format. Any nonzero byte is "on".
pub fn encode(bitmap: &[u8]) -> Vec<u8> {
    let Some(&first) = bitmap.first() else {
        return Vec::new();
    };

    let mut current = first != OFF;
    let mut out = Vec::with_capacity(16);
    out.push(u8::from(current));

    let mut run: u64 = 0;
    for &byte in bitmap {
        let on = byte != OFF;
        if on == current {
            run += 1;
        } else {
            write_varint(&mut out, run);
            current = on;
            run = 1;
        }
    }
    write_varint(&mut out, run);
    out
}

/// Decode a run-length stream into a dense bitmap of `expected_len` bytes.
///
/// Cells not covered by the stream stay [`OFF`].
pub fn decode(encoded: &[u8], expected_len: usize) -> Result<Vec<u8>, MaskError> {
    let mut out = vec![OFF; expected_len];
    let Some(&start) = encoded.first() else {
        return Ok(out);
    };

    let mut on = match start {
        0 => false,
        1 => true,
        other => return Err(MaskError::InvalidStartValue(other)),
    };

    let mut cursor = 1;
    let mut position = 0usize;
    while cursor < encoded.len() {
        let (run, read) = read_varint(encoded, cursor)?;
        cursor += read;

        let end = usize::try_from(run)
            .ok()
            .and_then(|r| position.checked_add(r))
            .filter(|&end| end <= expected_len)
            .ok_or(MaskError::RunOverrun {
                position,
                run,
                expected: expected_len,
            })?;

        if on {
            out[position..end].fill(ON);
        }
        position = end;
        on = !on;
    }

    Ok(out)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read one varint starting at `offset`. Returns (value, bytes consumed).
fn read_varint(bytes: &[u8], offset: usize) -> Result<(u64, usize), MaskError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let Some(&byte) = bytes.get(offset + i) else {
            return Err(MaskError::TruncatedVarint(offset));
        };
        let chunk = u64::from(byte & 0x7F);
        let shift = 7 * i as u32;
        if shift == 63 && chunk > 1 {
            return Err(MaskError::VarintOverflow(offset));
        }
        value |= chunk << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(MaskError::VarintOverflow(offset))
}

// ───────────────────────────────────────────────────────────────────
// Stored (base64) form
// ───────────────────────────────────────────────────────────────────

/// Wrap encoded bytes as text for a database column.
pub fn to_base64(encoded: &[u8]) -> String {
    STANDARD.encode(encoded)
}

/// Unwrap stored text back to encoded bytes.
pub fn from_base64(text: &str) -> Result<Vec<u8>, MaskError> {
    Ok(STANDARD.decode(text.trim())?)
}

// ───────────────────────────────────────────────────────────────────
// Mask value type
// ───────────────────────────────────────────────────────────────────

/// A dense boolean raster, one byte per cell, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    bits: Vec<u8>,
}

impl Mask {
    /// An all-off mask.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![OFF; width as usize * height as usize],
        }
    }

    /// Wrap an existing bitmap. Nonzero bytes are normalized to [`ON`].
    pub fn from_bits(width: u32, height: u32, mut bits: Vec<u8>) -> Result<Self, MaskError> {
        if bits.len() != width as usize * height as usize {
            return Err(MaskError::DimensionMismatch {
                width,
                height,
                len: bits.len(),
            });
        }
        for cell in bits.iter_mut() {
            if *cell != OFF {
                *cell = ON;
            }
        }
        Ok(Self { width, height, bits })
    }

    pub fn decode(width: u32, height: u32, encoded: &[u8]) -> Result<Self, MaskError> {
        let bits = decode(encoded, width as usize * height as usize)?;
        Ok(Self { width, height, bits })
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.bits)
    }

    /// Encode and wrap as base64 text.
    pub fn to_stored(&self) -> String {
        to_base64(&self.encode())
    }

    pub fn from_stored(width: u32, height: u32, text: &str) -> Result<Self, MaskError> {
        Self::decode(width, height, &from_base64(text)?)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn into_bits(self) -> Vec<u8> {
        self.bits
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.index(x, y).is_some_and(|i| self.bits[i] != OFF)
    }

    /// Set a single cell. Out-of-bounds coordinates are ignored.
    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        if let Some(i) = self.index(x, y) {
            self.bits[i] = if on { ON } else { OFF };
        }
    }

    /// Merge another mask of the same size: a cell is on if either is on.
    ///
    /// Used when two editors painted or revealed regions concurrently.
    pub fn union(&mut self, other: &Mask) -> Result<(), MaskError> {
        if other.width != self.width || other.height != self.height {
            return Err(MaskError::DimensionMismatch {
                width: self.width,
                height: self.height,
                len: other.bits.len(),
            });
        }
        for (cell, &theirs) in self.bits.iter_mut().zip(&other.bits) {
            if theirs != OFF {
                *cell = ON;
            }
        }
        Ok(())
    }

    /// Fraction of cells that are on, in [0, 1].
    pub fn coverage(&self) -> f64 {
        if self.bits.is_empty() {
            return 0.0;
        }
        let on = self.bits.iter().filter(|&&b| b != OFF).count();
        on as f64 / self.bits.len() as f64
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| y as usize * self.width as usize + x as usize)
    }
}
