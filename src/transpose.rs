//! Bit matrices and their transposition.
//!
//! Secret-shared rows arrive bit-sliced (one bit-row per bit position of the row layout) and
//! have to be turned back into row-major bytes before they can be decoded. Both dimensions of
//! a [`BitMatrix`] are padded to multiples of 16 internally so that the transposition can
//! work on 16x8 blocks.

use rand::CryptoRng;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use wide::{i8x16, i64x2};

const BLOCK: usize = 16;

fn padded(n: usize) -> usize {
    n.div_ceil(BLOCK).max(1) * BLOCK
}

/// Bytes needed to store a `rows x cols` matrix, `None` if that does not fit into memory.
fn storage_len(rows: usize, cols: usize) -> Option<usize> {
    let rows = rows.div_ceil(BLOCK).max(1).checked_mul(BLOCK)?;
    let cols = cols.div_ceil(BLOCK).max(1).checked_mul(BLOCK)?;
    Some(rows.checked_mul(cols)? / 8)
}

/// Errors raised when a received matrix does not have a valid storage layout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The dimensions cannot be stored.
    #[error("a {rows}x{cols} bit matrix is too large")]
    TooLarge {
        /// Number of rows.
        rows: usize,
        /// Number of columns.
        cols: usize,
    },
    /// The storage does not have the size implied by the dimensions.
    #[error("a {rows}x{cols} bit matrix needs {expected} bytes of storage, but has {actual}")]
    StorageLength {
        /// Number of rows.
        rows: usize,
        /// Number of columns.
        cols: usize,
        /// Storage size implied by the dimensions.
        expected: usize,
        /// Size of the received storage.
        actual: usize,
    },
    /// Bits outside of the matrix are set.
    #[error("bits outside of a {rows}x{cols} bit matrix are set")]
    PaddingBitsSet {
        /// Number of rows.
        rows: usize,
        /// Number of columns.
        cols: usize,
    },
}

/// A dense matrix of bits, stored row by row with the least significant bit first.
///
/// Deserialization checks the storage layout, so a matrix received from another party can be
/// transposed without further checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BitMatrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl BitMatrix {
    /// A matrix of the given dimensions with all bits unset.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; padded(rows) * padded(cols) / 8],
        }
    }

    /// Builds a matrix with one row per byte string, `cols` bits wide.
    ///
    /// # Panics
    /// If a row is shorter than `cols` bits.
    pub fn from_byte_rows<R: AsRef<[u8]>>(rows: &[R], cols: usize) -> Self {
        let mut matrix = Self::zeros(rows.len(), cols);
        let used = cols.div_ceil(8);
        for (r, row) in rows.iter().enumerate() {
            matrix.row_mut(r).copy_from_slice(&row.as_ref()[..used]);
        }
        matrix.clear_padding();
        matrix
    }

    /// A matrix of uniformly random bits.
    pub fn random<R: CryptoRng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Self {
        let mut matrix = Self::zeros(rows, cols);
        for r in 0..rows {
            rng.fill_bytes(matrix.row_mut(r));
        }
        matrix.clear_padding();
        matrix
    }

    /// Builds a matrix from its padded storage.
    pub fn from_raw_parts(rows: usize, cols: usize, data: Vec<u8>) -> Result<Self, Error> {
        let expected = storage_len(rows, cols).ok_or(Error::TooLarge { rows, cols })?;
        if data.len() != expected {
            return Err(Error::StorageLength {
                rows,
                cols,
                expected,
                actual: data.len(),
            });
        }
        let matrix = Self { rows, cols, data };
        let mut cleared = Self::zeros(rows, cols);
        for r in 0..rows {
            cleared.row_mut(r).copy_from_slice(matrix.row(r));
        }
        cleared.clear_padding();
        if cleared != matrix {
            return Err(Error::PaddingBitsSet { rows, cols });
        }
        Ok(matrix)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (in bits).
    pub fn cols(&self) -> usize {
        self.cols
    }

    fn stride(&self) -> usize {
        padded(self.cols) / 8
    }

    /// The bytes of row `r`, `ceil(cols / 8)` long.
    pub fn row(&self, r: usize) -> &[u8] {
        assert!(r < self.rows, "row {r} out of bounds");
        let start = r * self.stride();
        &self.data[start..start + self.cols.div_ceil(8)]
    }

    fn row_mut(&mut self, r: usize) -> &mut [u8] {
        let start = r * self.stride();
        let used = self.cols.div_ceil(8);
        &mut self.data[start..start + used]
    }

    /// The bit at row `r` and column `c`.
    pub fn get(&self, r: usize, c: usize) -> bool {
        assert!(c < self.cols, "column {c} out of bounds");
        (self.row(r)[c / 8] >> (c % 8)) & 1 == 1
    }

    /// Sets the bit at row `r` and column `c`.
    pub fn set(&mut self, r: usize, c: usize, bit: bool) {
        assert!(r < self.rows && c < self.cols, "({r}, {c}) out of bounds");
        let byte = &mut self.row_mut(r)[c / 8];
        let mask = 1 << (c % 8);
        if bit {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    /// XORs `other` into `self`.
    ///
    /// # Panics
    /// If the dimensions differ.
    pub fn xor_inplace(&mut self, other: &BitMatrix) {
        assert_eq!(
            (self.rows, self.cols),
            (other.rows, other.cols),
            "dimensions must match"
        );
        self.data
            .iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a ^= *b);
    }

    fn clear_padding(&mut self) {
        if self.cols % 8 == 0 {
            return;
        }
        let mask = (1u8 << (self.cols % 8)) - 1;
        let last = self.cols / 8;
        for r in 0..self.rows {
            self.row_mut(r)[last] &= mask;
        }
    }

    /// The transposed matrix.
    pub fn transpose(&self) -> BitMatrix {
        let (rows, cols) = (padded(self.rows), padded(self.cols));
        let mut data = vec![0; self.data.len()];
        transpose_blocks(&self.data, &mut data, rows, cols);
        BitMatrix {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }
}

impl<'de> Deserialize<'de> for BitMatrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename = "BitMatrix")]
        struct Raw {
            rows: usize,
            cols: usize,
            data: Vec<u8>,
        }
        let Raw { rows, cols, data } = Raw::deserialize(deserializer)?;
        BitMatrix::from_raw_parts(rows, cols, data).map_err(serde::de::Error::custom)
    }
}

/// Transposes a `rows x cols` bit matrix whose dimensions are multiples of 16.
///
/// Works on 16x8 blocks: the most significant bit of each of the 16 bytes (one per input row)
/// is collected with a single `move_mask`, which yields two output bytes of the output row for
/// that column. Shifting every byte left by one moves the next column into the most
/// significant position.
fn transpose_blocks(input: &[u8], output: &mut [u8], rows: usize, cols: usize) {
    debug_assert!(rows % BLOCK == 0 && cols % BLOCK == 0);
    let in_stride = cols / 8;
    let out_stride = rows / 8;
    for row in (0..rows).step_by(BLOCK) {
        for col in (0..cols).step_by(8) {
            let mut block = i8x16::from(std::array::from_fn::<i8, 16, _>(|i| {
                input[(row + i) * in_stride + col / 8] as i8
            }));
            for bit in (0..8).rev() {
                let msbs = block.move_mask().to_le_bytes();
                let start = (col + bit) * out_stride + row / 8;
                output[start..start + 2].copy_from_slice(&msbs[..2]);
                // Bits crossing into the neighbouring byte are never read again.
                let lanes: &mut i64x2 = bytemuck::must_cast_mut(&mut block);
                *lanes = *lanes << 1;
            }
        }
    }
}
