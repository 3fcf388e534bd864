//! Data shapes of XOR secret shares.
//!
//! A party never holds a secret value itself, only its share. Combining the shares of both
//! parties with XOR reveals the value; because the sharing is bitwise, a share of a serialized
//! row can be decoded field by field exactly like a plaintext row.

use std::ops::BitXor;

use rand::CryptoRng;
use serde::{Deserialize, Serialize};

use crate::transpose::BitMatrix;

/// This party's share of a single secret integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInt<T>(pub T);

impl<T: BitXor<Output = T> + Copy> SecretInt<T> {
    /// Combines both shares into the secret value.
    pub fn reveal(&self, other: &Self) -> T {
        self.0 ^ other.0
    }
}

/// This party's shares of one secret bit per row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBits(pub Vec<bool>);

impl SecretBits {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combines both shares into the secret bits.
    ///
    /// # Panics
    /// If the shares have different lengths.
    pub fn reveal(&self, other: &Self) -> Vec<bool> {
        assert_eq!(self.len(), other.len(), "share lengths differ");
        self.0.iter().zip(&other.0).map(|(a, b)| a ^ b).collect()
    }
}

/// This party's shares of one secret integer per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInts<T>(pub Vec<T>);

impl<T> Default for SecretInts<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: BitXor<Output = T> + Copy> SecretInts<T> {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combines both shares into the secret integers.
    ///
    /// # Panics
    /// If the shares have different lengths.
    pub fn reveal(&self, other: &Self) -> Vec<T> {
        assert_eq!(self.len(), other.len(), "share lengths differ");
        self.0.iter().zip(&other.0).map(|(a, b)| *a ^ *b).collect()
    }
}

/// This party's share of a batch of serialized rows, stored bit-sliced.
///
/// Row `k` of the wrapped [`BitMatrix`] holds bit `k` (least significant bit of byte 0 first)
/// of every row in the batch, so the matrix has `8 * row_width` rows and `batch_size` columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretByteMatrix {
    bits: BitMatrix,
}

impl SecretByteMatrix {
    /// Wraps a bit-sliced share.
    pub fn from_bit_slices(bits: BitMatrix) -> Self {
        Self { bits }
    }

    /// Splits plaintext rows of `row_width` bytes into two bit-sliced shares.
    ///
    /// # Panics
    /// If a row is shorter than `row_width`.
    pub fn share_rows<R: CryptoRng + ?Sized>(
        rows: &[Vec<u8>],
        row_width: usize,
        rng: &mut R,
    ) -> (Self, Self) {
        let plaintext = BitMatrix::from_byte_rows(rows, 8 * row_width).transpose();
        let mask = BitMatrix::random(plaintext.rows(), plaintext.cols(), rng);
        let mut masked = plaintext;
        masked.xor_inplace(&mask);
        (Self::from_bit_slices(mask), Self::from_bit_slices(masked))
    }

    /// Number of rows in the batch.
    pub fn batch_size(&self) -> usize {
        self.bits.cols()
    }

    /// Number of bits per row.
    pub fn row_bits(&self) -> usize {
        self.bits.rows()
    }

    /// The share transposed back into one byte string per row.
    pub fn to_byte_rows(&self) -> Vec<Vec<u8>> {
        let rows = self.bits.transpose();
        (0..rows.rows()).map(|r| rows.row(r).to_vec()).collect()
    }
}
