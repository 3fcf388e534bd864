//! Hides the order of the local rows behind a secure random permutation.

use rand::{CryptoRng, seq::SliceRandom};
use tracing::info;

use crate::{config::Error, processor};

/// Marks a union slot that has no real row behind it.
pub const DUMMY: i32 = -1;

/// Draws a uniformly random permutation of `0..n`.
pub fn secure_random_permutation<R: CryptoRng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    let mut permutation: Vec<usize> = (0..n).collect();
    permutation.shuffle(rng);
    permutation
}

/// Checks that every union index fits into a union map entry.
fn union_size(len: usize) -> Result<i32, processor::Error> {
    i32::try_from(len).map_err(|_| processor::Error::TooManyRows(len))
}

/// Builds the union map of the local rows.
///
/// Entry `i` of the result is [`DUMMY`] if row `i` is a dummy row and otherwise the position of
/// row `i` among the non-dummy rows in shuffled order. The non-dummy positions are exactly
/// `0..non_dummy_count`. Only the dummy flags are read and exactly one permutation is drawn
/// from `rng`. Fails without drawing if the union has more rows than a union map can index.
pub fn shuffle_and_get_union_map<R: CryptoRng + ?Sized>(
    dummy_rows: &[bool],
    rng: &mut R,
) -> Result<Vec<i32>, processor::Error> {
    union_size(dummy_rows.len())?;
    info!("Shuffling input and preparing union map for the adapter");
    let permutation = secure_random_permutation(dummy_rows.len(), rng);
    let mut union_map = vec![DUMMY; dummy_rows.len()];
    let mut non_dummy_rows: i32 = 0;
    for &slot in &permutation {
        if !dummy_rows[slot] {
            union_map[slot] = non_dummy_rows;
            non_dummy_rows += 1;
        }
    }
    Ok(union_map)
}

/// Checks that a union map only holds [`DUMMY`] or the positions `0..k` (each once) and
/// returns `k`.
pub fn validate_union_map(union_map: &[i32]) -> Result<usize, Error> {
    let mut seen = vec![false; union_map.len()];
    let mut count = 0;
    for (i, &slot) in union_map.iter().enumerate() {
        if slot == DUMMY {
            continue;
        }
        let Some(flag) = usize::try_from(slot).ok().and_then(|s| seen.get_mut(s)) else {
            return Err(Error::MalformedUnionMap(format!(
                "entry {i} has value {slot}"
            )));
        };
        if *flag {
            return Err(Error::MalformedUnionMap(format!(
                "position {slot} appears twice"
            )));
        }
        *flag = true;
        count += 1;
    }
    if seen[..count].iter().any(|s| !s) {
        return Err(Error::MalformedUnionMap(
            "positions are not consecutive from 0".to_string(),
        ));
    }
    Ok(count)
}
