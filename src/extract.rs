//! Turns secret-shared rows into typed, column-oriented secret shares.

use tracing::{Level, info, instrument};

use crate::{
    codec::{PartnerRow, PublisherRow, row_width},
    config::Role,
    processor::Error,
    shares::{SecretBits, SecretByteMatrix, SecretInts},
};

/// The local party's shares of all columns of the intersection.
///
/// Every column has exactly [`ProcessedData::num_rows`] entries, in the order returned by the
/// data processor. Per-conversion columns hold one column per conversion slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedData {
    /// Number of rows in the intersection.
    pub num_rows: usize,
    /// Publisher breakdown bit.
    pub breakdown_ids: SecretBits,
    /// Publisher control population membership.
    pub control_population: SecretBits,
    /// Whether the publisher opportunity timestamp is valid.
    pub is_valid_opportunity_timestamp: SecretBits,
    /// Whether the user was reached in the test population.
    pub test_reach: SecretBits,
    /// Publisher opportunity timestamps.
    pub opportunity_timestamps: SecretInts<u32>,
    /// Whether the partner user has any purchase.
    pub any_valid_purchase_timestamp: SecretBits,
    /// Partner cohort ids.
    pub cohort_group_ids: SecretInts<u32>,
    /// Purchase timestamps, one column per conversion slot.
    pub purchase_timestamps: Vec<SecretInts<u32>>,
    /// Threshold timestamps, one column per conversion slot.
    pub threshold_timestamps: Vec<SecretInts<u32>>,
    /// Purchase values, one column per conversion slot.
    pub purchase_values: Vec<SecretInts<i32>>,
    /// Squared purchase values, one column per conversion slot.
    pub purchase_values_squared: Vec<SecretInts<i64>>,
}

/// Plaintext columns, obtained by combining the [`ProcessedData`] of both parties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevealedData {
    /// Publisher breakdown bit.
    pub breakdown_ids: Vec<bool>,
    /// Publisher control population membership.
    pub control_population: Vec<bool>,
    /// Whether the publisher opportunity timestamp is valid.
    pub is_valid_opportunity_timestamp: Vec<bool>,
    /// Whether the user was reached in the test population.
    pub test_reach: Vec<bool>,
    /// Publisher opportunity timestamps.
    pub opportunity_timestamps: Vec<u32>,
    /// Whether the partner user has any purchase.
    pub any_valid_purchase_timestamp: Vec<bool>,
    /// Partner cohort ids.
    pub cohort_group_ids: Vec<u32>,
    /// Purchase timestamps, one column per conversion slot.
    pub purchase_timestamps: Vec<Vec<u32>>,
    /// Threshold timestamps, one column per conversion slot.
    pub threshold_timestamps: Vec<Vec<u32>>,
    /// Purchase values, one column per conversion slot.
    pub purchase_values: Vec<Vec<i32>>,
    /// Squared purchase values, one column per conversion slot.
    pub purchase_values_squared: Vec<Vec<i64>>,
}

fn reveal_all<T: std::ops::BitXor<Output = T> + Copy>(
    a: &[SecretInts<T>],
    b: &[SecretInts<T>],
) -> Vec<Vec<T>> {
    a.iter().zip(b).map(|(a, b)| a.reveal(b)).collect()
}

impl ProcessedData {
    /// Combines the shares of both parties.
    ///
    /// # Panics
    /// If the two shares do not have the same shape.
    pub fn reveal(&self, other: &ProcessedData) -> RevealedData {
        assert_eq!(self.num_rows, other.num_rows, "row counts differ");
        RevealedData {
            breakdown_ids: self.breakdown_ids.reveal(&other.breakdown_ids),
            control_population: self.control_population.reveal(&other.control_population),
            is_valid_opportunity_timestamp: self
                .is_valid_opportunity_timestamp
                .reveal(&other.is_valid_opportunity_timestamp),
            test_reach: self.test_reach.reveal(&other.test_reach),
            opportunity_timestamps: self
                .opportunity_timestamps
                .reveal(&other.opportunity_timestamps),
            any_valid_purchase_timestamp: self
                .any_valid_purchase_timestamp
                .reveal(&other.any_valid_purchase_timestamp),
            cohort_group_ids: self.cohort_group_ids.reveal(&other.cohort_group_ids),
            purchase_timestamps: reveal_all(&self.purchase_timestamps, &other.purchase_timestamps),
            threshold_timestamps: reveal_all(
                &self.threshold_timestamps,
                &other.threshold_timestamps,
            ),
            purchase_values: reveal_all(&self.purchase_values, &other.purchase_values),
            purchase_values_squared: reveal_all(
                &self.purchase_values_squared,
                &other.purchase_values_squared,
            ),
        }
    }
}

fn check_layout(rows: Role, shares: &SecretByteMatrix, width: usize) -> Result<(), Error> {
    if shares.row_bits() != 8 * width {
        return Err(Error::LayoutMismatch {
            rows,
            expected: 8 * width,
            actual: shares.row_bits(),
        });
    }
    Ok(())
}

/// Decodes the shares of the publisher and partner rows into columns.
#[instrument(level = Level::DEBUG, skip_all, err)]
pub fn extract(
    publisher_shares: &SecretByteMatrix,
    partner_shares: &SecretByteMatrix,
    num_conversions_per_user: usize,
) -> Result<ProcessedData, Error> {
    info!("Begin extraction to MPC types");
    check_layout(Role::Publisher, publisher_shares, row_width(Role::Publisher, 0))?;
    check_layout(
        Role::Partner,
        partner_shares,
        row_width(Role::Partner, num_conversions_per_user),
    )?;
    let num_rows = publisher_shares.batch_size();
    if partner_shares.batch_size() != num_rows {
        return Err(Error::RowCountMismatch {
            rows: Role::Partner,
            expected: num_rows,
            actual: partner_shares.batch_size(),
        });
    }

    let publisher_rows: Vec<PublisherRow> = publisher_shares
        .to_byte_rows()
        .iter()
        .map(|row| PublisherRow::decode(row))
        .collect();
    let partner_rows: Vec<PartnerRow> = partner_shares
        .to_byte_rows()
        .iter()
        .map(|row| PartnerRow::decode(row, num_conversions_per_user))
        .collect();

    let mut data = ProcessedData {
        num_rows,
        ..Default::default()
    };
    extract_publisher_values(&mut data, &publisher_rows);
    extract_partner_values(&mut data, &partner_rows);
    extract_partner_conversion_values(&mut data, &partner_rows, num_conversions_per_user);

    info!("Finish extraction to MPC types");
    Ok(data)
}

fn extract_publisher_values(data: &mut ProcessedData, rows: &[PublisherRow]) {
    let bits = |f: fn(&PublisherRow) -> bool| SecretBits(rows.iter().map(f).collect());
    data.breakdown_ids = bits(|r| r.breakdown_id);
    data.control_population = bits(|r| r.control_population);
    data.is_valid_opportunity_timestamp = bits(|r| r.is_valid_opportunity_timestamp);
    data.test_reach = bits(|r| r.test_reach);
    data.opportunity_timestamps =
        SecretInts(rows.iter().map(|r| r.opportunity_timestamp).collect());
}

fn extract_partner_values(data: &mut ProcessedData, rows: &[PartnerRow]) {
    data.any_valid_purchase_timestamp =
        SecretBits(rows.iter().map(|r| r.any_valid_purchase_timestamp).collect());
    data.cohort_group_ids = SecretInts(rows.iter().map(|r| r.cohort_group_id).collect());
}

fn extract_partner_conversion_values(
    data: &mut ProcessedData,
    rows: &[PartnerRow],
    num_conversions_per_user: usize,
) {
    for conversion in 0..num_conversions_per_user {
        let slot = || rows.iter().map(move |r| r.conversions[conversion]);
        data.purchase_timestamps
            .push(SecretInts(slot().map(|c| c.purchase_timestamp).collect()));
        data.threshold_timestamps
            .push(SecretInts(slot().map(|c| c.threshold_timestamp).collect()));
        data.purchase_values
            .push(SecretInts(slot().map(|c| c.purchase_value).collect()));
        data.purchase_values_squared
            .push(SecretInts(slot().map(|c| c.purchase_value_squared).collect()));
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::codec::ConversionRow;

    fn encode_publisher(rows: &[PublisherRow]) -> Vec<Vec<u8>> {
        rows.iter()
            .map(|row| {
                let mut bytes = vec![0; 5];
                row.encode(&mut bytes);
                bytes
            })
            .collect()
    }

    fn encode_partner(rows: &[PartnerRow], conversions: usize) -> Vec<Vec<u8>> {
        rows.iter()
            .map(|row| {
                let mut bytes = vec![0; row_width(Role::Partner, conversions)];
                row.encode(&mut bytes);
                bytes
            })
            .collect()
    }

    #[test]
    fn extract_and_reveal() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let publisher = [
            PublisherRow {
                breakdown_id: true,
                control_population: true,
                is_valid_opportunity_timestamp: true,
                test_reach: false,
                opportunity_timestamp: 90,
            },
            PublisherRow {
                test_reach: true,
                opportunity_timestamp: u32::MAX,
                ..Default::default()
            },
        ];
        let conversion = |ts: u32, value: i32| ConversionRow {
            purchase_timestamp: ts,
            threshold_timestamp: if ts > 0 { ts + 10 } else { 0 },
            purchase_value: value,
            purchase_value_squared: i64::from(value) * i64::from(value),
        };
        let partner = [
            PartnerRow {
                any_valid_purchase_timestamp: true,
                cohort_group_id: 1,
                conversions: vec![conversion(100, -20), conversion(0, 0)],
            },
            PartnerRow {
                any_valid_purchase_timestamp: true,
                cohort_group_id: 2,
                conversions: vec![conversion(5, i32::MIN), conversion(7, 3)],
            },
        ];
        let (pub_a, pub_b) = SecretByteMatrix::share_rows(&encode_publisher(&publisher), 5, &mut rng);
        let (par_a, par_b) =
            SecretByteMatrix::share_rows(&encode_partner(&partner, 2), 45, &mut rng);

        let a = extract(&pub_a, &par_a, 2).unwrap();
        let b = extract(&pub_b, &par_b, 2).unwrap();
        assert_eq!(a.num_rows, 2);
        assert_eq!(a.purchase_values.len(), 2);

        let revealed = a.reveal(&b);
        assert_eq!(revealed.breakdown_ids, vec![true, false]);
        assert_eq!(revealed.control_population, vec![true, false]);
        assert_eq!(revealed.is_valid_opportunity_timestamp, vec![true, false]);
        assert_eq!(revealed.test_reach, vec![false, true]);
        assert_eq!(revealed.opportunity_timestamps, vec![90, u32::MAX]);
        assert_eq!(revealed.any_valid_purchase_timestamp, vec![true, true]);
        assert_eq!(revealed.cohort_group_ids, vec![1, 2]);
        assert_eq!(revealed.purchase_timestamps, vec![vec![100, 5], vec![0, 7]]);
        assert_eq!(revealed.threshold_timestamps, vec![vec![110, 15], vec![0, 17]]);
        assert_eq!(revealed.purchase_values, vec![vec![-20, i32::MIN], vec![0, 3]]);
        assert_eq!(
            revealed.purchase_values_squared,
            vec![vec![400, 1 << 62], vec![0, 9]]
        );
    }

    #[test]
    fn empty_intersection() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let (pub_a, _) = SecretByteMatrix::share_rows(&[], 5, &mut rng);
        let (par_a, _) = SecretByteMatrix::share_rows(&[], 25, &mut rng);
        let data = extract(&pub_a, &par_a, 1).unwrap();
        assert_eq!(data.num_rows, 0);
        assert!(data.test_reach.is_empty());
        assert_eq!(data.purchase_timestamps.len(), 1);
        assert!(data.purchase_timestamps[0].is_empty());
    }

    #[test]
    fn reject_wrong_layout() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let rows = vec![vec![0; 25]; 3];
        let (publisher, _) = SecretByteMatrix::share_rows(&[vec![0; 5]], 5, &mut rng);
        let (partner, _) = SecretByteMatrix::share_rows(&rows, 25, &mut rng);
        let err = extract(&publisher, &partner, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::LayoutMismatch {
                rows: Role::Partner,
                expected: 360,
                actual: 200
            }
        ));
        let err = extract(&publisher, &partner, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::RowCountMismatch {
                rows: Role::Partner,
                expected: 1,
                actual: 3
            }
        ));
    }
}
