//! Fixed-width byte layouts of publisher and partner rows.
//!
//! Every field is described once by a [`Field`] and read or written by the same generic
//! routine, so the packer (which serializes plaintext rows) and the extractor (which decodes
//! secret-shared rows) can never disagree about an offset. Decoding is purely bitwise, which
//! is why it works unchanged on XOR shares of a row.

use std::fmt;

use crate::config::Role;

/// Size of a serialized publisher row in bytes.
pub const PUBLISHER_ROW_BYTES: usize = 5;
/// Size of the fixed header of a serialized partner row in bytes.
pub const PARTNER_ROW_BYTES: usize = 5;
/// Size of one serialized conversion block in bytes.
pub const CONVERSION_ROW_BYTES: usize = 20;

/// How the bits of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A single bit at the given position (0 = least significant) of the byte at the offset.
    Flag {
        /// Bit position inside the byte.
        bit: u8,
    },
    /// A little-endian unsigned integer.
    Unsigned,
    /// A little-endian two's complement integer.
    Signed,
}

/// A named field at a fixed position inside a serialized row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Name of the field, shown when a row layout is logged.
    pub name: &'static str,
    /// Offset of the first byte of the field.
    pub offset: usize,
    /// Width of the field in bytes (1 for flags).
    pub width: usize,
    /// Interpretation of the bits.
    pub kind: FieldKind,
}

impl Field {
    const fn flag(name: &'static str, offset: usize, bit: u8) -> Self {
        Self {
            name,
            offset,
            width: 1,
            kind: FieldKind::Flag { bit },
        }
    }

    const fn unsigned(name: &'static str, offset: usize, width: usize) -> Self {
        Self {
            name,
            offset,
            width,
            kind: FieldKind::Unsigned,
        }
    }

    const fn signed(name: &'static str, offset: usize, width: usize) -> Self {
        Self {
            name,
            offset,
            width,
            kind: FieldKind::Signed,
        }
    }

    /// The same field moved `by` bytes further into the row.
    pub const fn shifted(self, by: usize) -> Self {
        Self {
            offset: self.offset + by,
            ..self
        }
    }

    /// Writes the low `width` bytes of `value` (or its lowest bit for flags).
    ///
    /// # Panics
    /// If the field does not fit into `row`.
    pub fn write(&self, row: &mut [u8], value: u64) {
        match self.kind {
            FieldKind::Flag { bit } => {
                let mask = 1u8 << bit;
                let byte = &mut row[self.offset];
                *byte = (*byte & !mask) | (((value & 1) as u8) << bit);
            }
            FieldKind::Unsigned | FieldKind::Signed => {
                row[self.offset..self.offset + self.width]
                    .copy_from_slice(&value.to_le_bytes()[..self.width]);
            }
        }
    }

    /// Reads the field, sign-extending signed fields to 64 bits.
    ///
    /// # Panics
    /// If the field does not fit into `row`.
    pub fn read(&self, row: &[u8]) -> u64 {
        match self.kind {
            FieldKind::Flag { bit } => u64::from((row[self.offset] >> bit) & 1),
            FieldKind::Unsigned => self.read_raw(row),
            FieldKind::Signed => {
                let shift = 64 - 8 * self.width as u32;
                (((self.read_raw(row) << shift) as i64) >> shift) as u64
            }
        }
    }

    fn read_raw(&self, row: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf[..self.width].copy_from_slice(&row[self.offset..self.offset + self.width]);
        u64::from_le_bytes(buf)
    }

    fn read_flag(&self, row: &[u8]) -> bool {
        self.read(row) == 1
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FieldKind::Flag { bit } => write!(f, "{}@{}.{bit}", self.name, self.offset),
            FieldKind::Unsigned | FieldKind::Signed => {
                write!(f, "{}@{}..{}", self.name, self.offset, self.offset + self.width)
            }
        }
    }
}

/// Field descriptors of [`PublisherRow`].
pub mod publisher {
    use super::Field;

    /// byte 0, bit 0.
    pub const BREAKDOWN_ID: Field = Field::flag("breakdown_id", 0, 0);
    /// byte 0, bit 1.
    pub const CONTROL_POPULATION: Field = Field::flag("control_population", 0, 1);
    /// byte 0, bit 2.
    pub const IS_VALID_OPPORTUNITY_TIMESTAMP: Field =
        Field::flag("is_valid_opportunity_timestamp", 0, 2);
    /// byte 0, bit 3.
    pub const TEST_REACH: Field = Field::flag("test_reach", 0, 3);
    /// bytes 1-4.
    pub const OPPORTUNITY_TIMESTAMP: Field = Field::unsigned("opportunity_timestamp", 1, 4);

    /// All fields in layout order.
    pub const FIELDS: [Field; 5] = [
        BREAKDOWN_ID,
        CONTROL_POPULATION,
        IS_VALID_OPPORTUNITY_TIMESTAMP,
        TEST_REACH,
        OPPORTUNITY_TIMESTAMP,
    ];
}

/// Field descriptors of the [`PartnerRow`] header.
pub mod partner {
    use super::Field;

    /// byte 0, bit 0.
    pub const ANY_VALID_PURCHASE_TIMESTAMP: Field =
        Field::flag("any_valid_purchase_timestamp", 0, 0);
    /// bytes 1-4.
    pub const COHORT_GROUP_ID: Field = Field::unsigned("cohort_group_id", 1, 4);

    /// All header fields in layout order.
    pub const FIELDS: [Field; 2] = [ANY_VALID_PURCHASE_TIMESTAMP, COHORT_GROUP_ID];
}

/// Field descriptors of a [`ConversionRow`], relative to the start of its block.
pub mod conversion {
    use super::Field;

    /// bytes 0-3.
    pub const PURCHASE_TIMESTAMP: Field = Field::unsigned("purchase_timestamp", 0, 4);
    /// bytes 4-7.
    pub const THRESHOLD_TIMESTAMP: Field = Field::unsigned("threshold_timestamp", 4, 4);
    /// bytes 8-11.
    pub const PURCHASE_VALUE: Field = Field::signed("purchase_value", 8, 4);
    /// bytes 12-19.
    pub const PURCHASE_VALUE_SQUARED: Field = Field::signed("purchase_value_squared", 12, 8);

    /// All fields in layout order.
    pub const FIELDS: [Field; 4] = [
        PURCHASE_TIMESTAMP,
        THRESHOLD_TIMESTAMP,
        PURCHASE_VALUE,
        PURCHASE_VALUE_SQUARED,
    ];
}

/// Offset of the conversion block `slot` inside a partner row.
fn conversion_offset(slot: usize) -> usize {
    PARTNER_ROW_BYTES + slot * CONVERSION_ROW_BYTES
}

/// All fields of a serialized row of the given role, at their offsets inside the row.
pub fn layout(role: Role, num_conversions_per_user: usize) -> Vec<Field> {
    match role {
        Role::Publisher => publisher::FIELDS.to_vec(),
        Role::Partner => {
            let mut fields = partner::FIELDS.to_vec();
            for slot in 0..num_conversions_per_user {
                let at = conversion_offset(slot);
                fields.extend(conversion::FIELDS.map(|field| field.shifted(at)));
            }
            fields
        }
    }
}

/// Width in bytes of a serialized row of the given role.
pub fn row_width(role: Role, num_conversions_per_user: usize) -> usize {
    match role {
        Role::Publisher => PUBLISHER_ROW_BYTES,
        Role::Partner => PARTNER_ROW_BYTES + CONVERSION_ROW_BYTES * num_conversions_per_user,
    }
}

/// The exposure record of a single user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherRow {
    /// Whether the user belongs to the (single bit) breakdown group.
    pub breakdown_id: bool,
    /// Whether the user is in the control population.
    pub control_population: bool,
    /// Whether the opportunity timestamp is set and the user is in either population.
    pub is_valid_opportunity_timestamp: bool,
    /// Whether the user is in the test population and saw at least one impression.
    pub test_reach: bool,
    /// Time of the ad opportunity.
    pub opportunity_timestamp: u32,
}

impl PublisherRow {
    /// Serializes the row into its [`PUBLISHER_ROW_BYTES`] layout.
    pub fn encode(&self, out: &mut [u8]) {
        use publisher::*;
        BREAKDOWN_ID.write(out, self.breakdown_id.into());
        CONTROL_POPULATION.write(out, self.control_population.into());
        IS_VALID_OPPORTUNITY_TIMESTAMP.write(out, self.is_valid_opportunity_timestamp.into());
        TEST_REACH.write(out, self.test_reach.into());
        OPPORTUNITY_TIMESTAMP.write(out, self.opportunity_timestamp.into());
    }

    /// Deserializes a row (or a share of a row) from its [`PUBLISHER_ROW_BYTES`] layout.
    pub fn decode(row: &[u8]) -> Self {
        use publisher::*;
        Self {
            breakdown_id: BREAKDOWN_ID.read_flag(row),
            control_population: CONTROL_POPULATION.read_flag(row),
            is_valid_opportunity_timestamp: IS_VALID_OPPORTUNITY_TIMESTAMP.read_flag(row),
            test_reach: TEST_REACH.read_flag(row),
            opportunity_timestamp: OPPORTUNITY_TIMESTAMP.read(row) as u32,
        }
    }
}

/// A single purchase of a partner user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionRow {
    /// Time of the purchase, 0 if there was none.
    pub purchase_timestamp: u32,
    /// Purchase time plus the threshold window, 0 if there was no purchase.
    pub threshold_timestamp: u32,
    /// Value of the purchase.
    pub purchase_value: i32,
    /// Square of the purchase value.
    pub purchase_value_squared: i64,
}

impl ConversionRow {
    /// Writes the conversion into block `slot` of a partner row.
    fn encode(&self, row: &mut [u8], slot: usize) {
        use conversion::*;
        let at = conversion_offset(slot);
        PURCHASE_TIMESTAMP
            .shifted(at)
            .write(row, self.purchase_timestamp.into());
        THRESHOLD_TIMESTAMP
            .shifted(at)
            .write(row, self.threshold_timestamp.into());
        PURCHASE_VALUE
            .shifted(at)
            .write(row, self.purchase_value as u64);
        PURCHASE_VALUE_SQUARED
            .shifted(at)
            .write(row, self.purchase_value_squared as u64);
    }

    /// Reads the conversion from block `slot` of a partner row.
    fn decode(row: &[u8], slot: usize) -> Self {
        use conversion::*;
        let at = conversion_offset(slot);
        Self {
            purchase_timestamp: PURCHASE_TIMESTAMP.shifted(at).read(row) as u32,
            threshold_timestamp: THRESHOLD_TIMESTAMP.shifted(at).read(row) as u32,
            purchase_value: PURCHASE_VALUE.shifted(at).read(row) as i32,
            purchase_value_squared: PURCHASE_VALUE_SQUARED.shifted(at).read(row) as i64,
        }
    }
}

/// The purchase record of a single user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartnerRow {
    /// Whether any of the conversions has a positive purchase timestamp.
    pub any_valid_purchase_timestamp: bool,
    /// The cohort the user belongs to.
    pub cohort_group_id: u32,
    /// Exactly `num_conversions_per_user` conversions.
    pub conversions: Vec<ConversionRow>,
}

impl PartnerRow {
    /// Serializes the row into a layout of [`row_width`] bytes.
    pub fn encode(&self, out: &mut [u8]) {
        partner::ANY_VALID_PURCHASE_TIMESTAMP.write(out, self.any_valid_purchase_timestamp.into());
        partner::COHORT_GROUP_ID.write(out, self.cohort_group_id.into());
        for (slot, conversion) in self.conversions.iter().enumerate() {
            conversion.encode(out, slot);
        }
    }

    /// Deserializes a row (or a share of a row) with `num_conversions` conversion blocks.
    pub fn decode(row: &[u8], num_conversions: usize) -> Self {
        let conversions = (0..num_conversions)
            .map(|slot| ConversionRow::decode(row, slot))
            .collect();
        Self {
            any_valid_purchase_timestamp: partner::ANY_VALID_PURCHASE_TIMESTAMP.read_flag(row),
            cohort_group_id: partner::COHORT_GROUP_ID.read(row) as u32,
            conversions,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn publisher_layout() {
        let row = PublisherRow {
            breakdown_id: true,
            control_population: false,
            is_valid_opportunity_timestamp: true,
            test_reach: true,
            opportunity_timestamp: 0x0403_0201,
        };
        let mut bytes = [0; PUBLISHER_ROW_BYTES];
        row.encode(&mut bytes);
        assert_eq!(bytes, [0b1101, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(PublisherRow::decode(&bytes), row);
    }

    #[test]
    fn partner_layout() {
        let row = PartnerRow {
            any_valid_purchase_timestamp: true,
            cohort_group_id: 7,
            conversions: vec![
                ConversionRow {
                    purchase_timestamp: 100,
                    threshold_timestamp: 110,
                    purchase_value: -2,
                    purchase_value_squared: 4,
                },
                ConversionRow::default(),
            ],
        };
        let mut bytes = vec![0; row_width(Role::Partner, 2)];
        row.encode(&mut bytes);
        assert_eq!(bytes.len(), 45);
        assert_eq!(&bytes[..5], &[1, 7, 0, 0, 0]);
        assert_eq!(&bytes[5..9], &100u32.to_le_bytes());
        assert_eq!(&bytes[9..13], &110u32.to_le_bytes());
        assert_eq!(&bytes[13..17], &[0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(&bytes[17..25], &4i64.to_le_bytes());
        assert!(bytes[25..].iter().all(|b| *b == 0));
        assert_eq!(PartnerRow::decode(&bytes, 2), row);
    }

    /// Every byte of the row is covered by exactly one field, except for the shared flag bytes.
    fn assert_tiles_row(fields: &[Field], width: usize) {
        let mut covered = vec![0; width];
        for field in fields {
            for byte in &mut covered[field.offset..field.offset + field.width] {
                *byte += 1;
            }
        }
        for (byte, count) in covered.iter().enumerate() {
            let flags = fields
                .iter()
                .filter(|f| f.offset == byte && matches!(f.kind, FieldKind::Flag { .. }))
                .count();
            assert_eq!(*count, flags.max(1), "byte {byte}");
        }
    }

    #[test]
    fn layouts_tile_rows() {
        assert_tiles_row(&layout(Role::Publisher, 3), row_width(Role::Publisher, 3));
        for conversions in 0..4 {
            let fields = layout(Role::Partner, conversions);
            assert_eq!(fields.len(), 2 + 4 * conversions);
            assert_tiles_row(&fields, row_width(Role::Partner, conversions));
        }
    }

    #[test]
    fn display_fields() {
        let fields: Vec<String> = layout(Role::Partner, 2)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(fields[0], "any_valid_purchase_timestamp@0.0");
        assert_eq!(fields[1], "cohort_group_id@1..5");
        assert_eq!(fields[4], "purchase_value@13..17");
        assert_eq!(fields[9], "purchase_value_squared@37..45");
    }

    fn conversion_row() -> impl Strategy<Value = ConversionRow> {
        (any::<u32>(), any::<u32>(), any::<i32>(), any::<i64>()).prop_map(
            |(purchase_timestamp, threshold_timestamp, purchase_value, purchase_value_squared)| {
                ConversionRow {
                    purchase_timestamp,
                    threshold_timestamp,
                    purchase_value,
                    purchase_value_squared,
                }
            },
        )
    }

    proptest! {
        #[test]
        fn publisher_round_trip(flags in any::<[bool; 4]>(), ts in any::<u32>()) {
            let row = PublisherRow {
                breakdown_id: flags[0],
                control_population: flags[1],
                is_valid_opportunity_timestamp: flags[2],
                test_reach: flags[3],
                opportunity_timestamp: ts,
            };
            let mut bytes = [0; PUBLISHER_ROW_BYTES];
            row.encode(&mut bytes);
            prop_assert_eq!(PublisherRow::decode(&bytes), row);
        }

        #[test]
        fn partner_round_trip(
            any_valid in any::<bool>(),
            cohort in any::<u32>(),
            conversions in prop::collection::vec(conversion_row(), 1..6),
        ) {
            let row = PartnerRow {
                any_valid_purchase_timestamp: any_valid,
                cohort_group_id: cohort,
                conversions,
            };
            let n = row.conversions.len();
            let mut bytes = vec![0; row_width(Role::Partner, n)];
            row.encode(&mut bytes);
            prop_assert_eq!(PartnerRow::decode(&bytes, n), row);
        }

        #[test]
        fn decoding_commutes_with_xor(a in any::<[u8; 25]>(), b in any::<[u8; 25]>()) {
            let combined: Vec<u8> = a.iter().zip(&b).map(|(x, y)| x ^ y).collect();
            let (ra, rb) = (PartnerRow::decode(&a, 1), PartnerRow::decode(&b, 1));
            let rc = PartnerRow::decode(&combined, 1);
            let (ca, cb, cc) = (ra.conversions[0], rb.conversions[0], rc.conversions[0]);
            prop_assert_eq!(ra.cohort_group_id ^ rb.cohort_group_id, rc.cohort_group_id);
            prop_assert_eq!(ca.purchase_value ^ cb.purchase_value, cc.purchase_value);
            prop_assert_eq!(
                ca.purchase_value_squared ^ cb.purchase_value_squared,
                cc.purchase_value_squared
            );
        }
    }
}
