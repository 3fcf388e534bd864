//! Serializes the local rows in shuffled order.

use tracing::{debug, info};

use crate::{
    codec::{ConversionRow, Field, PartnerRow, PublisherRow, layout, row_width},
    config::{Config, Role},
    input::{LocalInput, PartnerInput, PublisherInput},
};

/// Serializes the local row at a given union index into its fixed layout.
pub trait RowSource: Send + Sync {
    /// The role whose rows are produced.
    fn role(&self) -> Role;

    /// Width of every serialized row in bytes.
    fn row_width(&self) -> usize;

    /// Writes the row at union index `index` into `out`, which is [`RowSource::row_width`]
    /// bytes long.
    fn write_row(&self, index: usize, out: &mut [u8]);
}

fn pad<T: Clone>(values: &[T], len: usize, default: T) -> Vec<T> {
    let mut padded = values.to_vec();
    padded.resize(len, default);
    padded
}

fn pad_nested<T: Clone>(values: &[Vec<T>], len: usize, inner: usize, default: T) -> Vec<Vec<T>> {
    let mut padded: Vec<Vec<T>> = values
        .iter()
        .map(|v| pad(v, inner, default.clone()))
        .collect();
    padded.resize(len, vec![default; inner]);
    padded
}

/// Publisher columns padded to the union size.
struct PublisherColumns {
    opportunity_timestamps: Vec<u32>,
    control_population: Vec<bool>,
    test_population: Vec<bool>,
    num_impressions: Vec<i64>,
    breakdown_ids: Vec<u32>,
}

impl PublisherColumns {
    fn new(input: &PublisherInput) -> Self {
        let n = input.dummy_rows.len();
        Self {
            opportunity_timestamps: pad(&input.opportunity_timestamps, n, 0),
            control_population: pad(&input.control_population, n, false),
            test_population: pad(&input.test_population, n, false),
            num_impressions: pad(&input.num_impressions, n, 0),
            breakdown_ids: pad(&input.breakdown_ids, n, 0),
        }
    }

    fn row(&self, i: usize) -> PublisherRow {
        let opportunity_timestamp = self.opportunity_timestamps[i];
        let control = self.control_population[i];
        let test = self.test_population[i];
        PublisherRow {
            breakdown_id: self.breakdown_ids[i] != 0,
            control_population: control,
            is_valid_opportunity_timestamp: opportunity_timestamp > 0 && (control || test),
            test_reach: test && self.num_impressions[i] > 0,
            opportunity_timestamp,
        }
    }
}

impl RowSource for PublisherColumns {
    fn role(&self) -> Role {
        Role::Publisher
    }

    fn row_width(&self) -> usize {
        row_width(Role::Publisher, 0)
    }

    fn write_row(&self, index: usize, out: &mut [u8]) {
        self.row(index).encode(out);
    }
}

/// Partner columns padded to the union size and to the configured number of conversions.
struct PartnerColumns {
    cohort_group_ids: Vec<u32>,
    purchase_timestamps: Vec<Vec<u32>>,
    purchase_values: Vec<Vec<i64>>,
    purchase_values_squared: Vec<Vec<i64>>,
    config: Config,
}

impl PartnerColumns {
    fn new(input: &PartnerInput, config: &Config) -> Self {
        let n = input.dummy_rows.len();
        let c = config.num_conversions_per_user;
        Self {
            cohort_group_ids: pad(&input.cohort_group_ids, n, 0),
            purchase_timestamps: pad_nested(&input.purchase_timestamps, n, c, 0),
            purchase_values: pad_nested(&input.purchase_values, n, c, 0),
            purchase_values_squared: pad_nested(&input.purchase_values_squared, n, c, 0),
            config: config.clone(),
        }
    }

    fn row(&self, i: usize) -> PartnerRow {
        let timestamps = &self.purchase_timestamps[i];
        let conversions = timestamps
            .iter()
            .zip(&self.purchase_values[i])
            .zip(&self.purchase_values_squared[i])
            .map(|((&purchase_timestamp, &value), &squared)| ConversionRow {
                purchase_timestamp,
                threshold_timestamp: self.config.threshold_timestamp(purchase_timestamp),
                // the field is 32 bits wide, larger values wrap
                purchase_value: value as i32,
                purchase_value_squared: squared,
            })
            .collect();
        PartnerRow {
            any_valid_purchase_timestamp: timestamps.iter().any(|ts| *ts > 0),
            cohort_group_id: self.cohort_group_ids[i],
            conversions,
        }
    }
}

impl RowSource for PartnerColumns {
    fn role(&self) -> Role {
        Role::Partner
    }

    fn row_width(&self) -> usize {
        row_width(Role::Partner, self.config.num_conversions_per_user)
    }

    fn write_row(&self, index: usize, out: &mut [u8]) {
        self.row(index).encode(out);
    }
}

/// Packs the local rows into serialized byte rows ordered by union slot.
pub struct PlaintextPacker {
    source: Box<dyn RowSource>,
    layout: Vec<Field>,
}

impl PlaintextPacker {
    /// Pads the columns of an input that was validated against `config`.
    pub fn new(input: &LocalInput, config: &Config) -> Self {
        let source: Box<dyn RowSource> = match input {
            LocalInput::Publisher(input) => Box::new(PublisherColumns::new(input)),
            LocalInput::Partner(input) => Box::new(PartnerColumns::new(input, config)),
        };
        let layout = layout(input.role(), config.num_conversions_per_user);
        Self { source, layout }
    }

    /// The role of the packed rows.
    pub fn role(&self) -> Role {
        self.source.role()
    }

    /// Width of every packed row in bytes.
    pub fn row_width(&self) -> usize {
        self.source.row_width()
    }

    /// The fields of every packed row.
    pub fn layout(&self) -> &[Field] {
        &self.layout
    }

    /// Serializes one row per non-dummy entry of `union_map`; row `k` is the row whose union
    /// map entry is `k`.
    ///
    /// # Panics
    /// If `union_map` is longer than the local union.
    pub fn pack(&self, union_map: &[i32]) -> Vec<Vec<u8>> {
        info!("Begin plaintext data serialization as bytes");
        let mut reverse_union_map = vec![0; union_map.len()];
        let mut input_size = 0;
        for (index, &slot) in union_map.iter().enumerate() {
            if let Ok(slot) = usize::try_from(slot) {
                reverse_union_map[slot] = index;
                input_size = input_size.max(slot + 1);
            }
        }
        reverse_union_map.truncate(input_size);

        let width = self.row_width();
        debug!(
            "{} row layout: {}",
            self.role(),
            self.layout
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows: Vec<Vec<u8>> = reverse_union_map
            .iter()
            .map(|&index| {
                let mut row = vec![0; width];
                self.source.write_row(index, &mut row);
                row
            })
            .collect();
        debug!(
            "Serialized {} {} rows of {width} bytes",
            rows.len(),
            self.role()
        );
        rows
    }
}
