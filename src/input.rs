//! Local plaintext columns of the publisher and the partner.
//!
//! Both parties hold the same number of rows (the union of their populations). Rows that a
//! party does not actually have are marked as dummy rows; they only exist to hide the real
//! population size. Columns may be shorter than the union and are padded with 0/false when
//! packed, but they are never allowed to be longer.

use serde::{Deserialize, Serialize};

use crate::config::{Config, Error, Role};

/// Exposure data of the publisher, one entry per union row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInput {
    /// Time of the ad opportunity, 0 if there was none.
    pub opportunity_timestamps: Vec<u32>,
    /// Membership in the control population.
    pub control_population: Vec<bool>,
    /// Membership in the test population.
    pub test_population: Vec<bool>,
    /// Number of impressions the user saw.
    pub num_impressions: Vec<i64>,
    /// Breakdown the user belongs to; any non-zero id sets the breakdown bit.
    pub breakdown_ids: Vec<u32>,
    /// Marks the rows that are padding only.
    pub dummy_rows: Vec<bool>,
}

/// Purchase data of the partner, one entry per union row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerInput {
    /// Cohort of the user.
    pub cohort_group_ids: Vec<u32>,
    /// Purchase timestamps per user, at most `num_conversions_per_user` each.
    pub purchase_timestamps: Vec<Vec<u32>>,
    /// Purchase values per user, matching `purchase_timestamps`.
    pub purchase_values: Vec<Vec<i64>>,
    /// Squared purchase values per user, matching `purchase_timestamps`.
    pub purchase_values_squared: Vec<Vec<i64>>,
    /// Marks the rows that are padding only.
    pub dummy_rows: Vec<bool>,
}

/// The local input of either party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalInput {
    /// Publisher columns.
    Publisher(PublisherInput),
    /// Partner columns.
    Partner(PartnerInput),
}

impl From<PublisherInput> for LocalInput {
    fn from(input: PublisherInput) -> Self {
        LocalInput::Publisher(input)
    }
}

impl From<PartnerInput> for LocalInput {
    fn from(input: PartnerInput) -> Self {
        LocalInput::Partner(input)
    }
}

impl LocalInput {
    /// The role of the party holding this input.
    pub fn role(&self) -> Role {
        match self {
            LocalInput::Publisher(_) => Role::Publisher,
            LocalInput::Partner(_) => Role::Partner,
        }
    }

    /// The dummy flag of every union row.
    pub fn dummy_rows(&self) -> &[bool] {
        match self {
            LocalInput::Publisher(input) => &input.dummy_rows,
            LocalInput::Partner(input) => &input.dummy_rows,
        }
    }

    /// Number of rows in the union, dummy rows included.
    pub fn num_rows(&self) -> usize {
        self.dummy_rows().len()
    }

    /// Checks that the input matches the configuration.
    pub fn validate(&self, config: &Config) -> Result<(), Error> {
        if self.role() != config.role {
            return Err(Error::RoleMismatch {
                configured: config.role,
                input: self.role(),
            });
        }
        match self {
            LocalInput::Publisher(input) => input.validate(),
            LocalInput::Partner(input) => input.validate(config.num_conversions_per_user),
        }
    }
}

fn check_column<T>(column: &'static str, values: &[T], union_size: usize) -> Result<(), Error> {
    if values.len() > union_size {
        return Err(Error::ColumnTooLong {
            column,
            len: values.len(),
            union_size,
        });
    }
    Ok(())
}

impl PublisherInput {
    fn validate(&self) -> Result<(), Error> {
        let n = self.dummy_rows.len();
        check_column("opportunity_timestamps", &self.opportunity_timestamps, n)?;
        check_column("control_population", &self.control_population, n)?;
        check_column("test_population", &self.test_population, n)?;
        check_column("num_impressions", &self.num_impressions, n)?;
        check_column("breakdown_ids", &self.breakdown_ids, n)
    }
}

impl PartnerInput {
    fn validate(&self, num_conversions_per_user: usize) -> Result<(), Error> {
        let n = self.dummy_rows.len();
        check_column("cohort_group_ids", &self.cohort_group_ids, n)?;
        check_column("purchase_timestamps", &self.purchase_timestamps, n)?;
        check_column("purchase_values", &self.purchase_values, n)?;
        check_column("purchase_values_squared", &self.purchase_values_squared, n)?;

        for (row, timestamps) in self.purchase_timestamps.iter().enumerate() {
            if timestamps.len() > num_conversions_per_user {
                return Err(Error::TooManyConversions {
                    column: "purchase_timestamps",
                    row,
                    len: timestamps.len(),
                    max: num_conversions_per_user,
                });
            }
        }
        for (column, nested) in [
            ("purchase_values", &self.purchase_values),
            ("purchase_values_squared", &self.purchase_values_squared),
        ] {
            for (row, values) in nested.iter().enumerate() {
                let timestamps = self.purchase_timestamps.get(row).map_or(0, Vec::len);
                if values.len() != timestamps {
                    return Err(Error::ConversionShapeMismatch {
                        column,
                        row,
                        timestamps,
                        len: values.len(),
                    });
                }
            }
        }
        Ok(())
    }
}
