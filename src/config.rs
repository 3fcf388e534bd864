//! Configuration shared by both parties of a lift computation.
//!
//! Both parties must agree on [`Config::num_conversions_per_user`] and
//! [`Config::purchase_timestamp_threshold_window`], otherwise the partner rows
//! serialized by one party cannot be decoded by the other.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of conversions kept per partner user.
pub const DEFAULT_NUM_CONVERSIONS_PER_USER: usize = 25;

/// Default window added to a purchase timestamp to obtain its threshold timestamp.
pub const DEFAULT_PURCHASE_TIMESTAMP_THRESHOLD_WINDOW: u32 = 10;

/// Errors caused by an invalid configuration or by local input that does not have the
/// shape the configuration demands.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The number of conversions per user must be positive.
    #[error("num_conversions_per_user must be positive")]
    ZeroConversionsPerUser,
    /// The purchase timestamp threshold window must be positive.
    #[error("purchase_timestamp_threshold_window must be positive")]
    ZeroThresholdWindow,
    /// The role string is neither `publisher` nor `partner`.
    #[error("unknown role '{0}', expected 'publisher' or 'partner'")]
    UnknownRole(String),
    /// The configured role does not match the kind of local input that was provided.
    #[error("configured as {configured} but the local input belongs to the {input}")]
    RoleMismatch {
        /// The role in the configuration.
        configured: Role,
        /// The role implied by the local input.
        input: Role,
    },
    /// A column has more entries than there are rows in the union.
    #[error("column '{column}' has {len} entries but the union only has {union_size} rows")]
    ColumnTooLong {
        /// The name of the offending column.
        column: &'static str,
        /// The number of entries in the column.
        len: usize,
        /// The number of rows in the union (including dummy rows).
        union_size: usize,
    },
    /// A user has more conversions than the configuration allows.
    #[error("row {row} of '{column}' has {len} conversions, at most {max} are allowed")]
    TooManyConversions {
        /// The name of the offending column.
        column: &'static str,
        /// The index of the offending row.
        row: usize,
        /// The number of conversions of this user.
        len: usize,
        /// The configured number of conversions per user.
        max: usize,
    },
    /// The per-conversion columns disagree on the number of conversions of a user.
    #[error("row {row} has {timestamps} purchase timestamps but '{column}' has {len} entries")]
    ConversionShapeMismatch {
        /// The name of the column that disagrees with the purchase timestamps.
        column: &'static str,
        /// The index of the offending row.
        row: usize,
        /// The number of purchase timestamps of this user.
        timestamps: usize,
        /// The number of entries in the disagreeing column.
        len: usize,
    },
    /// The union map does not have the shape produced by the shuffler.
    #[error("malformed union map: {0}")]
    MalformedUnionMap(String),
}

/// The two parties of a lift computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds the exposure (opportunity) data.
    Publisher,
    /// Holds the purchase (conversion) data.
    Partner,
}

impl Role {
    /// The role of the other party.
    pub fn peer(self) -> Self {
        match self {
            Role::Publisher => Role::Partner,
            Role::Partner => Role::Publisher,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Partner => f.write_str("partner"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publisher" => Ok(Role::Publisher),
            "partner" => Ok(Role::Partner),
            _ => Err(Error::UnknownRole(s.to_string())),
        }
    }
}

/// Parameters of the input processing stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The role of the local party.
    pub role: Role,
    /// Length of the fixed conversion sequence of every partner row.
    pub num_conversions_per_user: usize,
    /// Added to every positive purchase timestamp to derive its threshold timestamp.
    pub purchase_timestamp_threshold_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Publisher,
            num_conversions_per_user: DEFAULT_NUM_CONVERSIONS_PER_USER,
            purchase_timestamp_threshold_window: DEFAULT_PURCHASE_TIMESTAMP_THRESHOLD_WINDOW,
        }
    }
}

impl Config {
    /// Creates a validated configuration.
    pub fn new(
        role: Role,
        num_conversions_per_user: usize,
        purchase_timestamp_threshold_window: u32,
    ) -> Result<Self, Error> {
        let config = Self {
            role,
            num_conversions_per_user,
            purchase_timestamp_threshold_window,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants of a configuration that was built field by field or
    /// deserialized.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_conversions_per_user == 0 {
            return Err(Error::ZeroConversionsPerUser);
        }
        if self.purchase_timestamp_threshold_window == 0 {
            return Err(Error::ZeroThresholdWindow);
        }
        Ok(())
    }

    /// The threshold timestamp derived from a purchase timestamp, 0 for missing purchases.
    pub fn threshold_timestamp(&self, purchase_timestamp: u32) -> u32 {
        if purchase_timestamp > 0 {
            purchase_timestamp.wrapping_add(self.purchase_timestamp_threshold_window)
        } else {
            0
        }
    }
}
