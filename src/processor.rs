//! The compaction-based input processor, executing all steps for a single party.
//!
//! Both parties call [`InputProcessor::run`] (or [`process_input`]) with their own local
//! input. The steps are executed in a fixed order, each consuming the output of the previous
//! one:
//!
//! 1. Shuffle: a secure random permutation hides the row order and yields the union map.
//! 2. Align: the adapter protocol turns the union map into the intersection map.
//! 3. Pack: the local rows are serialized in union slot order.
//! 4. Exchange counts: both row counts are secret-shared.
//! 5. Compact: the data processor restricts both parties' rows to the intersection and
//!    returns secret shares of them.
//! 6. Extract: the shares are decoded into typed, column-oriented secret shares.
//!
//! No step is retried. Any failure aborts the whole run since partially secret-shared state
//! cannot be resumed.

use rand::CryptoRng;
use thiserror::Error;
use tracing::{Level, info, instrument};

use crate::{
    align::{Adapter, align},
    compact::{DataProcessor, compact},
    config::{self, Config, Role},
    extract::{ProcessedData, extract},
    input::LocalInput,
    pack::PlaintextPacker,
    shuffle::shuffle_and_get_union_map,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that abort the input processing.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration or the local input is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    /// The adapter protocol failed.
    #[error("adapter protocol failed")]
    Adapter(#[source] BoxError),
    /// The data processor protocol failed.
    #[error("data processor protocol failed while {step}")]
    DataProcessor {
        /// What the data processor was asked to do.
        step: &'static str,
        /// The error raised by the data processor.
        #[source]
        source: BoxError,
    },
    /// The local party has more rows than a union map or a shared row count can hold.
    #[error("{0} rows exceed the size of a union map or of a shared row count")]
    TooManyRows(usize),
    /// The secret-shared rows of a party do not match the size of the intersection.
    #[error(
        "{rows} rows do not match up expected intersection size. Expected {expected} but got {actual} rows."
    )]
    RowCountMismatch {
        /// The party whose rows have the wrong count.
        rows: Role,
        /// The number of non-empty entries in the intersection map.
        expected: usize,
        /// The batch size of the secret-shared rows.
        actual: usize,
    },
    /// The secret-shared rows of a party do not have the width of the row layout.
    #[error("{rows} shares have {actual} bits per row, the row layout has {expected}")]
    LayoutMismatch {
        /// The party whose rows have the wrong width.
        rows: Role,
        /// The width of the row layout in bits.
        expected: usize,
        /// The width of the shares in bits.
        actual: usize,
    },
}

/// Executes the input processing steps for the local party.
pub struct InputProcessor<'a, A, D> {
    config: Config,
    input: &'a LocalInput,
    packer: PlaintextPacker,
    adapter: &'a A,
    data_processor: &'a D,
}

impl<'a, A: Adapter, D: DataProcessor> InputProcessor<'a, A, D> {
    /// Validates the configuration and the local input and pads the local columns.
    pub fn new(
        config: Config,
        input: &'a LocalInput,
        adapter: &'a A,
        data_processor: &'a D,
    ) -> Result<Self, Error> {
        config.validate()?;
        input.validate(&config)?;
        let packer = PlaintextPacker::new(input, &config);
        Ok(Self {
            config,
            input,
            packer,
            adapter,
            data_processor,
        })
    }

    /// The role of the local party.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Runs all steps and returns the local party's shares of the processed data.
    ///
    /// `rng` must be the secure generator of the surrounding protocol run; exactly one random
    /// permutation is drawn from it.
    #[instrument(level = Level::DEBUG, skip_all, fields(role = %self.config.role), err)]
    pub async fn run<R: CryptoRng + ?Sized>(&self, rng: &mut R) -> Result<ProcessedData, Error> {
        info!(
            "Processing {} input rows ({} dummy)",
            self.input.num_rows(),
            self.input.dummy_rows().iter().filter(|d| **d).count()
        );
        let union_map = shuffle_and_get_union_map(self.input.dummy_rows(), rng)?;
        let intersection_map = align(self.adapter, &union_map).await?;
        let rows = self.packer.pack(&union_map);
        let (publisher_shares, partner_shares) = compact(
            self.data_processor,
            &self.config,
            &intersection_map,
            &rows,
        )
        .await?;
        extract(
            &publisher_shares,
            &partner_shares,
            self.config.num_conversions_per_user,
        )
    }
}

/// Processes the local input of a single party.
///
/// Convenience wrapper around [`InputProcessor::new`] and [`InputProcessor::run`].
pub async fn process_input<R: CryptoRng + ?Sized>(
    config: Config,
    input: &LocalInput,
    adapter: &impl Adapter,
    data_processor: &impl DataProcessor,
    rng: &mut R,
) -> Result<ProcessedData, Error> {
    InputProcessor::new(config, input, adapter, data_processor)?
        .run(rng)
        .await
}
