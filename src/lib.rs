//! Compaction-based input processing for private lift measurement.
//!
//! A publisher (who knows which users saw an ad) and a partner (who knows which users made a
//! purchase) want to measure the lift of an ad campaign without revealing their data to each
//! other. Before the lift can be computed on secret shares, both parties need to turn their
//! local rows into secret shares of the rows that are present on both sides, in the same order
//! for both parties.
//!
//! ## Main Components
//!
//! * [`shuffle`]: hides the order of the local rows and produces the union map.
//! * [`align`]: the [`align::Adapter`] protocol that turns the union map into the intersection
//!   map.
//! * [`pack`]: serializes the local rows in union order using the layouts in [`codec`].
//! * [`compact`]: the [`compact::DataProcessor`] protocol that secret-shares the rows of both
//!   parties, restricted to the intersection.
//! * [`extract`]: decodes the shares into typed columns ([`extract::ProcessedData`]).
//! * [`processor`]: the [`processor::InputProcessor`] which executes all of the above for a
//!   single party.
//!
//! The adapter and data processor protocols are supplied by the caller. The [`dealer`] module
//! implements both using an insecure trusted dealer, which is useful for tests and for local
//! simulations over [`channel::SimpleChannel`].
//!
//! ## Example
//!
//! ```
//! use lift_compaction::{
//!     dealer::simulate,
//!     input::{PartnerInput, PublisherInput},
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = PublisherInput {
//!     opportunity_timestamps: vec![100, 200],
//!     control_population: vec![true, false],
//!     test_population: vec![false, true],
//!     num_impressions: vec![0, 3],
//!     breakdown_ids: vec![0, 1],
//!     dummy_rows: vec![false, false],
//! };
//! let partner = PartnerInput {
//!     cohort_group_ids: vec![1, 2],
//!     purchase_timestamps: vec![vec![150], vec![0]],
//!     purchase_values: vec![vec![20], vec![0]],
//!     purchase_values_squared: vec![vec![400], vec![0]],
//!     dummy_rows: vec![false, true],
//! };
//! let (publisher_shares, partner_shares) = simulate(1, 10, publisher, partner).await?;
//! let revealed = publisher_shares.reveal(&partner_shares);
//! assert_eq!(revealed.threshold_timestamps, vec![vec![160]]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! The input processor itself only shuffles and serializes local data. Privacy depends on the
//! adapter and data processor protocols; the trusted dealer sees all inputs in the clear and
//! must not be used with real data.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod align;
pub mod channel;
pub mod codec;
pub mod compact;
pub mod config;
pub mod dealer;
pub mod extract;
pub mod input;
pub mod pack;
pub mod processor;
pub mod shares;
pub mod shuffle;
pub mod transpose;

pub use config::{Config, Role};
pub use extract::ProcessedData;
pub use processor::{Error, InputProcessor, process_input};
