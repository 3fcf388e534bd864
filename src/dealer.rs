//! An insecure trusted dealer implementing the adapter and data processor protocols.
//!
//! The dealer sees both union maps and both parties' plaintext rows. It is meant for tests and
//! local simulations, where it stands in for the real private alignment and compaction
//! protocols: it computes the intersection, compacts the rows of each party and hands out XOR
//! shares of the result.

use futures::future::{try_join, try_join3};
use rand::{SeedableRng, random};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{Level, debug, info, instrument};

use crate::{
    align::Adapter,
    channel::{self, Channel, SimpleChannel, recv_from, recv_vec_from, send_to},
    compact::DataProcessor,
    config::{self, Config, Role},
    extract::ProcessedData,
    input::{LocalInput, PartnerInput, PublisherInput},
    processor::{self, process_input},
    shares::{SecretByteMatrix, SecretInt},
    shuffle::{DUMMY, validate_union_map},
};

/// Errors that can occur while executing the trusted dealer.
#[derive(Debug, Error)]
pub enum Error {
    /// An error occurred while trying to communicate over the channel.
    #[error("channel error")]
    Channel(#[from] channel::Error),
    /// A party sent a malformed union map.
    #[error("malformed union map")]
    MalformedUnionMap(#[from] config::Error),
    /// The union maps of both parties have different lengths.
    #[error("unequal union sizes: publisher {publisher} vs partner {partner}")]
    UnionSizeMismatch {
        /// Length of the publisher union map.
        publisher: usize,
        /// Length of the partner union map.
        partner: usize,
    },
    /// The row count was not provided by its owner only.
    #[error("the {0} row count must be provided by the {0} alone")]
    RowCountOwnership(Role),
    /// A party sent a share of the peer's row count that was not issued by the dealer.
    #[error("the {0} sent an unknown row count share")]
    RowCountShareMismatch(Role),
    /// The parties do not agree on the intersection.
    #[error("the {0} requested a different intersection than the one that was computed")]
    IntersectionMismatch(Role),
    /// The owner sent a different number of rows than its union map announced.
    #[error("the {owner} announced {expected} rows, but sent {actual}")]
    RowCountMismatch {
        /// The party owning the rows.
        owner: Role,
        /// The number of non-dummy entries in its union map.
        expected: usize,
        /// The number of rows it sent.
        actual: usize,
    },
    /// A row does not have the width expected by the peer.
    #[error("the {owner} sent a row of {actual} bytes, but rows must be {expected} bytes wide")]
    RowWidthMismatch {
        /// The party owning the rows.
        owner: Role,
        /// The width announced by the peer.
        expected: usize,
        /// The width of the offending row.
        actual: usize,
    },
}

const UNION_MAP: &str = "union map (dealer)";
const INTERSECTION_MAP: &str = "intersection map (dealer)";
const ROW_COUNT: &str = "row count (dealer)";
const MY_ROWS: &str = "my rows (dealer)";
const PEER_ROWS: &str = "peer rows (dealer)";
const SHARES: &str = "row shares (dealer)";

/// The owner's rows and the size of the intersection map.
type MyRows = (Vec<Vec<u8>>, usize);
/// The peer's share of the owner's row count, its intersection map and the row width.
type PeerRows = (u32, Vec<i32>, usize);

/// Computes the intersection map of two union maps of equal length.
///
/// An entry is set if the row is a non-dummy row of both parties; set entries are numbered in
/// ascending union index order.
pub fn intersection_map(publisher: &[i32], partner: &[i32]) -> Vec<i32> {
    let mut position = 0;
    publisher
        .iter()
        .zip(partner)
        .map(|(&a, &b)| {
            if a == DUMMY || b == DUMMY {
                DUMMY
            } else {
                position += 1;
                position - 1
            }
        })
        .collect()
}

/// Picks the owner's rows that are part of the intersection, in intersection order.
fn compact_rows(rows: &[Vec<u8>], union_map: &[i32], intersection: &[i32]) -> Vec<Vec<u8>> {
    intersection
        .iter()
        .zip(union_map)
        .filter(|(position, _)| **position != DUMMY)
        .map(|(_, &slot)| rows[slot as usize].clone())
        .collect()
}

/// Runs the trusted dealer for a publisher and a partner.
#[instrument(level = Level::DEBUG, skip_all, err)]
pub async fn dealer(
    channel: &(impl Channel + Sync),
    publisher: usize,
    partner: usize,
) -> Result<(), Error> {
    let mut rng = ChaCha20Rng::from_seed(random());
    let party = |role: Role| match role {
        Role::Publisher => publisher,
        Role::Partner => partner,
    };

    let (publisher_map, partner_map): (Vec<i32>, Vec<i32>) = try_join(
        recv_from(channel, publisher, UNION_MAP),
        recv_from(channel, partner, UNION_MAP),
    )
    .await?;
    if publisher_map.len() != partner_map.len() {
        return Err(Error::UnionSizeMismatch {
            publisher: publisher_map.len(),
            partner: partner_map.len(),
        });
    }
    let row_counts = [
        validate_union_map(&publisher_map)?,
        validate_union_map(&partner_map)?,
    ];
    let intersection = intersection_map(&publisher_map, &partner_map);
    try_join(
        send_to(channel, publisher, INTERSECTION_MAP, &intersection),
        send_to(channel, partner, INTERSECTION_MAP, &intersection),
    )
    .await?;
    let size = intersection.iter().filter(|i| **i != DUMMY).count();
    info!("Dealer computed an intersection of {size} rows");

    let mut count_shares = [0u32; 2];
    for (i, owner) in [Role::Publisher, Role::Partner].into_iter().enumerate() {
        let (count, none): (Option<u32>, Option<u32>) = try_join(
            recv_from(channel, party(owner), ROW_COUNT),
            recv_from(channel, party(owner.peer()), ROW_COUNT),
        )
        .await?;
        let (Some(count), None) = (count, none) else {
            return Err(Error::RowCountOwnership(owner));
        };
        let mask: u32 = random();
        count_shares[i] = count ^ mask;
        try_join(
            send_to(channel, party(owner), ROW_COUNT, &mask),
            send_to(channel, party(owner.peer()), ROW_COUNT, &count_shares[i]),
        )
        .await?;
    }
    debug!("Dealer shared the row counts");

    let union_maps = [publisher_map, partner_map];
    for (i, owner) in [Role::Publisher, Role::Partner].into_iter().enumerate() {
        let peer = owner.peer();
        let ((rows, output_size), (count_share, peer_map, width)): (MyRows, PeerRows) =
            try_join(
                recv_from(channel, party(owner), MY_ROWS),
                recv_from(channel, party(peer), PEER_ROWS),
            )
            .await?;
        if output_size != intersection.len() {
            return Err(Error::IntersectionMismatch(owner));
        }
        if peer_map != intersection {
            return Err(Error::IntersectionMismatch(peer));
        }
        if count_share != count_shares[i] {
            return Err(Error::RowCountShareMismatch(peer));
        }
        if rows.len() != row_counts[i] {
            return Err(Error::RowCountMismatch {
                owner,
                expected: row_counts[i],
                actual: rows.len(),
            });
        }
        if let Some(row) = rows.iter().find(|row| row.len() != width) {
            return Err(Error::RowWidthMismatch {
                owner,
                expected: width,
                actual: row.len(),
            });
        }

        let compacted = compact_rows(&rows, &union_maps[i], &intersection);
        let (mask, masked) = SecretByteMatrix::share_rows(&compacted, width, &mut rng);
        try_join(
            send_to(channel, party(owner), SHARES, &mask),
            send_to(channel, party(peer), SHARES, &masked),
        )
        .await?;
        debug!("Dealer shared {} {owner} rows", compacted.len());
    }
    Ok(())
}

/// The client side of the trusted dealer, used by the publisher and the partner.
#[derive(Debug)]
pub struct DealerClient<'a, C> {
    channel: &'a C,
    dealer: usize,
}

impl<'a, C: Channel + Sync> DealerClient<'a, C> {
    /// Talks to the dealer with index `dealer` over `channel`.
    pub fn new(channel: &'a C, dealer: usize) -> Self {
        Self { channel, dealer }
    }
}

impl<C: Channel + Sync> Adapter for DealerClient<'_, C> {
    type Error = channel::Error;

    async fn adapt(&self, union_map: &[i32]) -> Result<Vec<i32>, channel::Error> {
        send_to(self.channel, self.dealer, UNION_MAP, &union_map).await?;
        recv_vec_from(self.channel, self.dealer, INTERSECTION_MAP, union_map.len()).await
    }
}

impl<C: Channel + Sync> DataProcessor for DealerClient<'_, C> {
    type Error = channel::Error;

    async fn share_row_count(
        &self,
        _owner: Role,
        count: Option<u32>,
    ) -> Result<SecretInt<u32>, channel::Error> {
        send_to(self.channel, self.dealer, ROW_COUNT, &count).await?;
        let share = recv_from(self.channel, self.dealer, ROW_COUNT).await?;
        Ok(SecretInt(share))
    }

    async fn process_my_data(
        &self,
        rows: &[Vec<u8>],
        output_size: usize,
    ) -> Result<SecretByteMatrix, channel::Error> {
        send_to(self.channel, self.dealer, MY_ROWS, &(rows, output_size)).await?;
        recv_from(self.channel, self.dealer, SHARES).await
    }

    async fn process_peers_data(
        &self,
        peer_row_count: &SecretInt<u32>,
        intersection_map: &[i32],
        peer_row_width: usize,
    ) -> Result<SecretByteMatrix, channel::Error> {
        let msg = (peer_row_count.0, intersection_map, peer_row_width);
        send_to(self.channel, self.dealer, PEER_ROWS, &msg).await?;
        recv_from(self.channel, self.dealer, SHARES).await
    }
}

/// Errors that can occur during a simulated run.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The input processing of one of the parties failed.
    #[error("input processing failed for the {role}")]
    Party {
        /// The party that failed.
        role: Role,
        /// Why it failed.
        #[source]
        source: processor::Error,
    },
    /// The trusted dealer failed.
    #[error("trusted dealer failed")]
    Dealer(#[from] Error),
}

const PUBLISHER: usize = 0;
const PARTNER: usize = 1;
const DEALER: usize = 2;

async fn run_party(
    channel: &SimpleChannel,
    config: Result<Config, config::Error>,
    input: LocalInput,
) -> Result<ProcessedData, SimulationError> {
    let role = input.role();
    let client = DealerClient::new(channel, DEALER);
    let mut rng = ChaCha20Rng::from_seed(random());
    let result = match config {
        Ok(config) => process_input(config, &input, &client, &client, &mut rng).await,
        Err(e) => Err(e.into()),
    };
    result.map_err(|source| SimulationError::Party { role, source })
}

/// Runs the input processing of both parties against a trusted dealer, in memory.
///
/// Returns the processed data of the publisher and of the partner (in this order).
#[instrument(level = Level::DEBUG, skip_all, err)]
pub async fn simulate(
    num_conversions_per_user: usize,
    purchase_timestamp_threshold_window: u32,
    publisher: PublisherInput,
    partner: PartnerInput,
) -> Result<(ProcessedData, ProcessedData), SimulationError> {
    let channels = SimpleChannel::channels(3);
    let config = |role| {
        Config::new(
            role,
            num_conversions_per_user,
            purchase_timestamp_threshold_window,
        )
    };
    let (publisher, partner, ()) = try_join3(
        run_party(
            &channels[PUBLISHER],
            config(Role::Publisher),
            publisher.into(),
        ),
        run_party(&channels[PARTNER], config(Role::Partner), partner.into()),
        async {
            dealer(&channels[DEALER], PUBLISHER, PARTNER)
                .await
                .map_err(SimulationError::from)
        },
    )
    .await?;
    Ok((publisher, partner))
}
