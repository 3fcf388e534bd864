//! Restricts both parties' rows to the intersection and secret-shares them.

use std::future::Future;

use tracing::{Level, info, instrument};

use crate::{
    codec::row_width,
    config::{Config, Role},
    processor::Error,
    shares::{SecretByteMatrix, SecretInt},
    shuffle::DUMMY,
};

/// The protocol that converts plaintext rows into secret shares restricted to the
/// intersection.
pub trait DataProcessor {
    /// The error raised when the protocol fails (e.g. because of a network fault).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Secret-shares a row count owned by `owner`.
    ///
    /// The owner passes `Some(count)`, the other party passes `None`; both receive their
    /// share of the count.
    fn share_row_count(
        &self,
        owner: Role,
        count: Option<u32>,
    ) -> impl Future<Output = Result<SecretInt<u32>, Self::Error>> + Send;

    /// Turns the local rows into shares of the rows selected by the peer's intersection map.
    fn process_my_data(
        &self,
        rows: &[Vec<u8>],
        output_size: usize,
    ) -> impl Future<Output = Result<SecretByteMatrix, Self::Error>> + Send;

    /// Obtains shares of the peer's rows selected by `intersection_map` without seeing them.
    fn process_peers_data(
        &self,
        peer_row_count: &SecretInt<u32>,
        intersection_map: &[i32],
        peer_row_width: usize,
    ) -> impl Future<Output = Result<SecretByteMatrix, Self::Error>> + Send;
}

/// Number of rows in the intersection, i.e. the entries of `intersection_map` that are set.
pub fn expected_intersection_size(intersection_map: &[i32]) -> usize {
    intersection_map.iter().filter(|i| **i != DUMMY).count()
}

fn failed<E: std::error::Error + Send + Sync + 'static>(
    step: &'static str,
) -> impl FnOnce(E) -> Error {
    move |e| Error::DataProcessor {
        step,
        source: Box::new(e),
    }
}

/// Exchanges row counts and secret-shares both parties' rows.
///
/// Returns the shares of the publisher rows and of the partner rows (in this order), both
/// restricted to the intersection. Fails if either batch does not have exactly one row per
/// set entry of the intersection map. The check only compares counts, rows that were
/// consistently mismatched by the adapter are not detected.
#[instrument(level = Level::DEBUG, skip_all, fields(role = %config.role), err)]
pub async fn compact<D: DataProcessor>(
    data_processor: &D,
    config: &Config,
    intersection_map: &[i32],
    rows: &[Vec<u8>],
) -> Result<(SecretByteMatrix, SecretByteMatrix), Error> {
    info!("Beginning oblivious data intersection step");
    let role = config.role;
    let my_rows = u32::try_from(rows.len()).map_err(|_| Error::TooManyRows(rows.len()))?;
    let own = |owner: Role| (owner == role).then_some(my_rows);

    let publisher_rows = data_processor
        .share_row_count(Role::Publisher, own(Role::Publisher))
        .await
        .map_err(failed("sharing the publisher row count"))?;
    let partner_rows = data_processor
        .share_row_count(Role::Partner, own(Role::Partner))
        .await
        .map_err(failed("sharing the partner row count"))?;

    let publisher_width = row_width(Role::Publisher, config.num_conversions_per_user);
    let partner_width = row_width(Role::Partner, config.num_conversions_per_user);
    info!("Local row count: {my_rows}");
    info!("Publisher row size in bytes: {publisher_width}");
    info!("Partner row size in bytes: {partner_width}");

    let (publisher_shares, partner_shares) = match role {
        Role::Publisher => {
            info!("Begin processing my data (publisher)");
            let publisher_shares = data_processor
                .process_my_data(rows, intersection_map.len())
                .await
                .map_err(failed("processing the publisher rows"))?;
            info!("Begin processing peers data (partner)");
            let partner_shares = data_processor
                .process_peers_data(&partner_rows, intersection_map, partner_width)
                .await
                .map_err(failed("processing the partner rows"))?;
            (publisher_shares, partner_shares)
        }
        Role::Partner => {
            info!("Begin processing peers data (publisher)");
            let publisher_shares = data_processor
                .process_peers_data(&publisher_rows, intersection_map, publisher_width)
                .await
                .map_err(failed("processing the publisher rows"))?;
            info!("Begin processing my data (partner)");
            let partner_shares = data_processor
                .process_my_data(rows, intersection_map.len())
                .await
                .map_err(failed("processing the partner rows"))?;
            (publisher_shares, partner_shares)
        }
    };

    let expected = expected_intersection_size(intersection_map);
    for (party, shares) in [
        (Role::Publisher, &publisher_shares),
        (Role::Partner, &partner_shares),
    ] {
        if shares.batch_size() != expected {
            return Err(Error::RowCountMismatch {
                rows: party,
                expected,
                actual: shares.batch_size(),
            });
        }
    }
    info!("{expected} rows in intersection after running data processor");

    Ok((publisher_shares, partner_shares))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use thiserror::Error;

    use super::*;
    use crate::transpose::BitMatrix;

    #[derive(Debug, Error)]
    #[error("peer disconnected")]
    struct Disconnected;

    /// Returns zero shares of fixed batch sizes and records the calls it receives.
    struct Recording {
        batch_sizes: (usize, usize),
        calls: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(publisher: usize, partner: usize) -> Self {
            Self {
                batch_sizes: (publisher, partner),
                calls: Mutex::new(vec![]),
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl DataProcessor for Recording {
        type Error = Disconnected;

        async fn share_row_count(
            &self,
            owner: Role,
            count: Option<u32>,
        ) -> Result<SecretInt<u32>, Disconnected> {
            self.record(format!("count {owner} {count:?}"));
            Ok(SecretInt(count.unwrap_or(0)))
        }

        async fn process_my_data(
            &self,
            rows: &[Vec<u8>],
            output_size: usize,
        ) -> Result<SecretByteMatrix, Disconnected> {
            self.record(format!("mine {} {output_size}", rows.len()));
            let width = rows.first().map_or(0, Vec::len);
            let batch = if width == 5 {
                self.batch_sizes.0
            } else {
                self.batch_sizes.1
            };
            Ok(SecretByteMatrix::from_bit_slices(BitMatrix::zeros(8 * width, batch)))
        }

        async fn process_peers_data(
            &self,
            peer_row_count: &SecretInt<u32>,
            intersection_map: &[i32],
            peer_row_width: usize,
        ) -> Result<SecretByteMatrix, Disconnected> {
            self.record(format!(
                "peers {} {} {peer_row_width}",
                peer_row_count.0,
                intersection_map.len()
            ));
            let batch = if peer_row_width == 5 {
                self.batch_sizes.0
            } else {
                self.batch_sizes.1
            };
            Ok(SecretByteMatrix::from_bit_slices(BitMatrix::zeros(
                8 * peer_row_width,
                batch,
            )))
        }
    }

    struct Broken;

    impl DataProcessor for Broken {
        type Error = Disconnected;

        async fn share_row_count(
            &self,
            _: Role,
            _: Option<u32>,
        ) -> Result<SecretInt<u32>, Disconnected> {
            Ok(SecretInt(0))
        }

        async fn process_my_data(
            &self,
            _: &[Vec<u8>],
            _: usize,
        ) -> Result<SecretByteMatrix, Disconnected> {
            Err(Disconnected)
        }

        async fn process_peers_data(
            &self,
            _: &SecretInt<u32>,
            _: &[i32],
            _: usize,
        ) -> Result<SecretByteMatrix, Disconnected> {
            Err(Disconnected)
        }
    }

    fn config(role: Role) -> Config {
        Config::new(role, 2, 10).unwrap()
    }

    #[test]
    fn counts_set_entries() {
        assert_eq!(expected_intersection_size(&[-1, 0, 3, -1, 1]), 3);
        assert_eq!(expected_intersection_size(&[]), 0);
    }

    #[tokio::test]
    async fn publisher_call_order() {
        let processor = Recording::new(2, 2);
        let rows = vec![vec![0; 5]; 3];
        let (publisher, partner) =
            compact(&processor, &config(Role::Publisher), &[0, -1, 1], &rows)
                .await
                .unwrap();
        assert_eq!((publisher.batch_size(), partner.batch_size()), (2, 2));
        assert_eq!(partner.row_bits(), 8 * 45);
        assert_eq!(
            *processor.calls.lock().unwrap(),
            vec![
                "count publisher Some(3)",
                "count partner None",
                "mine 3 3",
                "peers 0 3 45",
            ]
        );
    }

    #[tokio::test]
    async fn partner_call_order() {
        let processor = Recording::new(1, 1);
        let rows = vec![vec![0; 45]; 2];
        compact(&processor, &config(Role::Partner), &[-1, -1, 0], &rows)
            .await
            .unwrap();
        assert_eq!(
            *processor.calls.lock().unwrap(),
            vec![
                "count publisher None",
                "count partner Some(2)",
                "peers 0 3 5",
                "mine 2 3",
            ]
        );
    }

    #[tokio::test]
    async fn row_count_mismatch_is_fatal() {
        let rows = vec![vec![0; 5]; 3];
        let err = compact(&Recording::new(2, 1), &config(Role::Publisher), &[0, 1, -1], &rows)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RowCountMismatch {
                rows: Role::Partner,
                expected: 2,
                actual: 1
            }
        ));
        assert_eq!(
            err.to_string(),
            "partner rows do not match up expected intersection size. Expected 2 but got 1 rows."
        );

        let err = compact(&Recording::new(3, 2), &config(Role::Publisher), &[0, 1, -1], &rows)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RowCountMismatch {
                rows: Role::Publisher,
                expected: 2,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn processor_failure_is_propagated() {
        let err = compact(&Broken, &config(Role::Partner), &[0], &[vec![0; 45]])
            .await
            .unwrap_err();
        let Error::DataProcessor { step, source } = err else {
            panic!("expected a data processor failure");
        };
        assert_eq!(step, "processing the publisher rows");
        assert!(source.downcast_ref::<Disconnected>().is_some());
    }
}
