//! Private alignment of the two parties' union maps.

use std::future::Future;

use tracing::{Level, info, instrument};

use crate::{processor::Error, shuffle::validate_union_map};

/// The protocol that privately aligns the rows of both parties.
pub trait Adapter {
    /// The error raised when the protocol fails (e.g. because of a network fault).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Turns the local union map into the intersection map shared with the peer.
    fn adapt(
        &self,
        union_map: &[i32],
    ) -> impl Future<Output = Result<Vec<i32>, Self::Error>> + Send;
}

/// Runs the adapter on a union map produced by the shuffler.
///
/// Failures of the adapter are returned unchanged as the source of [`Error::Adapter`].
#[instrument(level = Level::DEBUG, skip_all, err)]
pub async fn align(adapter: &impl Adapter, union_map: &[i32]) -> Result<Vec<i32>, Error> {
    validate_union_map(union_map)?;
    info!("Begin adapter protocol");
    adapter
        .adapt(union_map)
        .await
        .map_err(|e| Error::Adapter(Box::new(e)))
}
