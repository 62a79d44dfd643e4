//! The arbor bridge node: relays root-chain events into the child chain as
//! quorum-signed state-sync commitments, checkpoints child-chain progress back
//! to the root chain, and settles exits against finalized checkpoints.

pub mod abi;
pub mod aggregator;
pub mod checkpoint;
pub mod child_syncer;
pub mod client;
pub mod commitment;
pub mod config;
pub mod error;
pub mod exit;
pub mod handler;
pub mod metrics;
pub mod mock_client;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod root_syncer;
pub mod state_receiver;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

/// Retries an async expression with exponential backoff until it succeeds or
/// `max_elapsed_time` passes. Success is `Ok(Ok(value))`, so callers can
/// pattern-match the double layer:
///
/// ```ignore
/// let Ok(Ok(events)) = retry_with_max_elapsed_time!(
///     client.query_events(cursor),
///     Duration::from_secs(120)
/// ) else {
///     tracing::error!("query still failing after retries");
///     continue;
/// };
/// ```
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: $max_elapsed_time / 4,
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || async {
            match $func.await {
                Ok(value) => Ok(Ok(value)),
                Err(err) => {
                    tracing::debug!("retrying upon error: {err:?}");
                    Err(backoff::Error::transient(err))
                }
            }
        })
        .await
    }};
}
