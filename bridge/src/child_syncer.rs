//! Child chain watcher. Follows the chain head, forwarding new blocks (with
//! their hashes) and the exit events they emitted, and persists the block
//! cursor after each handed-over batch.

use crate::client::ChildChainClient;
use crate::error::BridgeResult;
use crate::metrics::BridgeMetrics;
use crate::retry_with_max_elapsed_time;
use arbor_bridge_types::{ExitEvent, Hash};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CHILD_EVENTS_CHANNEL_SIZE: usize = 1000;
/// Blocks per poll, so a long catch-up cannot starve the orchestrator.
const MAX_BLOCK_CHUNK: u64 = 256;
const QUERY_RETRY_MAX_ELAPSED: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ChildChainUpdate {
    /// Newly observed blocks, ascending, with their hashes.
    pub blocks: Vec<(u64, Hash)>,
    /// Exit events emitted in those blocks, paired with the block number.
    pub exits: Vec<(u64, ExitEvent)>,
}

pub struct ChildChainSyncer {
    client: Arc<dyn ChildChainClient>,
    start_block: u64,
    metrics: Arc<BridgeMetrics>,
}

impl ChildChainSyncer {
    pub fn new(
        client: Arc<dyn ChildChainClient>,
        start_block: u64,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            client,
            start_block,
            metrics,
        }
    }

    pub async fn run(
        self,
        query_interval: Duration,
        cancel: CancellationToken,
    ) -> BridgeResult<(Vec<JoinHandle<()>>, mpsc::Receiver<ChildChainUpdate>)> {
        let (events_tx, events_rx) = mpsc::channel(CHILD_EVENTS_CHANNEL_SIZE);
        let handle = tokio::spawn(self.run_listening_task(events_tx, query_interval, cancel));
        Ok((vec![handle], events_rx))
    }

    async fn run_listening_task(
        self,
        events_tx: mpsc::Sender<ChildChainUpdate>,
        query_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut cursor = self.start_block;
        info!(cursor, "starting child chain events listening task");
        let mut interval = time::interval(query_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("child chain syncer shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            let Ok(Ok(latest)) = retry_with_max_elapsed_time!(
                self.client.latest_block(),
                QUERY_RETRY_MAX_ELAPSED
            ) else {
                error!("failed to query child chain head after retry");
                continue;
            };
            if latest <= cursor {
                continue;
            }
            let to_block = latest.min(cursor + MAX_BLOCK_CHUNK);

            let mut blocks = Vec::with_capacity((to_block - cursor) as usize);
            let mut failed = false;
            for number in cursor + 1..=to_block {
                let Ok(Ok(hash)) = retry_with_max_elapsed_time!(
                    self.client.block_hash(number),
                    QUERY_RETRY_MAX_ELAPSED
                ) else {
                    error!(number, "failed to query child block hash after retry");
                    failed = true;
                    break;
                };
                blocks.push((number, hash));
            }
            if failed {
                continue;
            }

            let Ok(Ok(exits)) = retry_with_max_elapsed_time!(
                self.client.query_exit_events(cursor + 1, to_block),
                QUERY_RETRY_MAX_ELAPSED
            ) else {
                error!("failed to query exit events after retry");
                continue;
            };

            let len = blocks.len();
            if events_tx
                .send(ChildChainUpdate { blocks, exits })
                .await
                .is_err()
            {
                info!("child chain update channel closed, stopping syncer");
                return;
            }
            // The durable cursor advances when the orchestrator seals an
            // epoch, so a restart re-observes the partially collected one.
            cursor = to_block;
            self.metrics.last_synced_child_block.set(cursor as i64);
            info!(cursor, "observed {len} new child blocks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_client::MockChildChain;
    use crate::test_utils::test_metrics;
    use arbor_bridge_types::Address;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_forwards_blocks_and_exits() {
        let child = Arc::new(MockChildChain::new());
        child.advance_to_block(3);
        child.emit_exit_event(2, Address::repeat_byte(1), Address::repeat_byte(2), vec![7]);

        let cancel = CancellationToken::new();
        let (_handles, mut events_rx) =
            ChildChainSyncer::new(child.clone(), 0, test_metrics())
                .run(Duration::from_millis(20), cancel.clone())
                .await
                .unwrap();

        let update = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            update.blocks.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(update.exits.len(), 1);
        assert_eq!(update.exits[0].0, 2);

        // Head advances: only the new blocks are forwarded.
        child.advance_to_block(5);
        let update = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            update.blocks.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![4, 5]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_long_catchup_is_chunked() {
        let child = Arc::new(MockChildChain::new());
        child.advance_to_block(MAX_BLOCK_CHUNK + 10);

        let cancel = CancellationToken::new();
        let (_handles, mut events_rx) =
            ChildChainSyncer::new(child, 0, test_metrics())
                .run(Duration::from_millis(10), cancel.clone())
                .await
                .unwrap();

        let first = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.blocks.len(), MAX_BLOCK_CHUNK as usize);
        let second = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.blocks.len(), 10);
        cancel.cancel();
    }
}
