//! Root chain watcher. Polls for state-sync and validator-set events on an
//! interval, forwards them in order over a bounded channel and advances the
//! persisted cursors so a restart resumes exclusively after the last
//! processed position.

use crate::client::RootChainClient;
use crate::error::BridgeResult;
use crate::metrics::BridgeMetrics;
use crate::retry_with_max_elapsed_time;
use crate::storage::BridgeOrchestratorStore;
use arbor_bridge_types::{Address, StateSyncEvent, ValidatorSetEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const ROOT_EVENTS_CHANNEL_SIZE: usize = 1000;
const QUERY_LIMIT: usize = 512;
const QUERY_RETRY_MAX_ELAPSED: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub enum RootChainUpdate {
    StateSync(Vec<StateSyncEvent>),
    ValidatorSet(Vec<ValidatorSetEvent>),
}

pub struct RootChainSyncer {
    client: Arc<dyn RootChainClient>,
    store: Arc<BridgeOrchestratorStore>,
    /// Contract whose cursor tracks the last processed state-sync id.
    state_sender: Address,
    /// Contract whose cursor tracks the last scanned block for
    /// validator-set events.
    validator_set: Address,
    start_state_sync_id: u64,
    start_block: u64,
    metrics: Arc<BridgeMetrics>,
}

impl RootChainSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn RootChainClient>,
        store: Arc<BridgeOrchestratorStore>,
        state_sender: Address,
        validator_set: Address,
        start_state_sync_id: u64,
        start_block: u64,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            client,
            store,
            state_sender,
            validator_set,
            start_state_sync_id,
            start_block,
            metrics,
        }
    }

    pub async fn run(
        self,
        query_interval: Duration,
        cancel: CancellationToken,
    ) -> BridgeResult<(Vec<JoinHandle<()>>, mpsc::Receiver<RootChainUpdate>)> {
        let (events_tx, events_rx) = mpsc::channel(ROOT_EVENTS_CHANNEL_SIZE);
        let handle = tokio::spawn(self.run_listening_task(events_tx, query_interval, cancel));
        Ok((vec![handle], events_rx))
    }

    async fn run_listening_task(
        self,
        events_tx: mpsc::Sender<RootChainUpdate>,
        query_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut event_cursor = self.start_state_sync_id;
        let mut block_cursor = self.start_block;
        info!(
            ?event_cursor,
            ?block_cursor,
            "starting root chain events listening task"
        );
        let mut interval = time::interval(query_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("root chain syncer shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            let Ok(Ok(events)) = retry_with_max_elapsed_time!(
                self.client.query_state_sync_events(event_cursor, QUERY_LIMIT),
                QUERY_RETRY_MAX_ELAPSED
            ) else {
                error!("failed to query state sync events from root chain after retry");
                continue;
            };
            if let Some(last) = events.last() {
                let len = events.len();
                // The in-memory cursor only deduplicates queries; the durable
                // cursor advances when the orchestrator delivers a commitment,
                // so a restart re-observes anything not yet committed.
                event_cursor = last.id;
                if events_tx
                    .send(RootChainUpdate::StateSync(events))
                    .await
                    .is_err()
                {
                    info!("root chain update channel closed, stopping syncer");
                    return;
                }
                info!(cursor = event_cursor, "observed {len} new state sync events");
            }

            let Ok(Ok(latest_block)) = retry_with_max_elapsed_time!(
                self.client.latest_block(),
                QUERY_RETRY_MAX_ELAPSED
            ) else {
                error!("failed to query root chain head after retry");
                continue;
            };
            self.metrics.last_synced_root_block.set(latest_block as i64);
            if latest_block <= block_cursor {
                continue;
            }

            let Ok(Ok(validator_events)) = retry_with_max_elapsed_time!(
                self.client
                    .query_validator_set_events(block_cursor + 1, latest_block),
                QUERY_RETRY_MAX_ELAPSED
            ) else {
                error!("failed to query validator set events from root chain after retry");
                continue;
            };
            block_cursor = latest_block;
            if !validator_events.is_empty()
                && events_tx
                    .send(RootChainUpdate::ValidatorSet(validator_events))
                    .await
                    .is_err()
            {
                info!("root chain update channel closed, stopping syncer");
                return;
            }
            if let Err(err) = self
                .store
                .update_root_event_cursor(self.validator_set, block_cursor)
            {
                error!("failed to persist validator set cursor: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_client::MockRootChain;
    use crate::test_utils::{test_metrics, test_store};
    use tokio::time::timeout;

    fn syncer(
        root: Arc<MockRootChain>,
        store: Arc<BridgeOrchestratorStore>,
    ) -> RootChainSyncer {
        RootChainSyncer::new(
            root,
            store,
            Address::repeat_byte(0x51),
            Address::repeat_byte(0x52),
            0,
            0,
            test_metrics(),
        )
    }

    #[tokio::test]
    async fn test_forwards_events_in_order() {
        let root = Arc::new(MockRootChain::new());
        let (_dir, store) = test_store();
        root.emit_state_sync(Address::repeat_byte(1), Address::repeat_byte(2), vec![1]);
        root.emit_state_sync(Address::repeat_byte(1), Address::repeat_byte(2), vec![2]);

        let cancel = CancellationToken::new();
        let (_handles, mut events_rx) = syncer(root.clone(), store.clone())
            .run(Duration::from_millis(20), cancel.clone())
            .await
            .unwrap();

        let update = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match update {
            RootChainUpdate::StateSync(events) => {
                assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
            }
            other => panic!("expected state sync update, got {other:?}"),
        }

        // The durable cursor is the orchestrator's to advance; the syncer
        // only tracks it in memory.
        let cursors = store
            .get_root_event_cursors(&[Address::repeat_byte(0x51)])
            .unwrap();
        assert_eq!(cursors, vec![None]);

        // New event later: only the new one is forwarded.
        root.emit_state_sync(Address::repeat_byte(1), Address::repeat_byte(2), vec![3]);
        let update = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match update {
            RootChainUpdate::StateSync(events) => {
                assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3]);
            }
            other => panic!("expected state sync update, got {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_forwards_validator_set_events() {
        let root = Arc::new(MockRootChain::new());
        let (_dir, store) = test_store();
        root.set_latest_block(5);
        root.emit_validator_event(
            3,
            ValidatorSetEvent::Staked {
                validator: Address::repeat_byte(9),
                amount: 10,
            },
        );

        let cancel = CancellationToken::new();
        let (_handles, mut events_rx) = syncer(root, store)
            .run(Duration::from_millis(20), cancel.clone())
            .await
            .unwrap();

        let update = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            update,
            RootChainUpdate::ValidatorSet(ref events) if events.len() == 1
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_stops_task() {
        let root = Arc::new(MockRootChain::new());
        let (_dir, store) = test_store();
        let cancel = CancellationToken::new();
        let (handles, _events_rx) = syncer(root, store)
            .run(Duration::from_millis(20), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        for handle in handles {
            timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        }
    }
}
