//! Node startup: opens storage, restores cursors, wires the registry,
//! receivers, checkpoint manager, aggregator and syncers together and hands
//! back the running orchestrator with its task handles.

use crate::aggregator::SignatureAggregator;
use crate::checkpoint::CheckpointManager;
use crate::child_syncer::ChildChainSyncer;
use crate::client::{ChildChainClient, RootChainClient, ValidatorClient};
use crate::commitment::CommitmentBuilder;
use crate::config::BridgeNodeConfig;
use crate::exit::{ExitProofIndex, ExitSettlement};
use crate::handler::{LocalValidatorClient, SigningRequestHandler};
use crate::metrics::BridgeMetrics;
use crate::orchestrator::{BridgeOrchestrator, OrchestratorParams};
use crate::registry::ValidatorRegistry;
use crate::root_syncer::RootChainSyncer;
use crate::state_receiver::StateReceiver;
use crate::storage::BridgeOrchestratorStore;
use arbor_bridge_types::Address;
use arc_swap::ArcSwap;
use ethers::signers::Signer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Transport-level access to both chains and the remote validators. The
/// node's own validator endpoint is wired in-process automatically.
pub struct BridgeChainHandles {
    pub root: Arc<dyn RootChainClient>,
    pub child: Arc<dyn ChildChainClient>,
    pub validators: BTreeMap<Address, Arc<dyn ValidatorClient>>,
}

pub struct BridgeNodeHandle {
    pub orchestrator: Arc<BridgeOrchestrator>,
    /// Signing responder peers reach this node through.
    pub handler: Arc<SigningRequestHandler>,
    pub task_handles: Vec<JoinHandle<()>>,
    pub cancel: CancellationToken,
}

/// Start block for the root validator-set scan:
/// override > stored cursor > fallback. The returned value is the last
/// block considered processed; scanning resumes after it.
fn get_root_start_block(
    store: &BridgeOrchestratorStore,
    contract: Address,
    start_block_override: Option<u64>,
    start_block_fallback: u64,
) -> u64 {
    let stored = store
        .get_root_event_cursors(&[contract])
        .ok()
        .and_then(|mut cursors| cursors.pop().flatten());
    match (start_block_override, stored) {
        (Some(overridden), stored) => {
            info!(
                contract = ?contract,
                overridden,
                ?stored,
                "overriding root chain scan cursor"
            );
            overridden.saturating_sub(1)
        }
        (None, Some(stored)) => stored,
        (None, None) => start_block_fallback.saturating_sub(1),
    }
}

/// Last state-sync id already delivered to the child chain; observation
/// resumes after it so undelivered events are re-observed.
fn get_state_sync_start_id(store: &BridgeOrchestratorStore, contract: Address) -> u64 {
    store
        .get_root_event_cursors(&[contract])
        .ok()
        .and_then(|mut cursors| cursors.pop().flatten())
        .unwrap_or(0)
}

pub async fn run_bridge_node(
    config: BridgeNodeConfig,
    chains: BridgeChainHandles,
    prometheus_registry: &prometheus::Registry,
) -> anyhow::Result<BridgeNodeHandle> {
    config.validate()?;
    let metrics = Arc::new(BridgeMetrics::new(prometheus_registry));
    let authority_key = config.load_authority_key()?;
    let authority_address = authority_key.address();
    info!(?authority_address, "starting bridge node");

    let store = Arc::new(BridgeOrchestratorStore::new(&config.db_path.join("client"))?);
    let registry = Arc::new(ValidatorRegistry::new(config.genesis_epoch(), metrics.clone()));
    let exit_index = Arc::new(ExitProofIndex::new());
    let receiver = Arc::new(StateReceiver::new(store.clone(), metrics.clone())?);
    let settlement = Arc::new(ExitSettlement::new(store.clone(), metrics.clone()));
    let checkpoints = Arc::new(CheckpointManager::new(
        store.clone(),
        exit_index.clone(),
        metrics.clone(),
    )?);

    // This node answers signing requests like any other validator; its own
    // endpoint short-circuits in process.
    let handler = Arc::new(SigningRequestHandler::new(
        authority_key,
        chains.root.clone(),
        chains.child.clone(),
        metrics.clone(),
    ));
    let mut validators = chains.validators;
    validators
        .entry(authority_address)
        .or_insert_with(|| Arc::new(LocalValidatorClient::new(handler.clone())));
    let aggregator = Arc::new(ArcSwap::from(Arc::new(SignatureAggregator::new(
        validators,
        metrics.clone(),
    ))));

    let cancel = CancellationToken::new();
    let mut all_handles = vec![];

    let state_sync_start =
        get_state_sync_start_id(&store, config.root_chain.state_sender_address);
    let root_block_start = get_root_start_block(
        &store,
        config.root_chain.validator_set_address,
        config.root_chain.start_block_override,
        config.root_chain.start_block_fallback,
    );
    let (handles, root_events_rx) = RootChainSyncer::new(
        chains.root.clone(),
        store.clone(),
        config.root_chain.state_sender_address,
        config.root_chain.validator_set_address,
        state_sync_start,
        root_block_start,
        metrics.clone(),
    )
    .run(config.root_query_interval(), cancel.child_token())
    .await?;
    all_handles.extend(handles);

    let child_block_start = store.get_child_event_cursor()?.unwrap_or(0);
    let (handles, child_events_rx) = ChildChainSyncer::new(
        chains.child.clone(),
        child_block_start,
        metrics.clone(),
    )
    .run(config.child_query_interval(), cancel.child_token())
    .await?;
    all_handles.extend(handles);

    let builder = CommitmentBuilder::new(
        state_sync_start + 1,
        config.commitment.batch_size,
        config.commitment_max_wait(),
        metrics.clone(),
    );
    let params = OrchestratorParams {
        state_sender_address: config.root_chain.state_sender_address,
        state_receiver_address: config.child_chain.state_receiver_address,
        child_erc20_predicate_address: config.child_chain.erc20_predicate_address,
        checkpoint_manager_address: config.root_chain.checkpoint_manager_address,
        exit_helper_address: config.root_chain.exit_helper_address,
        root_erc20_predicate_address: config.root_chain.erc20_predicate_address,
        validator_set_address: config.root_chain.validator_set_address,
        epoch_length: config.child_chain.epoch_length,
        signing_timeout: config.signing_timeout(),
        submission_retry: config.submission_retry(),
        gap_alert_after: config.checkpoint.gap_alert_after,
    };
    let orchestrator = Arc::new(BridgeOrchestrator::new(
        registry,
        receiver,
        exit_index,
        settlement,
        checkpoints,
        aggregator,
        chains.root,
        chains.child,
        store,
        builder,
        params,
        authority_address,
        metrics,
        cancel.clone(),
    ));
    all_handles.extend(orchestrator.clone().run(root_events_rx, child_events_rx).await);

    Ok(BridgeNodeHandle {
        orchestrator,
        handler,
        task_handles: all_handles,
        cancel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_store;

    #[test]
    fn test_get_root_start_block_precedence() {
        let (_dir, store) = test_store();
        let contract = Address::repeat_byte(0x52);

        // No override, no stored cursor: fallback.
        assert_eq!(get_root_start_block(&store, contract, None, 10), 9);

        // Stored cursor wins over fallback.
        store.update_root_event_cursor(contract, 100).unwrap();
        assert_eq!(get_root_start_block(&store, contract, None, 10), 100);

        // Override wins over everything.
        assert_eq!(get_root_start_block(&store, contract, Some(420), 10), 419);
    }

    #[test]
    fn test_get_state_sync_start_id() {
        let (_dir, store) = test_store();
        let contract = Address::repeat_byte(0x51);
        assert_eq!(get_state_sync_start_id(&store, contract), 0);
        store.update_root_event_cursor(contract, 37).unwrap();
        assert_eq!(get_state_sync_start_id(&store, contract), 37);
    }

    #[tokio::test]
    async fn test_run_bridge_node_starts_and_shuts_down() {
        use crate::mock_client::{MockChildChain, MockRootChain};
        use crate::config::{
            ChildChainConfig, CommitmentConfig, GenesisValidator, RootChainConfig,
        };
        use crate::test_utils::test_keys;

        let dir = tempfile::tempdir().unwrap();
        let key = test_keys(1).remove(0);
        let key_path = dir.path().join("authority.key");
        std::fs::write(
            &key_path,
            hex::encode(key.signer().to_bytes()),
        )
        .unwrap();

        let config = BridgeNodeConfig {
            db_path: dir.path().join("db"),
            authority_key_path: key_path,
            root_chain: RootChainConfig {
                state_sender_address: Address::repeat_byte(0x51),
                validator_set_address: Address::repeat_byte(0x52),
                checkpoint_manager_address: Address::repeat_byte(0x53),
                exit_helper_address: Address::repeat_byte(0x54),
                erc20_predicate_address: Address::repeat_byte(0x55),
                query_interval_ms: 20,
                start_block_fallback: 1,
                start_block_override: None,
            },
            child_chain: ChildChainConfig {
                state_receiver_address: Address::repeat_byte(0x61),
                erc20_predicate_address: Address::repeat_byte(0x62),
                query_interval_ms: 20,
                epoch_length: 5,
            },
            commitment: CommitmentConfig {
                batch_size: 2,
                max_wait_ms: 50,
            },
            checkpoint: Default::default(),
            genesis_validators: vec![GenesisValidator {
                address: key.address(),
                voting_power: 100,
                public_key: vec![],
            }],
        };

        let root = Arc::new(MockRootChain::new());
        let child = Arc::new(MockChildChain::new());
        let handles = BridgeChainHandles {
            root: root.clone(),
            child: child.clone(),
            validators: BTreeMap::new(),
        };
        let registry = prometheus::Registry::new();
        let node = run_bridge_node(config, handles, &registry).await.unwrap();

        // Deposit flows through the pipeline into a child-chain commitment.
        node.orchestrator
            .deposit(Address::repeat_byte(9), 100u64.into())
            .await
            .unwrap();
        node.orchestrator
            .deposit(Address::repeat_byte(9), 200u64.into())
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                if node.orchestrator.receiver().last_registered_end() >= 2 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("commitment should be delivered");

        node.cancel.cancel();
        node.orchestrator.flush_on_shutdown().await;
        for handle in node.task_handles {
            tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
