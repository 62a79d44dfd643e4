//! Prometheus metrics for the bridge node.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    pub(crate) last_synced_root_block: IntGauge,
    pub(crate) last_synced_child_block: IntGauge,
    pub(crate) observed_state_sync_events: IntCounter,
    pub(crate) buffered_state_sync_events: IntGauge,
    pub(crate) built_commitments: IntCounter,
    pub(crate) delivered_commitments: IntCounter,
    pub(crate) executed_state_syncs: IntCounter,
    pub(crate) skipped_state_sync_replays: IntCounter,
    pub(crate) observed_exit_events: IntCounter,
    pub(crate) served_exit_proofs: IntCounter,
    pub(crate) processed_exits: IntCounter,
    pub(crate) rejected_exit_replays: IntCounter,
    pub(crate) sealed_checkpoints: IntCounter,
    pub(crate) submitted_checkpoints: IntCounter,
    pub(crate) checkpoint_resubmissions: IntCounter,
    pub(crate) last_finalized_epoch: IntGauge,
    pub(crate) current_voting_rights: IntGaugeVec,
    pub(crate) signature_requests: IntCounterVec,
    pub(crate) errors: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            last_synced_root_block: register_int_gauge_with_registry!(
                "bridge_last_synced_root_block",
                "Latest root chain block the syncer has fully processed",
                registry,
            )
            .unwrap(),
            last_synced_child_block: register_int_gauge_with_registry!(
                "bridge_last_synced_child_block",
                "Latest child chain block the syncer has fully processed",
                registry,
            )
            .unwrap(),
            observed_state_sync_events: register_int_counter_with_registry!(
                "bridge_observed_state_sync_events",
                "State sync events observed on the root chain",
                registry,
            )
            .unwrap(),
            buffered_state_sync_events: register_int_gauge_with_registry!(
                "bridge_buffered_state_sync_events",
                "State sync events buffered while waiting for in-order release",
                registry,
            )
            .unwrap(),
            built_commitments: register_int_counter_with_registry!(
                "bridge_built_commitments",
                "Commitments assembled with a signature quorum",
                registry,
            )
            .unwrap(),
            delivered_commitments: register_int_counter_with_registry!(
                "bridge_delivered_commitments",
                "Commitments delivered to the child chain",
                registry,
            )
            .unwrap(),
            executed_state_syncs: register_int_counter_with_registry!(
                "bridge_executed_state_syncs",
                "State sync events executed on the child chain",
                registry,
            )
            .unwrap(),
            skipped_state_sync_replays: register_int_counter_with_registry!(
                "bridge_skipped_state_sync_replays",
                "Execute calls skipped as idempotent replays",
                registry,
            )
            .unwrap(),
            observed_exit_events: register_int_counter_with_registry!(
                "bridge_observed_exit_events",
                "Exit events observed on the child chain",
                registry,
            )
            .unwrap(),
            served_exit_proofs: register_int_counter_with_registry!(
                "bridge_served_exit_proofs",
                "Exit membership proofs served",
                registry,
            )
            .unwrap(),
            processed_exits: register_int_counter_with_registry!(
                "bridge_processed_exits",
                "Exits settled on the root chain",
                registry,
            )
            .unwrap(),
            rejected_exit_replays: register_int_counter_with_registry!(
                "bridge_rejected_exit_replays",
                "Exit calls rejected as replays",
                registry,
            )
            .unwrap(),
            sealed_checkpoints: register_int_counter_with_registry!(
                "bridge_sealed_checkpoints",
                "Checkpoints sealed and handed to signature collection",
                registry,
            )
            .unwrap(),
            submitted_checkpoints: register_int_counter_with_registry!(
                "bridge_submitted_checkpoints",
                "Checkpoint transactions submitted to the root chain",
                registry,
            )
            .unwrap(),
            checkpoint_resubmissions: register_int_counter_with_registry!(
                "bridge_checkpoint_resubmissions",
                "Checkpoint submissions retried after failure or reorg",
                registry,
            )
            .unwrap(),
            last_finalized_epoch: register_int_gauge_with_registry!(
                "bridge_last_finalized_epoch",
                "Highest epoch with a finalized checkpoint",
                registry,
            )
            .unwrap(),
            current_voting_rights: register_int_gauge_vec_with_registry!(
                "bridge_current_voting_rights",
                "Voting power per validator in the current epoch",
                &["validator"],
                registry,
            )
            .unwrap(),
            signature_requests: register_int_counter_vec_with_registry!(
                "bridge_signature_requests",
                "Signature requests by payload kind and outcome",
                &["kind", "outcome"],
                registry,
            )
            .unwrap(),
            errors: register_int_counter_vec_with_registry!(
                "bridge_errors",
                "Errors by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_cleanly() {
        let registry = Registry::new();
        let metrics = BridgeMetrics::new(&registry);
        metrics.observed_state_sync_events.inc();
        metrics
            .current_voting_rights
            .with_label_values(&["0xabc"])
            .set(70);
        assert!(!registry.gather().is_empty());
    }
}
