//! Collects validator signatures over a commitment or checkpoint digest
//! until the epoch's quorum is met. Responses are folded as they arrive;
//! signatures that do not recover to the queried validator are discarded.
//! Collection never throws away progress: the outcome always carries every
//! valid signature gathered so far, quorum or not, so the caller can persist
//! partials and re-offer them after a restart.

use crate::client::{SigningRequest, ValidatorClient};
use crate::metrics::BridgeMetrics;
use arbor_bridge_types::crypto::recover_signer;
use arbor_bridge_types::{Address, Epoch};
use ethers::types::Signature;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct AggregationOutcome {
    pub signatures: BTreeMap<Address, Signature>,
    pub quorum_met: bool,
}

pub struct SignatureAggregator {
    clients: BTreeMap<Address, Arc<dyn ValidatorClient>>,
    metrics: Arc<BridgeMetrics>,
}

impl SignatureAggregator {
    pub fn new(
        clients: BTreeMap<Address, Arc<dyn ValidatorClient>>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self { clients, metrics }
    }

    /// Requests signatures from every validator in `epoch` that has not
    /// already signed, folding responses until quorum, timeout, exhaustion or
    /// cancellation — whichever comes first.
    pub async fn collect(
        &self,
        epoch: &Epoch,
        request: SigningRequest,
        prior: BTreeMap<Address, Signature>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> AggregationOutcome {
        let digest = request.digest();
        let kind = request.kind();
        let mut signatures = prior;

        if epoch.quorum_met(signatures.keys()) {
            return AggregationOutcome {
                signatures,
                quorum_met: true,
            };
        }

        let mut requests: FuturesUnordered<_> = epoch
            .validators
            .iter()
            .filter(|v| v.active && !signatures.contains_key(&v.address))
            .filter_map(|v| {
                let client = self.clients.get(&v.address)?.clone();
                let request = request.clone();
                let address = v.address;
                Some(async move { (address, client.request_signature(request).await) })
            })
            .collect();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let (address, result) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(kind, "signature collection cancelled");
                    break;
                }
                _ = &mut deadline => {
                    warn!(kind, "signature collection timed out");
                    break;
                }
                response = requests.next() => match response {
                    Some(pair) => pair,
                    None => break,
                },
            };

            match result {
                Ok(signature) => match recover_signer(digest, &signature) {
                    Ok(recovered) if recovered == address => {
                        self.metrics
                            .signature_requests
                            .with_label_values(&[kind, "ok"])
                            .inc();
                        signatures.insert(address, signature);
                        if epoch.quorum_met(signatures.keys()) {
                            return AggregationOutcome {
                                signatures,
                                quorum_met: true,
                            };
                        }
                    }
                    _ => {
                        self.metrics
                            .signature_requests
                            .with_label_values(&[kind, "bad_signature"])
                            .inc();
                        warn!(kind, validator = ?address, "discarding signature that does not recover to validator");
                    }
                },
                Err(err) => {
                    self.metrics
                        .signature_requests
                        .with_label_values(&[kind, "error"])
                        .inc();
                    warn!(kind, validator = ?address, "signature request failed: {err}");
                }
            }
        }

        let quorum_met = epoch.quorum_met(signatures.keys());
        AggregationOutcome {
            signatures,
            quorum_met,
        }
    }
}
