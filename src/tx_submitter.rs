// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Fulfillment transaction submission.
//!
//! The submitter owns the account nonce: it is initialized from the
//! chain's pending transaction count at startup and only ever mutated
//! under the submitter's lock, so any number of in-flight fulfillments
//! from one account broadcast with distinct, strictly increasing nonces.
//!
//! RSK nodes report nonce races and stuck transactions only through error
//! message text, so detection is a substring classifier kept in one
//! place. On a classified error the submitter resynchronizes the nonce
//! from the chain and retries the submission, once per occurrence, with
//! no overall bound; each resync converges on the chain's authoritative
//! count.
use std::sync::Arc;

use ethers::providers::{
    JsonRpcClient, Middleware, Provider, ProviderError,
};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, TransactionRequest, H256, U256, U64,
};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::chainlink::{JobService, RunUpdate};
use crate::error::Error;
use crate::store::CredentialStore;

/// Gas limit for fulfillment transactions.
pub const FULFILLMENT_GAS_LIMIT: u64 = 500_000;

/// Error message fragments the node uses to report a nonce race or a
/// transaction stuck long enough to be presumed replaced.
const NONCE_CONFLICT_PATTERNS: [&str; 3] =
    ["nonce too high", "nonce too low", "not mined within"];

/// Whether a node error message reports a recoverable nonce conflict.
pub fn is_nonce_conflict(message: &str) -> bool {
    NONCE_CONFLICT_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Scales a gas price by 1.3x, truncated to an integer.
fn scaled_gas_price(current: U256) -> U256 {
    current * 13u64 / 10u64
}

fn classify_provider_error(error: ProviderError) -> Error {
    let message = error.to_string();
    if is_nonce_conflict(&message) {
        Error::NonceConflict(message)
    } else {
        Error::EthersProvider(error)
    }
}

/// A fulfillment handed back by the Chainlink node.
///
/// The selector and data prefix are present only when the request came
/// through this bridge; a generic external request carries just the
/// result, and both default to empty bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentEnvelope {
    /// The oracle contract to call.
    pub address: Address,
    /// Selector of the fulfillment entry point.
    #[serde(default)]
    pub function_selector: Option<Bytes>,
    /// ABI-encoded request metadata to place between the selector and
    /// the result.
    #[serde(default)]
    pub data_prefix: Option<Bytes>,
    /// The computed result to deliver.
    pub result: Bytes,
}

impl FulfillmentEnvelope {
    /// The full transaction payload: selector, then prefix, then result.
    pub fn calldata(&self) -> Bytes {
        let mut data = Vec::new();
        if let Some(selector) = &self.function_selector {
            data.extend_from_slice(selector);
        }
        if let Some(prefix) = &self.data_prefix {
            data.extend_from_slice(prefix);
        }
        data.extend_from_slice(&self.result);
        data.into()
    }
}

/// Builds, signs and broadcasts fulfillment transactions for one account.
pub struct TransactionSubmitter<P: JsonRpcClient> {
    client: Arc<Provider<P>>,
    wallet: LocalWallet,
    chain_id: u64,
    nonce: Mutex<U256>,
}

impl<P: JsonRpcClient + 'static> TransactionSubmitter<P> {
    /// Creates a submitter for the wallet's account, seeding the local
    /// nonce from the chain's pending transaction count.
    pub async fn new(
        client: Arc<Provider<P>>,
        wallet: LocalWallet,
    ) -> crate::Result<Self> {
        let chain_id = client.get_chainid().await?.as_u64();
        let wallet = wallet.with_chain_id(chain_id);
        let nonce = client
            .get_transaction_count(
                wallet.address(),
                Some(BlockNumber::Pending.into()),
            )
            .await?;
        tracing::info!(
            address = %wallet.address(),
            %nonce,
            %chain_id,
            "Transaction submitter ready",
        );
        Ok(Self {
            client,
            wallet,
            chain_id,
            nonce: Mutex::new(nonce),
        })
    }

    /// The submitting account address.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Broadcasts one fulfillment and waits for its receipt.
    ///
    /// Nonce conflicts are absorbed here: the local nonce is overwritten
    /// from the chain and the submission is retried. Any other failure is
    /// terminal for this submission.
    pub async fn submit(
        &self,
        envelope: &FulfillmentEnvelope,
    ) -> crate::Result<H256> {
        let calldata = envelope.calldata();
        loop {
            match self.broadcast_once(envelope.address, &calldata).await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(Error::NonceConflict(message)) => {
                    tracing::warn!(
                        "There was a nonce mismatch ({}), correcting it \
                         and trying again ...",
                        message,
                    );
                    self.resync_nonce().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reserves the next nonce. The lock is held only for the
    /// read-and-increment, never across network calls.
    async fn reserve_nonce(&self) -> U256 {
        let mut nonce = self.nonce.lock().await;
        let reserved = *nonce;
        *nonce += U256::one();
        reserved
    }

    /// Overwrites the local nonce with the chain's pending count. A stale
    /// local value is never reused after a conflict.
    async fn resync_nonce(&self) -> crate::Result<()> {
        let pending = self
            .client
            .get_transaction_count(
                self.wallet.address(),
                Some(BlockNumber::Pending.into()),
            )
            .await?;
        let mut nonce = self.nonce.lock().await;
        *nonce = pending;
        tracing::debug!(nonce = %pending, "Resynced account nonce");
        Ok(())
    }

    async fn broadcast_once(
        &self,
        to: Address,
        calldata: &Bytes,
    ) -> crate::Result<H256> {
        let gas_price =
            scaled_gas_price(self.client.get_gas_price().await?);
        let nonce = self.reserve_nonce().await;
        let tx: TypedTransaction = TransactionRequest::new()
            .to(to)
            .gas(FULFILLMENT_GAS_LIMIT)
            .gas_price(gas_price)
            .nonce(nonce)
            .data(calldata.clone())
            .chain_id(self.chain_id)
            .into();
        let signature = self.wallet.sign_transaction(&tx).await?;
        let raw = tx.rlp_signed(&signature);
        let pending_tx = self
            .client
            .send_raw_transaction(raw)
            .await
            .map_err(classify_provider_error)?;
        let tx_hash = *pending_tx;
        tracing::info!(%tx_hash, "Transaction is in the TX Pool");
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::Fulfillment,
            %tx_hash,
            pending = true,
        );
        let receipt =
            pending_tx.await.map_err(classify_provider_error)?;
        match receipt {
            Some(receipt) => {
                // a mined transaction only counts as fulfilled when the
                // node reports success AND the oracle emitted logs; RSK
                // can mine silently reverted calls with a success flag.
                if receipt.status == Some(U64::one())
                    && !receipt.logs.is_empty()
                {
                    tracing::info!(
                        tx_hash = %receipt.transaction_hash,
                        "Fulfill Request TX has been mined",
                    );
                    tracing::event!(
                        target: crate::probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %crate::probe::Kind::Fulfillment,
                        tx_hash = %receipt.transaction_hash,
                        finalized = true,
                    );
                    Ok(receipt.transaction_hash)
                } else {
                    Err(Error::ReceiptRejected {
                        receipt: Box::new(receipt),
                    })
                }
            }
            None => Err(Error::NonceConflict(format!(
                "transaction {:?} was not mined within the watch window",
                tx_hash,
            ))),
        }
    }
}

/// Drives one accepted fulfillment to its terminal report: submit the
/// transaction, then update the run as completed with the transaction
/// hash, or errored with the generic marker. Raw error content never
/// reaches the Chainlink node.
pub async fn process_fulfillment<P, A, S>(
    submitter: Arc<TransactionSubmitter<P>>,
    api: Arc<A>,
    store: S,
    run_id: String,
    envelope: FulfillmentEnvelope,
) where
    P: JsonRpcClient + 'static,
    A: JobService,
    S: CredentialStore,
{
    let update = match submitter.submit(&envelope).await {
        Ok(tx_hash) => RunUpdate::completed(run_id, tx_hash),
        Err(e) => {
            tracing::error!("Failed to fulfill request: {}", e);
            RunUpdate::errored(run_id)
        }
    };
    let token = match store.adapter_credentials() {
        Ok(Some(credentials)) => credentials.incoming_token,
        Ok(None) => {
            tracing::error!(
                "No adapter credentials present, cannot update job run {}",
                update.id,
            );
            return;
        }
        Err(e) => {
            tracing::error!("Failed to load adapter credentials: {}", e);
            return;
        }
    };
    match api.update_job_run(&token, &update).await {
        Ok(()) => tracing::info!(
            run_id = %update.id,
            status = ?update.status,
            "Updated job run",
        ),
        Err(e) => tracing::error!(
            run_id = %update.id,
            "Failed to update job run: {}",
            e,
        ),
    }
}

#[cfg(test)]
mod tests {
    use ethers::core::utils::rlp::Rlp;
    use serde_json::json;

    use super::*;
    use crate::chainlink::RunStatus;
    use crate::store::mem::InMemoryStore;
    use crate::store::{AdapterCredentials, CredentialStore};
    use crate::test_utils::{
        mined_transaction, receipt_with_logs, scripted_provider,
        test_wallet, MockJobService, ScriptedRpc,
    };

    fn envelope() -> FulfillmentEnvelope {
        FulfillmentEnvelope {
            address: Address::repeat_byte(0x11),
            function_selector: Some(vec![0x4a, 0xb0, 0xd1, 0x90].into()),
            data_prefix: Some(vec![0xde, 0xad].into()),
            result: vec![0x01].into(),
        }
    }

    fn broadcast_nonce(raw_tx: &serde_json::Value) -> U256 {
        let bytes = raw_tx[0]
            .as_str()
            .and_then(|raw| hex::decode(raw.trim_start_matches("0x")).ok())
            .unwrap();
        let (tx, _signature) =
            TypedTransaction::decode_signed(&Rlp::new(&bytes)).unwrap();
        *tx.nonce().unwrap()
    }

    async fn submitter_with(
        rpc: &ScriptedRpc,
        starting_nonce: u64,
    ) -> TransactionSubmitter<ScriptedRpc> {
        rpc.respond("eth_chainId", json!("0x21"));
        rpc.respond(
            "eth_getTransactionCount",
            json!(format!("{:#x}", starting_nonce)),
        );
        TransactionSubmitter::new(scripted_provider(rpc), test_wallet())
            .await
            .unwrap()
    }

    #[test]
    fn classifier_matches_known_patterns() {
        assert!(is_nonce_conflict("nonce too low: 5 < 7"));
        assert!(is_nonce_conflict("the nonce too high for account"));
        assert!(is_nonce_conflict(
            "Transaction was not mined within 750 seconds"
        ));
        assert!(!is_nonce_conflict("insufficient funds for gas * price"));
        assert!(!is_nonce_conflict("execution reverted"));
    }

    #[test]
    fn gas_price_scaling_truncates() {
        assert_eq!(scaled_gas_price(U256::from(10)), U256::from(13));
        assert_eq!(scaled_gas_price(U256::from(7)), U256::from(9));
        assert_eq!(scaled_gas_price(U256::zero()), U256::zero());
    }

    #[test]
    fn calldata_defaults_missing_fields_to_empty() {
        let bare = FulfillmentEnvelope {
            address: Address::repeat_byte(0x11),
            function_selector: None,
            data_prefix: None,
            result: vec![0x01, 0x02].into(),
        };
        assert_eq!(bare.calldata(), Bytes::from(vec![0x01, 0x02]));

        let full = envelope();
        assert_eq!(
            full.calldata(),
            Bytes::from(vec![0x4a, 0xb0, 0xd1, 0x90, 0xde, 0xad, 0x01])
        );
    }

    #[test]
    fn envelope_tolerates_missing_adapter_fields() {
        let bare: FulfillmentEnvelope = serde_json::from_value(json!({
            "address": "0x1111111111111111111111111111111111111111",
            "result": "0x01",
        }))
        .unwrap();
        assert_eq!(bare.function_selector, None);
        assert_eq!(bare.data_prefix, None);
        assert_eq!(bare.result, Bytes::from(vec![0x01]));
    }

    #[tokio::test]
    async fn concurrent_submissions_use_distinct_increasing_nonces() {
        let rpc = ScriptedRpc::default();
        let submitter = submitter_with(&rpc, 5).await;
        rpc.respond_sticky("eth_gasPrice", json!("0x3b9aca00"));
        rpc.respond("eth_sendRawTransaction", json!(H256::repeat_byte(1)));
        rpc.respond("eth_sendRawTransaction", json!(H256::repeat_byte(2)));
        rpc.respond("eth_sendRawTransaction", json!(H256::repeat_byte(3)));
        rpc.respond_sticky(
            "eth_getTransactionByHash",
            mined_transaction(),
        );
        rpc.respond_sticky(
            "eth_getTransactionReceipt",
            receipt_with_logs(1),
        );

        let envelope = envelope();
        let (a, b, c) = tokio::join!(
            submitter.submit(&envelope),
            submitter.submit(&envelope),
            submitter.submit(&envelope),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let mut nonces: Vec<U256> = rpc
            .requests_for("eth_sendRawTransaction")
            .iter()
            .map(broadcast_nonce)
            .collect();
        nonces.sort();
        assert_eq!(
            nonces,
            vec![U256::from(5), U256::from(6), U256::from(7)]
        );
    }

    #[tokio::test]
    async fn recovers_from_a_nonce_race() {
        let rpc = ScriptedRpc::default();
        let submitter = submitter_with(&rpc, 5).await;
        rpc.respond_sticky("eth_gasPrice", json!("0x3b9aca00"));
        rpc.respond_error(
            "eth_sendRawTransaction",
            "nonce too low: account nonce is 9",
        );
        rpc.respond("eth_sendRawTransaction", json!(H256::repeat_byte(1)));
        // the resync after the conflict sees the chain's pending count.
        rpc.respond("eth_getTransactionCount", json!("0x9"));
        rpc.respond_sticky(
            "eth_getTransactionByHash",
            mined_transaction(),
        );
        rpc.respond_sticky(
            "eth_getTransactionReceipt",
            receipt_with_logs(1),
        );

        submitter.submit(&envelope()).await.unwrap();

        let broadcasts = rpc.requests_for("eth_sendRawTransaction");
        assert_eq!(broadcasts.len(), 2);
        assert_eq!(broadcast_nonce(&broadcasts[0]), U256::from(5));
        assert_eq!(broadcast_nonce(&broadcasts[1]), U256::from(9));
    }

    #[tokio::test]
    async fn rejects_receipts_without_logs() {
        let rpc = ScriptedRpc::default();
        let submitter = submitter_with(&rpc, 5).await;
        rpc.respond_sticky("eth_gasPrice", json!("0x3b9aca00"));
        rpc.respond("eth_sendRawTransaction", json!(H256::repeat_byte(1)));
        rpc.respond_sticky(
            "eth_getTransactionByHash",
            mined_transaction(),
        );
        // mined with a success flag but no emitted logs.
        rpc.respond_sticky(
            "eth_getTransactionReceipt",
            receipt_with_logs(0),
        );

        let result = submitter.submit(&envelope()).await;
        assert!(matches!(result, Err(Error::ReceiptRejected { .. })));
        assert_eq!(rpc.requests_for("eth_sendRawTransaction").len(), 1);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let rpc = ScriptedRpc::default();
        let submitter = submitter_with(&rpc, 5).await;
        rpc.respond_sticky("eth_gasPrice", json!("0x3b9aca00"));
        rpc.respond_error(
            "eth_sendRawTransaction",
            "insufficient funds for gas * price + value",
        );

        let result = submitter.submit(&envelope()).await;
        assert!(matches!(result, Err(Error::EthersProvider(_))));
        assert_eq!(rpc.requests_for("eth_sendRawTransaction").len(), 1);
    }

    #[tokio::test]
    async fn fulfillment_reports_exactly_one_terminal_update() {
        let rpc = ScriptedRpc::default();
        let submitter = Arc::new(submitter_with(&rpc, 5).await);
        rpc.respond_sticky("eth_gasPrice", json!("0x3b9aca00"));
        rpc.respond("eth_sendRawTransaction", json!(H256::repeat_byte(1)));
        rpc.respond_sticky(
            "eth_getTransactionByHash",
            mined_transaction(),
        );
        rpc.respond_sticky(
            "eth_getTransactionReceipt",
            receipt_with_logs(1),
        );

        let api = Arc::new(MockJobService::default());
        let store = InMemoryStore::default();
        store
            .set_adapter_credentials(&AdapterCredentials {
                incoming_token: "token".into(),
                outgoing_token_hash: String::new(),
            })
            .unwrap();

        process_fulfillment(
            submitter,
            api.clone(),
            store,
            "run-1".to_string(),
            envelope(),
        )
        .await;

        let updates = api.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, "run-1");
        assert_eq!(updates[0].status, RunStatus::Completed);
    }
}
