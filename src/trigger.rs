use std::sync::Arc;
use std::time::Duration;

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes};
use serde_json::json;

use crate::chainlink::JobService;
use crate::decoder::OracleRequest;
use crate::error::Error;
use crate::store::{CredentialStore, InitiatorCredentials, Subscription};

/// Selector of the oracle contract `fulfillRequest` entry point the
/// adapter side calls to deliver results.
pub const FULFILL_FUNCTION_SELECTOR: [u8; 4] = [0x4a, 0xb0, 0xd1, 0x90];

/// How long to defer when credentials are not configured yet. Covers the
/// window at startup where the Chainlink node registers the bridge
/// moments after the first job requests come in; deferral happens once
/// per trigger, it is not a steady-state retry policy.
pub const CREDENTIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Turns confirmed oracle requests into job runs on the Chainlink node.
pub struct JobTrigger<A, S> {
    api: Arc<A>,
    store: S,
}

impl<A, S> JobTrigger<A, S>
where
    A: JobService,
    S: CredentialStore,
{
    /// Creates a trigger that starts runs through `api`, authenticating
    /// with credentials held in `store`.
    pub fn new(api: Arc<A>, store: S) -> Self {
        Self { api, store }
    }

    /// Starts a run of the subscribed job for one confirmed request.
    ///
    /// Returns the run id assigned by the Chainlink node. A rejected or
    /// unreachable node surfaces as an error to the caller; there is no
    /// automatic retry.
    pub async fn run_job(
        &self,
        subscription: &Subscription,
        request: OracleRequest,
    ) -> crate::Result<String> {
        let credentials = self.load_credentials().await?;
        let payload =
            run_request_payload(subscription.contract_address, &request);
        let run_id = self
            .api
            .initiate_job_run(
                &subscription.job_id,
                &credentials.incoming_access_key,
                &credentials.incoming_secret,
                &payload,
            )
            .await?;
        tracing::info!(%run_id, "Initiated job run");
        Ok(run_id)
    }

    async fn load_credentials(&self) -> crate::Result<InitiatorCredentials> {
        if let Some(credentials) = self.store.initiator_credentials()? {
            return Ok(credentials);
        }
        tracing::warn!(
            "Initiator credentials not configured yet, retrying once ...",
        );
        tokio::time::sleep(CREDENTIAL_RETRY_DELAY).await;
        self.store
            .initiator_credentials()?
            .ok_or(Error::CredentialsNotConfigured)
    }
}

/// The ABI encoding of `(requestId, payment, callbackAddr,
/// callbackFunctionId, cancelExpiration)`, in that order. The adapter
/// prepends this to the computed result so the fulfillment call needs no
/// access to the original request.
pub fn fulfillment_data_prefix(request: &OracleRequest) -> Bytes {
    abi::encode(&[
        Token::FixedBytes(request.request_id.as_bytes().to_vec()),
        Token::Uint(request.payment),
        Token::Address(request.callback_address),
        Token::FixedBytes(request.callback_function_id.to_vec()),
        Token::Uint(request.cancel_expiration),
    ])
    .into()
}

/// The job run payload: the decoded request parameters, augmented with
/// the oracle address, the fulfillment data prefix and the fulfillment
/// function selector for the adapter side.
pub fn run_request_payload(
    oracle: Address,
    request: &OracleRequest,
) -> serde_json::Value {
    let mut params = request.parameters.clone();
    params.insert("address".to_string(), json!(oracle));
    params.insert(
        "dataPrefix".to_string(),
        json!(fulfillment_data_prefix(request)),
    );
    params.insert(
        "functionSelector".to_string(),
        json!(format!("0x{}", hex::encode(FULFILL_FUNCTION_SELECTOR))),
    );
    serde_json::Value::Object(params)
}

#[cfg(test)]
mod tests {
    use ethers::types::{H256, U256};
    use serde_json::Map;

    use super::*;
    use crate::store::mem::InMemoryStore;
    use crate::test_utils::MockJobService;

    fn oracle_request() -> OracleRequest {
        let mut parameters = Map::new();
        parameters
            .insert("get".into(), json!("https://example.com/api/price"));
        OracleRequest {
            request_id: H256::repeat_byte(0xAA),
            requester: Address::repeat_byte(0x22),
            payment: U256::exp10(18),
            callback_address: Address::repeat_byte(0x33),
            callback_function_id: [0x12, 0x34, 0x56, 0x78],
            cancel_expiration: U256::from(1_620_000_000u64),
            data_version: U256::one(),
            parameters,
        }
    }

    fn initiator_credentials() -> InitiatorCredentials {
        InitiatorCredentials {
            incoming_access_key: "access".into(),
            incoming_secret: "secret".into(),
            outgoing_access_key_hash: String::new(),
            outgoing_secret_hash: String::new(),
        }
    }

    #[test]
    fn data_prefix_is_five_words() {
        let prefix = fulfillment_data_prefix(&oracle_request());
        assert_eq!(prefix.len(), 5 * 32);
        // first word is the request id verbatim.
        assert_eq!(&prefix[..32], H256::repeat_byte(0xAA).as_bytes());
        // the selector word is left-aligned.
        assert_eq!(&prefix[128..132], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn payload_keeps_parameters_and_adds_adapter_fields() {
        let oracle = Address::repeat_byte(0x11);
        let payload = run_request_payload(oracle, &oracle_request());
        assert_eq!(
            payload["get"],
            json!("https://example.com/api/price")
        );
        assert_eq!(payload["address"], json!(oracle));
        assert_eq!(payload["functionSelector"], json!("0x4ab0d190"));
        let prefix = payload["dataPrefix"].as_str().unwrap();
        assert_eq!(prefix.len(), 2 + 5 * 64);
    }

    #[tokio::test]
    async fn triggers_a_run_with_stored_credentials() {
        let store = InMemoryStore::default();
        store
            .set_initiator_credentials(&initiator_credentials())
            .unwrap();
        let api = Arc::new(MockJobService::default());
        let trigger = JobTrigger::new(api.clone(), store);
        let subscription = Subscription {
            job_id: "6e0d8b78b7c94b0e8b6f2b86a5f0c8aa".into(),
            contract_address: Address::repeat_byte(0x11),
        };

        let run_id = trigger
            .run_job(&subscription, oracle_request())
            .await
            .unwrap();
        assert_eq!(run_id, "run-1");

        let runs = api.runs();
        assert_eq!(runs.len(), 1);
        let (job_id, payload) = &runs[0];
        assert_eq!(job_id, &subscription.job_id);
        assert_eq!(payload["functionSelector"], json!("0x4ab0d190"));
    }

    #[tokio::test(start_paused = true)]
    async fn defers_once_for_late_credentials() {
        let store = InMemoryStore::default();
        let api = Arc::new(MockJobService::default());
        let trigger = JobTrigger::new(api, store.clone());
        let subscription = Subscription {
            job_id: "6e0d8b78b7c94b0e8b6f2b86a5f0c8aa".into(),
            contract_address: Address::repeat_byte(0x11),
        };

        // credentials land while the trigger is deferring.
        let late_store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            late_store
                .set_initiator_credentials(&initiator_credentials())
                .unwrap();
        });

        let run_id = trigger
            .run_job(&subscription, oracle_request())
            .await
            .unwrap();
        assert_eq!(run_id, "run-1");
    }

    #[tokio::test(start_paused = true)]
    async fn fails_when_credentials_never_arrive() {
        let store = InMemoryStore::default();
        let api = Arc::new(MockJobService::default());
        let trigger = JobTrigger::new(api.clone(), store);
        let subscription = Subscription {
            job_id: "6e0d8b78b7c94b0e8b6f2b86a5f0c8aa".into(),
            contract_address: Address::repeat_byte(0x11),
        };

        let result = trigger.run_job(&subscription, oracle_request()).await;
        assert!(matches!(result, Err(Error::CredentialsNotConfigured)));
        assert!(api.runs().is_empty());
    }
}
