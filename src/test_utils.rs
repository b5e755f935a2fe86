//! Test doubles shared across the crate's unit tests: a scripted
//! JSON-RPC transport and a recording Chainlink node.
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{
    JsonRpcClient, JsonRpcError, Provider, ProviderError, RpcError,
};
use ethers::signers::LocalWallet;
use ethers::types::{Log, Transaction, TransactionReceipt, H256, U64};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::chainlink::{JobService, RunUpdate};

/// A deterministic signing key for tests.
pub fn test_wallet() -> LocalWallet {
    "4c0883a69102937d6231471b5dbb6204fe512961708279feb1be6ae5538da033"
        .parse()
        .expect("test key is valid")
}

/// Wraps a scripted transport in a provider with a fast poll interval.
pub fn scripted_provider(rpc: &ScriptedRpc) -> Arc<Provider<ScriptedRpc>> {
    Arc::new(Provider::new(rpc.clone()).interval(Duration::from_millis(1)))
}

/// A transaction lookup response for an already-mined transaction.
pub fn mined_transaction() -> Value {
    let tx = Transaction {
        hash: H256::repeat_byte(0x01),
        block_hash: Some(H256::repeat_byte(0x02)),
        block_number: Some(U64::one()),
        ..Default::default()
    };
    serde_json::to_value(tx).expect("transaction serializes")
}

/// A successful receipt carrying the given number of logs.
pub fn receipt_with_logs(log_count: usize) -> Value {
    let receipt = TransactionReceipt {
        transaction_hash: H256::repeat_byte(0x01),
        status: Some(U64::one()),
        logs: vec![Log::default(); log_count],
        ..Default::default()
    };
    serde_json::to_value(receipt).expect("receipt serializes")
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptedRpcError {
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    JsonRpc(#[from] JsonRpcError),
    #[error("no scripted response for {0}")]
    Unscripted(String),
}

impl RpcError for ScriptedRpcError {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        match self {
            Self::JsonRpc(error) => Some(error),
            _ => None,
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            Self::Serde(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ScriptedRpcError> for ProviderError {
    fn from(value: ScriptedRpcError) -> Self {
        ProviderError::JsonRpcClientError(Box::new(value))
    }
}

/// A JSON-RPC transport that answers from scripted per-method responses
/// and records every request it sees.
///
/// One-shot responses queue per method; a sticky response answers any
/// number of calls once the queue is drained, which keeps tests
/// insensitive to how often the provider polls.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRpc {
    queued: Arc<Mutex<HashMap<String, VecDeque<Result<Value, JsonRpcError>>>>>,
    sticky: Arc<Mutex<HashMap<String, Value>>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl ScriptedRpc {
    /// Queues one successful response for the given method.
    pub fn respond(&self, method: &str, value: Value) {
        self.queued
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(value));
    }

    /// Queues one JSON-RPC error response for the given method.
    pub fn respond_error(&self, method: &str, message: &str) {
        self.queued
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(Err(JsonRpcError {
                code: -32000,
                message: message.to_string(),
                data: None,
            }));
    }

    /// Sets the fallback response for a method, reused for every call
    /// after the queued responses run out.
    pub fn respond_sticky(&self, method: &str, value: Value) {
        self.sticky.lock().insert(method.to_string(), value);
    }

    /// The recorded parameters of every call to the given method.
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl JsonRpcClient for ScriptedRpc {
    type Error = ScriptedRpcError;

    async fn request<T, R>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, Self::Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        self.requests
            .lock()
            .push((method.to_string(), serde_json::to_value(&params)?));
        let queued = self
            .queued
            .lock()
            .get_mut(method)
            .and_then(|queue| queue.pop_front());
        let response = match queued {
            Some(response) => response,
            None => match self.sticky.lock().get(method) {
                Some(value) => Ok(value.clone()),
                None => {
                    return Err(ScriptedRpcError::Unscripted(
                        method.to_string(),
                    ))
                }
            },
        };
        match response {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(error) => Err(ScriptedRpcError::JsonRpc(error)),
        }
    }
}

/// A Chainlink node double that records job run operations.
#[derive(Debug, Clone, Default)]
pub struct MockJobService {
    runs: Arc<Mutex<Vec<(String, Value)>>>,
    updates: Arc<Mutex<Vec<RunUpdate>>>,
}

impl MockJobService {
    /// Every `(job_id, payload)` pair this node was asked to run.
    pub fn runs(&self) -> Vec<(String, Value)> {
        self.runs.lock().clone()
    }

    /// Every terminal run update this node received.
    pub fn updates(&self) -> Vec<RunUpdate> {
        self.updates.lock().clone()
    }
}

#[async_trait::async_trait]
impl JobService for MockJobService {
    async fn initiate_job_run(
        &self,
        job_id: &str,
        _access_key: &str,
        _secret: &str,
        payload: &Value,
    ) -> crate::Result<String> {
        let mut runs = self.runs.lock();
        runs.push((job_id.to_string(), payload.clone()));
        Ok(format!("run-{}", runs.len()))
    }

    async fn update_job_run(
        &self,
        _token: &str,
        update: &RunUpdate,
    ) -> crate::Result<()> {
        self.updates.lock().push(update.clone());
        Ok(())
    }
}
