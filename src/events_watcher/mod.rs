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
//! # Oracle Request Events Watcher 🕸️
//!
//! A module that listens for oracle request events on the chain.
//!
//! ## Overview
//!
//! One watcher loop is bound to each registered `(job, oracle contract)`
//! subscription for its lifetime. The loop keeps a log subscription on the
//! RSK node filtered down to the oracle contract, the `OracleRequest`
//! topic and the job spec topic, and feeds every delivered log into the
//! confirmation tracker. Events that survive the confirmation window come
//! back over a channel, get decoded, and trigger a job run on the
//! Chainlink node.
//!
//! A decode or processing error for a single event is logged and dropped;
//! it never tears down the watcher or affects other pending events.
use std::sync::Arc;

use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, Filter, Log, H256};
use ethers::utils::keccak256;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::context::{BridgeContext, CHAIN_RETRY_INTERVAL};
use crate::decoder::{self, oracle_request_topic};
use crate::store::{CredentialStore, Subscription};
use crate::trigger::JobTrigger;
use crate::chainlink::JobService;

mod confirmations;
pub use confirmations::{
    confirmation_ticks, ConfirmationState, ConfirmationTracker,
    PendingConfirmation,
};

/// How many confirmed events may queue up between the tracker and the
/// decode/trigger stage before delivery applies backpressure.
const CONFIRMED_CHANNEL_CAPACITY: usize = 64;

/// A single log delivery from the chain connection.
///
/// Ephemeral; `removed` flips to `true` when a chain reorganization
/// invalidates the log after initial delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogEvent {
    /// Identity of this log delivery, stable across the original delivery
    /// and any later removal notice for the same log.
    pub log_id: String,
    /// Hash of the transaction that emitted the log.
    pub transaction_hash: H256,
    /// The contract that emitted the log.
    pub address: Address,
    /// The indexed event topics.
    pub topics: Vec<H256>,
    /// The non-indexed event body.
    pub data: Bytes,
    /// Whether the chain has retracted this log.
    pub removed: bool,
}

impl RawLogEvent {
    /// Converts a delivered log into a raw event.
    pub fn from_log(log: Log) -> Self {
        Self {
            log_id: log_id(&log),
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            address: log.address,
            topics: log.topics,
            data: log.data,
            removed: log.removed.unwrap_or(false),
        }
    }
}

/// Derives the log identity the same way web3 clients do: a short hash of
/// the block hash, the transaction hash and the log index. A removal
/// notice for a log carries the same identity as its original delivery.
pub fn log_id(log: &Log) -> String {
    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(log.block_hash.unwrap_or_default().as_bytes());
    buf.extend_from_slice(
        log.transaction_hash.unwrap_or_default().as_bytes(),
    );
    let mut index = [0u8; 32];
    log.log_index.unwrap_or_default().to_big_endian(&mut index);
    buf.extend_from_slice(&index);
    format!("log_{}", hex::encode(&keccak256(&buf)[..4]))
}

/// Encodes a job spec id into its 32 byte topic form: UTF-8 bytes,
/// right-padded with zeros.
pub fn job_id_topic(job_id: &str) -> crate::Result<H256> {
    let bytes = job_id.as_bytes();
    if bytes.len() > 32 {
        return Err(crate::Error::Generic(
            "job id does not fit into a 32 byte topic",
        ));
    }
    let mut topic = [0u8; 32];
    topic[..bytes.len()].copy_from_slice(bytes);
    Ok(H256::from(topic))
}

/// Watches one oracle contract for requests to one job, forever.
pub struct OracleRequestWatcher<A, S> {
    ctx: BridgeContext,
    trigger: Arc<JobTrigger<A, S>>,
    subscription: Subscription,
}

impl<A, S> OracleRequestWatcher<A, S>
where
    A: JobService + 'static,
    S: CredentialStore + 'static,
{
    /// Creates a watcher bound to the given subscription.
    pub fn new(
        ctx: BridgeContext,
        trigger: Arc<JobTrigger<A, S>>,
        subscription: Subscription,
    ) -> Self {
        Self {
            ctx,
            trigger,
            subscription,
        }
    }

    /// Runs the watcher until the process shuts down.
    #[tracing::instrument(
        skip_all,
        fields(
            job_id = %self.subscription.job_id,
            address = %self.subscription.contract_address,
        ),
    )]
    pub async fn run(self) -> crate::Result<()> {
        let (confirmed_tx, confirmed_rx) =
            mpsc::channel(CONFIRMED_CHANNEL_CAPACITY);
        let tracker = ConfirmationTracker::new(
            self.ctx.config.chain.confirmations,
            confirmed_tx,
        );
        let filter = Filter::new()
            .address(self.subscription.contract_address)
            .topic0(oracle_request_topic())
            .topic1(job_id_topic(&self.subscription.job_id)?);
        tokio::select! {
            result = self.watch_logs(&filter, &tracker) => result,
            result = self.consume_confirmed(confirmed_rx) => result,
        }
    }

    /// Keeps a log subscription open against the node, feeding deliveries
    /// into the confirmation tracker. Reconnects at a fixed interval on
    /// any connection loss, indefinitely.
    async fn watch_logs(
        &self,
        filter: &Filter,
        tracker: &ConfirmationTracker,
    ) -> crate::Result<()> {
        loop {
            let provider = match self.ctx.connect_evm_provider().await {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::error!("Failed to reach the RSK node: {}", e);
                    tokio::time::sleep(CHAIN_RETRY_INTERVAL).await;
                    continue;
                }
            };
            let mut stream = match provider.subscribe_logs(filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(
                        "Failed to subscribe to oracle request logs: {}",
                        e,
                    );
                    tokio::time::sleep(CHAIN_RETRY_INTERVAL).await;
                    continue;
                }
            };
            tracing::info!(
                "Subscribed to oracle requests for job {}",
                self.subscription.job_id,
            );
            while let Some(log) = stream.next().await {
                tracker.deliver(RawLogEvent::from_log(log));
            }
            tracing::warn!(
                "Log stream ended, reconnecting in {}s ...",
                CHAIN_RETRY_INTERVAL.as_secs(),
            );
            tokio::time::sleep(CHAIN_RETRY_INTERVAL).await;
        }
    }

    /// Decodes each confirmed event and triggers the job run for it.
    async fn consume_confirmed(
        &self,
        mut confirmed_rx: mpsc::Receiver<RawLogEvent>,
    ) -> crate::Result<()> {
        while let Some(event) = confirmed_rx.recv().await {
            match decoder::decode_oracle_request(&event) {
                Ok(request) => {
                    tracing::info!(
                        request_id = %request.request_id,
                        "New oracle request, triggering job {} ...",
                        self.subscription.job_id,
                    );
                    if let Err(e) =
                        self.trigger.run_job(&self.subscription, request).await
                    {
                        tracing::error!("Failed to trigger job run: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        log_id = %event.log_id,
                        "Dropping undecodable oracle request log: {}",
                        e,
                    );
                }
            }
        }
        Ok(())
    }
}
