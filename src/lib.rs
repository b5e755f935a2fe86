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
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # RSK Oracle Bridge 🌉
//!
//! A bridge between on-chain oracle requests on an RSK network and an
//! off-chain Chainlink node.
//!
//! ## Overview
//!
//! The bridge plays two roles for a Chainlink node:
//!
//!   1. **External initiator**: it keeps a persistent log subscription per
//!      registered `(job, oracle contract)` pair, waits out a confirmation
//!      window so that chain reorganizations cannot trigger spurious job
//!      runs, decodes the `OracleRequest` event payload, and starts a job
//!      run on the Chainlink node.
//!   2. **External adapter**: it receives the computed result back from the
//!      Chainlink node over a webhook, wraps it into a fulfillment
//!      transaction signed with a locally held key, broadcasts it with a
//!      strictly serialized per-account nonce, and reports the terminal
//!      outcome back to the node.
//!
//! Both webhook surfaces acknowledge requests synchronously while the
//! actual chain work completes on background tasks; outcomes travel back
//! to the Chainlink node through its runs API, never through the original
//! HTTP response.

/// A client for the Chainlink node REST API (job runs).
pub mod chainlink;
/// Environment-based configuration for the bridge.
pub mod config;
/// A module for managing the context of the bridge.
pub mod context;
/// Decoding of raw `OracleRequest` logs into structured requests.
pub mod decoder;
/// The crate-wide error type.
pub mod error;
/// A module that listens for oracle request events on the chain.
pub mod events_watcher;
/// A module containing webhook handlers for the Chainlink node.
pub mod handler;
/// A module used for debugging bridge lifecycle and pipeline state.
pub mod probe;
/// A module for starting long-running subscription watcher tasks.
pub mod service;
/// Persistent stores for subscriptions and node credentials.
pub mod store;
/// Triggering job runs on the Chainlink node from confirmed requests.
pub mod trigger;
/// Building, signing and broadcasting fulfillment transactions.
pub mod tx_submitter;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
