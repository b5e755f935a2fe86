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
use std::path::PathBuf;

use serde::Deserialize;
use url::Url;

/// Prefix for all environment variables read by the bridge,
/// e.g. `BRIDGE_CHAIN_HOST` or `BRIDGE_ADAPTER_PORT`.
pub const ENV_PREFIX: &str = "BRIDGE";

fn default_chain_protocol() -> String {
    "ws".to_string()
}

fn default_chain_host() -> String {
    "localhost".to_string()
}

const fn default_chain_port() -> u16 {
    4445
}

fn default_chain_path() -> String {
    "/websocket".to_string()
}

const fn default_confirmations() -> u64 {
    3
}

const fn default_initiator_port() -> u16 {
    30055
}

const fn default_adapter_port() -> u16 {
    30056
}

fn default_adapter_keyfile() -> PathBuf {
    PathBuf::from(".adapterKey")
}

fn default_chainlink_url() -> Url {
    Url::parse("http://localhost:6688/").expect("default chainlink url is valid")
}

const fn default_chainlink_timeout() -> u64 {
    30
}

/// BridgeConfig is the configuration for the whole bridge process.
///
/// All values are read once from the environment at startup; there is no
/// hot reload.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeConfig {
    /// The RSK node connection and confirmation policy.
    #[serde(default)]
    pub chain: ChainConfig,
    /// The external initiator webhook server.
    #[serde(default)]
    pub initiator: InitiatorConfig,
    /// The external adapter webhook server and signing account.
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// The Chainlink node REST API.
    #[serde(default)]
    pub chainlink: ChainlinkConfig,
}

/// ChainConfig is the configuration for the RSK node connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// Websocket protocol, `ws` or `wss`.
    #[serde(default = "default_chain_protocol")]
    pub protocol: String,
    /// Hostname of the RSK node.
    #[serde(default = "default_chain_host")]
    pub host: String,
    /// Websocket port of the RSK node.
    #[serde(default = "default_chain_port")]
    pub port: u16,
    /// Websocket path of the RSK node.
    #[serde(default = "default_chain_path")]
    pub path: String,
    /// How many block confirmations an oracle request log must survive
    /// before it triggers a job run.
    ///
    /// The wait is a fixed timer derived from an expected block time of
    /// roughly 20 seconds, not a block-height comparison, so it holds up
    /// under moderately variable real block times. A reorganization deeper
    /// than this window can still retrigger a request.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

impl ChainConfig {
    /// The full websocket endpoint of the RSK node.
    pub fn ws_endpoint(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.path
        )
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            protocol: default_chain_protocol(),
            host: default_chain_host(),
            port: default_chain_port(),
            path: default_chain_path(),
            confirmations: default_confirmations(),
        }
    }
}

/// InitiatorConfig is the configuration for the initiator webhook server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InitiatorConfig {
    /// Listening port for `POST /initiator` subscriptions.
    #[serde(default = "default_initiator_port")]
    pub port: u16,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            port: default_initiator_port(),
        }
    }
}

/// AdapterConfig is the configuration for the adapter webhook server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdapterConfig {
    /// Listening port for `POST /adapter` fulfillment requests.
    #[serde(default = "default_adapter_port")]
    pub port: u16,
    /// Path of the file holding the hex-encoded private key of the
    /// submitting account. The key never leaves the process.
    #[serde(default = "default_adapter_keyfile")]
    pub keyfile: PathBuf,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            port: default_adapter_port(),
            keyfile: default_adapter_keyfile(),
        }
    }
}

/// ChainlinkConfig is the configuration for the Chainlink node REST API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainlinkConfig {
    /// Base URL of the Chainlink node API, with a trailing slash.
    #[serde(default = "default_chainlink_url")]
    pub url: Url,
    /// Request timeout in seconds for job run operations. A timed out
    /// trigger or update is treated as failed and is not retried.
    #[serde(default = "default_chainlink_timeout")]
    pub timeout: u64,
}

impl Default for ChainlinkConfig {
    fn default() -> Self {
        Self {
            url: default_chainlink_url(),
            timeout: default_chainlink_timeout(),
        }
    }
}

/// Loads the bridge configuration from the environment.
pub fn load() -> crate::Result<BridgeConfig> {
    let cfg = config::Config::builder()
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("_"))
        .build()?;
    let config = cfg.try_deserialize()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_defaults_and_environment_overrides() {
        let config = load().unwrap();
        assert_eq!(config.chain.ws_endpoint(), "ws://localhost:4445/websocket");
        assert_eq!(config.chain.confirmations, 3);
        assert_eq!(config.initiator.port, 30055);
        assert_eq!(config.adapter.port, 30056);
        assert_eq!(config.adapter.keyfile, PathBuf::from(".adapterKey"));
        assert_eq!(config.chainlink.url.as_str(), "http://localhost:6688/");

        std::env::set_var("BRIDGE_CHAIN_HOST", "rsk-node");
        std::env::set_var("BRIDGE_CHAIN_PORT", "4444");
        std::env::set_var("BRIDGE_CHAIN_CONFIRMATIONS", "5");
        std::env::set_var("BRIDGE_ADAPTER_PORT", "40056");
        let config = load().unwrap();
        assert_eq!(config.chain.ws_endpoint(), "ws://rsk-node:4444/websocket");
        assert_eq!(config.chain.confirmations, 5);
        assert_eq!(config.adapter.port, 40056);

        std::env::remove_var("BRIDGE_CHAIN_HOST");
        std::env::remove_var("BRIDGE_CHAIN_PORT");
        std::env::remove_var("BRIDGE_CHAIN_CONFIRMATIONS");
        std::env::remove_var("BRIDGE_ADAPTER_PORT");
    }
}
