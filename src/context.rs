use std::time::Duration;

use ethers::providers::{Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use tokio::sync::broadcast;

use crate::config::BridgeConfig;

/// How long to wait between attempts to reach the RSK node.
pub const CHAIN_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// How often the provider polls the node for request/receipt status.
const PROVIDER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The shared context of the bridge process.
#[derive(Clone)]
pub struct BridgeContext {
    /// The configuration of the bridge.
    pub config: BridgeConfig,
    /// Broadcasts a shutdown signal to all active tasks.
    ///
    /// The initial `shutdown` trigger is provided by the signal handler in
    /// `main`. Every long-running task is handed a broadcast receiver
    /// handle; when a graceful shutdown is initiated, a `()` value is sent
    /// and each task reaches a safe terminal state.
    notify_shutdown: broadcast::Sender<()>,
}

impl BridgeContext {
    /// Creates a new context from a loaded configuration.
    pub fn new(config: BridgeConfig) -> Self {
        let (notify_shutdown, _) = broadcast::channel(2);
        Self {
            config,
            notify_shutdown,
        }
    }

    /// Returns a new shutdown signal receiver.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends the shutdown signal to all active tasks.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Connects to the RSK node, retrying at a fixed interval until the
    /// node is reachable. Connectivity problems are never terminal.
    pub async fn connect_evm_provider(&self) -> crate::Result<Provider<Ws>> {
        let endpoint = self.config.chain.ws_endpoint();
        tracing::info!("Waiting for the RSK node to be ready at {}", endpoint);
        let backoff = backoff::backoff::Constant::new(CHAIN_RETRY_INTERVAL);
        let ws = backoff::future::retry(backoff, || async {
            Ws::connect_with_reconnects(endpoint.clone(), usize::MAX)
                .await
                .map_err(|e| {
                    tracing::error!(
                        "Could not connect to the RSK node, retrying in {}s: {}",
                        CHAIN_RETRY_INTERVAL.as_secs(),
                        e,
                    );
                    backoff::Error::transient(e)
                })
        })
        .await?;
        Ok(Provider::new(ws).interval(PROVIDER_POLL_INTERVAL))
    }

    /// Loads the signing wallet from the configured key file and binds it
    /// to the given chain id. The file holds the hex-encoded key, with or
    /// without a `0x` prefix, and nothing else.
    pub fn evm_wallet(&self, chain_id: u64) -> crate::Result<LocalWallet> {
        let raw = std::fs::read_to_string(&self.config.adapter.keyfile)?;
        let key = raw.trim().trim_start_matches("0x");
        let wallet: LocalWallet = key.parse()?;
        Ok(wallet.with_chain_id(chain_id))
    }
}

/// Listens for the bridge shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single value
/// is ever sent. Once a value has been sent via the broadcast channel, all
/// tasks should shutdown.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    shutdown: bool,

    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        // If the shutdown signal has already been received, then return
        // immediately.
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        // Remember that the signal has been received.
        self.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::BridgeConfig;

    #[test]
    fn loads_wallet_from_key_file() {
        let mut keyfile = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            keyfile,
            "0x4c0883a69102937d6231471b5dbb6204fe512961708279feb1be6ae5538da033"
        )
        .unwrap();
        let mut config = BridgeConfig::default();
        config.adapter.keyfile = keyfile.path().to_path_buf();
        let ctx = BridgeContext::new(config);
        let wallet = ctx.evm_wallet(33).unwrap();
        assert_eq!(wallet.chain_id(), 33);
    }

    #[tokio::test]
    async fn shutdown_signal_is_broadcast() {
        let ctx = BridgeContext::new(BridgeConfig::default());
        let mut first = ctx.shutdown_signal();
        let mut second = ctx.shutdown_signal();
        ctx.shutdown();
        first.recv().await;
        second.recv().await;
    }
}
