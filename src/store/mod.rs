use ethers::types::Address;
use serde::{Deserialize, Serialize};

pub mod mem;
pub mod sled;

/// A registered `(job, oracle contract)` pair.
///
/// One watcher loop is bound to a subscription for its whole lifetime; the
/// pair itself never changes after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// The Chainlink job spec id this subscription serves.
    pub job_id: String,
    /// The oracle contract emitting requests for that job.
    pub contract_address: Address,
}

/// Credentials exchanged with the Chainlink node for the initiator role.
///
/// The `incoming_*` pair authenticates the bridge when it starts job runs;
/// the `outgoing_*` hashes validate the node when it registers jobs. Only
/// keccak-256 hashes of the outgoing pair are ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorCredentials {
    /// Access key presented by the bridge on job run triggers.
    pub incoming_access_key: String,
    /// Secret presented by the bridge on job run triggers.
    pub incoming_secret: String,
    /// Hex keccak-256 hash of the access key the node presents.
    pub outgoing_access_key_hash: String,
    /// Hex keccak-256 hash of the secret the node presents.
    pub outgoing_secret_hash: String,
}

/// Credentials exchanged with the Chainlink node for the adapter role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCredentials {
    /// Token presented by the bridge on job run updates.
    pub incoming_token: String,
    /// Hex keccak-256 hash of the bearer token the node presents.
    pub outgoing_token_hash: String,
}

/// A store for the registered `(job, oracle contract)` subscriptions.
pub trait SubscriptionStore: Clone + Send + Sync {
    /// Registers a subscription, replacing any previous one for the job.
    fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> crate::Result<()>;
    /// Removes the subscription for the given job, if any.
    fn remove_subscription(
        &self,
        job_id: &str,
    ) -> crate::Result<Option<Subscription>>;
    /// All currently registered subscriptions.
    fn subscriptions(&self) -> crate::Result<Vec<Subscription>>;
}

/// A store for the credentials shared with the Chainlink node.
///
/// The bridge only assumes read-your-writes consistency from it.
pub trait CredentialStore: Clone + Send + Sync {
    /// The initiator credential set, if configured.
    fn initiator_credentials(
        &self,
    ) -> crate::Result<Option<InitiatorCredentials>>;
    /// Saves the initiator credential set.
    fn set_initiator_credentials(
        &self,
        credentials: &InitiatorCredentials,
    ) -> crate::Result<()>;
    /// The adapter credential set, if configured.
    fn adapter_credentials(&self) -> crate::Result<Option<AdapterCredentials>>;
    /// Saves the adapter credential set.
    fn set_adapter_credentials(
        &self,
        credentials: &AdapterCredentials,
    ) -> crate::Result<()>;
}
