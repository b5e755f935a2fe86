use std::path::Path;

use super::{
    AdapterCredentials, CredentialStore, InitiatorCredentials, Subscription,
    SubscriptionStore,
};

const SUBSCRIPTIONS_TREE: &str = "subscriptions";
const CREDENTIALS_TREE: &str = "credentials";
const INITIATOR_KEY: &str = "initiator";
const ADAPTER_KEY: &str = "adapter";

/// A persistent store backed by a local sled database, so registered jobs
/// and node credentials survive bridge restarts.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .use_compression(true)
            .compression_factor(18)
            .open()?;
        Ok(Self { db })
    }

    /// Creates a store in a temporary directory, deleted on drop.
    pub fn temporary() -> crate::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl SubscriptionStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(SUBSCRIPTIONS_TREE)?;
        tree.insert(
            subscription.job_id.as_bytes(),
            serde_json::to_vec(subscription)?,
        )?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn remove_subscription(
        &self,
        job_id: &str,
    ) -> crate::Result<Option<Subscription>> {
        let tree = self.db.open_tree(SUBSCRIPTIONS_TREE)?;
        match tree.remove(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn subscriptions(&self) -> crate::Result<Vec<Subscription>> {
        let tree = self.db.open_tree(SUBSCRIPTIONS_TREE)?;
        let mut subscriptions = Vec::with_capacity(tree.len());
        for value in tree.iter().values() {
            subscriptions.push(serde_json::from_slice(&value?)?);
        }
        Ok(subscriptions)
    }
}

impl CredentialStore for SledStore {
    fn initiator_credentials(
        &self,
    ) -> crate::Result<Option<InitiatorCredentials>> {
        let tree = self.db.open_tree(CREDENTIALS_TREE)?;
        match tree.get(INITIATOR_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip_all)]
    fn set_initiator_credentials(
        &self,
        credentials: &InitiatorCredentials,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(CREDENTIALS_TREE)?;
        tree.insert(INITIATOR_KEY, serde_json::to_vec(credentials)?)?;
        Ok(())
    }

    fn adapter_credentials(&self) -> crate::Result<Option<AdapterCredentials>> {
        let tree = self.db.open_tree(CREDENTIALS_TREE)?;
        match tree.get(ADAPTER_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip_all)]
    fn set_adapter_credentials(
        &self,
        credentials: &AdapterCredentials,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(CREDENTIALS_TREE)?;
        tree.insert(ADAPTER_KEY, serde_json::to_vec(credentials)?)?;
        Ok(())
    }
}
