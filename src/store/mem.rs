use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{
    AdapterCredentials, CredentialStore, InitiatorCredentials, Subscription,
    SubscriptionStore,
};

/// A store that keeps everything in process memory. Used in tests and for
/// ephemeral deployments; nothing survives a restart.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
    initiator_credentials: Arc<RwLock<Option<InitiatorCredentials>>>,
    adapter_credentials: Arc<RwLock<Option<AdapterCredentials>>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl SubscriptionStore for InMemoryStore {
    fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> crate::Result<()> {
        let mut guard = self.subscriptions.write();
        guard.insert(subscription.job_id.clone(), subscription.clone());
        Ok(())
    }

    fn remove_subscription(
        &self,
        job_id: &str,
    ) -> crate::Result<Option<Subscription>> {
        let mut guard = self.subscriptions.write();
        Ok(guard.remove(job_id))
    }

    fn subscriptions(&self) -> crate::Result<Vec<Subscription>> {
        let guard = self.subscriptions.read();
        Ok(guard.values().cloned().collect())
    }
}

impl CredentialStore for InMemoryStore {
    fn initiator_credentials(
        &self,
    ) -> crate::Result<Option<InitiatorCredentials>> {
        Ok(self.initiator_credentials.read().clone())
    }

    fn set_initiator_credentials(
        &self,
        credentials: &InitiatorCredentials,
    ) -> crate::Result<()> {
        *self.initiator_credentials.write() = Some(credentials.clone());
        Ok(())
    }

    fn adapter_credentials(&self) -> crate::Result<Option<AdapterCredentials>> {
        Ok(self.adapter_credentials.read().clone())
    }

    fn set_adapter_credentials(
        &self,
        credentials: &AdapterCredentials,
    ) -> crate::Result<()> {
        *self.adapter_credentials.write() = Some(credentials.clone());
        Ok(())
    }
}
