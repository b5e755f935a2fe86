use std::sync::Arc;

use tokio::sync::mpsc;

use crate::chainlink::JobService;
use crate::context::BridgeContext;
use crate::events_watcher::OracleRequestWatcher;
use crate::store::{CredentialStore, Subscription, SubscriptionStore};
use crate::trigger::JobTrigger;

/// Starts the background half of the bridge: one watcher per stored
/// subscription, plus a dispatcher that starts a watcher for every newly
/// registered subscription coming off the initiator webhook.
///
/// This does not block; everything runs on background tasks.
pub async fn ignite<A, S>(
    ctx: &BridgeContext,
    store: S,
    trigger: Arc<JobTrigger<A, S>>,
    mut subscriptions: mpsc::Receiver<Subscription>,
) -> crate::Result<()>
where
    A: JobService + 'static,
    S: SubscriptionStore + CredentialStore + 'static,
{
    let stored = store.subscriptions()?;
    if !stored.is_empty() {
        tracing::info!(
            "Reviving {} stored job subscription(s)",
            stored.len(),
        );
    }
    for subscription in stored {
        start_subscription(ctx, trigger.clone(), subscription);
    }
    let dispatcher_ctx = ctx.clone();
    let task = async move {
        while let Some(subscription) = subscriptions.recv().await {
            start_subscription(
                &dispatcher_ctx,
                trigger.clone(),
                subscription,
            );
        }
        tracing::warn!("Subscription dispatcher channel closed");
    };
    tokio::task::spawn(task);
    Ok(())
}

/// Spawns the watcher loop for one subscription, tied to the shutdown
/// signal.
pub fn start_subscription<A, S>(
    ctx: &BridgeContext,
    trigger: Arc<JobTrigger<A, S>>,
    subscription: Subscription,
) where
    A: JobService + 'static,
    S: CredentialStore + 'static,
{
    let job_id = subscription.job_id.clone();
    let contract_address = subscription.contract_address;
    let watcher =
        OracleRequestWatcher::new(ctx.clone(), trigger, subscription);
    let mut shutdown_signal = ctx.shutdown_signal();
    tracing::debug!(
        "Oracle request watcher for job {} at ({}) Started.",
        job_id,
        contract_address,
    );
    let task = async move {
        tokio::select! {
            result = watcher.run() => {
                if let Err(e) = result {
                    tracing::warn!(
                        "Oracle request watcher stopped for ({}): {}",
                        contract_address,
                        e,
                    );
                }
            },
            _ = shutdown_signal.recv() => {
                tracing::trace!(
                    "Stopping oracle request watcher for ({})",
                    contract_address,
                );
            },
        }
    };
    // kick off the watcher.
    tokio::task::spawn(task);
}
