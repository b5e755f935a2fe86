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
//! Per-log confirmation state machine.
//!
//! A delivered log is not final: the chain may retract it through a
//! reorganization shortly after delivery. Triggering a job run on a
//! retracted log would spend off-chain resources (and possibly money) for
//! nothing, so every log waits out a confirmation window first.
//!
//! Each log moves `Observed -> Confirmed` (emitted downstream) or
//! `Observed -> Discarded` (retracted, no side effects). The window is a
//! fixed timer derived from the configured confirmation count and an
//! expected block time of ~20 seconds; a reorganization deeper than the
//! window can retrigger a request, which downstream consumers must
//! tolerate.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::RawLogEvent;

/// Granularity of the confirmation timer.
pub const CONFIRMATION_TICK: Duration = Duration::from_secs(1);

/// How long a removal notice is allowed to settle before the pending
/// entry is discarded.
pub const REMOVAL_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Maps a confirmation count to the number of timer ticks to wait:
/// one expected block time (~20 s) per confirmation, plus slack.
pub const fn confirmation_ticks(confirmations: u64) -> u64 {
    20 * confirmations + 2
}

/// The lifecycle of one pending log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationState {
    /// Delivered and waiting out the confirmation window.
    Observed,
    /// Retracted by the chain; terminal, no side effects.
    Discarded,
    /// Survived the window; terminal, emitted downstream.
    Confirmed,
}

/// A log waiting out its confirmation window.
#[derive(Debug)]
pub struct PendingConfirmation {
    /// The delivered log.
    pub event: RawLogEvent,
    /// Whole ticks this entry has waited so far.
    pub elapsed_ticks: u64,
    /// Where the entry is in its lifecycle.
    pub state: ConfirmationState,
}

/// Gates raw log deliveries behind the confirmation window.
///
/// The pending table is keyed by log identity: at most one entry exists
/// per `log_id` at any time, which also deduplicates repeated deliveries
/// of the same log. Two distinct log identities for the same underlying
/// request are intentionally not deduplicated against each other; log
/// identity is trusted from the chain layer.
///
/// The table is shared between the delivery callback and the per-entry
/// timer tasks; a coarse table lock is plenty at the expected rates.
#[derive(Clone)]
pub struct ConfirmationTracker {
    pending: Arc<RwLock<HashMap<String, PendingConfirmation>>>,
    wait_ticks: u64,
    confirmed_tx: mpsc::Sender<RawLogEvent>,
}

impl ConfirmationTracker {
    /// Creates a tracker that waits out the window for the given
    /// confirmation count and emits surviving events on `confirmed_tx`.
    pub fn new(
        confirmations: u64,
        confirmed_tx: mpsc::Sender<RawLogEvent>,
    ) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            wait_ticks: confirmation_ticks(confirmations),
            confirmed_tx,
        }
    }

    /// Feeds one log delivery into the state machine.
    ///
    /// A normal delivery starts (or is absorbed by) a pending entry; a
    /// removal notice schedules the matching entry for discard once the
    /// chain has had a moment to settle.
    pub fn deliver(&self, event: RawLogEvent) {
        if event.removed {
            let tracker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(REMOVAL_SETTLE_DELAY).await;
                tracker.discard(&event.log_id);
            });
        } else {
            self.observe(event);
        }
    }

    fn observe(&self, event: RawLogEvent) {
        let log_id = event.log_id.clone();
        {
            let mut pending = self.pending.write();
            if pending.contains_key(&log_id) {
                tracing::debug!(
                    %log_id,
                    "Duplicate delivery of a pending log, skipping",
                );
                return;
            }
            pending.insert(
                log_id.clone(),
                PendingConfirmation {
                    event,
                    elapsed_ticks: 0,
                    state: ConfirmationState::Observed,
                },
            );
        }
        tracing::debug!(%log_id, "Observed oracle request log");
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.confirmation_timer(log_id).await;
        });
    }

    fn discard(&self, log_id: &str) {
        let mut pending = self.pending.write();
        if let Some(entry) = pending.get_mut(log_id) {
            entry.state = ConfirmationState::Discarded;
            tracing::info!(
                %log_id,
                "Oracle request log retracted by a reorg, discarding",
            );
            tracing::event!(
                target: crate::probe::TARGET,
                tracing::Level::DEBUG,
                kind = %crate::probe::Kind::Confirmation,
                %log_id,
                discarded = true,
            );
        }
    }

    /// The timer task owned by one pending entry. Ticks once a second
    /// until the entry is discarded or its window elapses.
    async fn confirmation_timer(self, log_id: String) {
        let mut ticks = tokio::time::interval(CONFIRMATION_TICK);
        // the first tick completes immediately.
        ticks.tick().await;
        loop {
            ticks.tick().await;
            let confirmed = {
                let mut pending = self.pending.write();
                let state = match pending.get_mut(&log_id) {
                    None => return,
                    Some(entry) => {
                        if entry.state == ConfirmationState::Observed {
                            entry.elapsed_ticks += 1;
                            if entry.elapsed_ticks >= self.wait_ticks {
                                entry.state = ConfirmationState::Confirmed;
                            }
                        }
                        entry.state
                    }
                };
                match state {
                    ConfirmationState::Observed => None,
                    ConfirmationState::Discarded => {
                        pending.remove(&log_id);
                        return;
                    }
                    ConfirmationState::Confirmed => {
                        pending.remove(&log_id).map(|entry| entry.event)
                    }
                }
            };
            if let Some(event) = confirmed {
                tracing::event!(
                    target: crate::probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %crate::probe::Kind::Confirmation,
                    %log_id,
                    confirmed = true,
                );
                if self.confirmed_tx.send(event).await.is_err() {
                    tracing::warn!(
                        "Confirmed event consumer is gone, dropping event",
                    );
                }
                return;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.read().len()
    }
}
