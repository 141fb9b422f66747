use crate::modules::auth::broker::BrokerConnection;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A login parked on a second-factor prompt: the open broker connection
/// plus what is needed to finish the login once the code arrives.
#[derive(Debug)]
pub struct PendingChallenge {
    pub connection: BrokerConnection,
    pub account_name: String,
    pub created_at: Instant,
}

impl PendingChallenge {
    pub fn new(connection: BrokerConnection, account_name: String) -> Self {
        Self {
            connection,
            account_name,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Accounts currently awaiting a second-factor code, keyed by account id.
/// Abandoned challenges expire after `ttl` and their connections are closed.
pub struct ChallengeRegistry {
    pending: DashMap<i64, PendingChallenge>,
    ttl: Duration,
}

impl ChallengeRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    /// Parks a challenge, replacing (and closing) any earlier one.
    pub fn insert(&self, account_id: i64, challenge: PendingChallenge) {
        if self.pending.insert(account_id, challenge).is_some() {
            tracing::debug!("Replaced pending challenge for account {}", account_id);
        }
    }

    /// Removes and returns the challenge if it is still fresh.
    pub fn take(&self, account_id: i64) -> Option<PendingChallenge> {
        let (_, challenge) = self.pending.remove(&account_id)?;
        if challenge.is_expired(self.ttl) {
            tracing::debug!("Pending challenge for account {} expired", account_id);
            return None;
        }
        Some(challenge)
    }

    pub fn discard(&self, account_id: i64) -> bool {
        self.pending.remove(&account_id).is_some()
    }

    pub fn is_pending(&self, account_id: i64) -> bool {
        self.pending
            .get(&account_id)
            .map(|c| !c.is_expired(self.ttl))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops expired challenges; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, challenge| !challenge.is_expired(self.ttl));
        before.saturating_sub(self.pending.len())
    }
}

pub fn start_sweeper(
    registry: Arc<ChallengeRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Challenge sweeper received cancel signal");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let removed = registry.sweep_expired();
                    if removed > 0 {
                        tracing::info!("Expired {} abandoned second-factor challenge(s)", removed);
                    }
                }
            }
        }
    })
}
