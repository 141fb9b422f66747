use crate::error::{AuthError, StoreError};
use crate::models::{Account, AccountPatch, SchedulerConfig};
use crate::modules::auth::lifecycle::TokenLifecycleManager;
use crate::modules::persistence::account_db::{AccountQuery, AccountStore};
use crate::modules::system::notifier::{Notice, Notifier};
use crate::proxy::upstream::client::UpstreamClient;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const OBSERVABILITY_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Counts for one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub notified: usize,
    pub executed: usize,
    pub expired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchedulerObservabilitySnapshot {
    pub runs_last_hour: usize,
    pub notified_last_hour: usize,
    pub executed_last_hour: usize,
    pub failures_last_hour: usize,
}

/// Why one account's automated run did not finish.
#[derive(Debug)]
enum RunFailure {
    Expired(AuthError),
    Failed(AuthError),
}

pub struct AutomationScheduler {
    store: Arc<dyn AccountStore>,
    auth: Arc<TokenLifecycleManager>,
    client: Arc<UpstreamClient>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    recent_runs: Mutex<VecDeque<(Instant, TickSummary)>>,
}

impl AutomationScheduler {
    pub fn new(
        store: Arc<dyn AccountStore>,
        auth: Arc<TokenLifecycleManager>,
        client: Arc<UpstreamClient>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            auth,
            client,
            notifier,
            config,
            recent_runs: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn run_once(&self) -> Result<TickSummary, StoreError> {
        let span = tracing::info_span!("automation_tick", run_id = %uuid::Uuid::new_v4());
        self.run_once_at(chrono::Utc::now().timestamp())
            .instrument(span)
            .await
    }

    /// One scan: remind accounts entering the lead window, then run every
    /// due account. A failing account never stops the scan.
    pub async fn run_once_at(&self, now: i64) -> Result<TickSummary, StoreError> {
        let mut summary = TickSummary::default();

        let to_notify = self.store.select(&AccountQuery::pre_notify(
            now,
            self.config.run_interval_secs,
            self.config.notify_lead_secs,
        ))
        .await?;
        for account in to_notify {
            if self.remind(&account).await {
                summary.notified += 1;
            }
        }

        let due = self
            .store
            .select(&AccountQuery::due(now, self.config.run_interval_secs))
            .await?;
        for account in due {
            let account_id = account.id;
            match self
                .process_account(account, now)
                .instrument(tracing::info_span!("account", account_id))
                .await
            {
                Ok(count) => {
                    summary.executed += 1;
                    self.send(account_id, Notice::ModulesAssembled { count }).await;
                }
                Err(RunFailure::Expired(e)) => {
                    summary.expired += 1;
                    tracing::warn!(account_id, "Automation cancelled, session expired: {}", e);
                    self.send(account_id, Notice::RefreshExpired).await;
                }
                Err(RunFailure::Failed(e)) => {
                    summary.failed += 1;
                    tracing::error!(account_id, "Unable to process account: {}", e);
                    self.send(
                        account_id,
                        Notice::AutomationFailed {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                }
            }
        }

        self.record_run(summary);
        if summary != TickSummary::default() {
            let live_proxies = self.client.ring().map(|ring| ring.live_count());
            tracing::info!(
                "[Scheduler] Tick completed: notified={}, executed={}, expired={}, failed={}, live_proxies={:?}",
                summary.notified,
                summary.executed,
                summary.expired,
                summary.failed,
                live_proxies
            );
        }
        Ok(summary)
    }

    async fn remind(&self, account: &Account) -> bool {
        let notice = Notice::Reminder {
            minutes: self.config.notify_lead_secs / 60,
        };
        if let Err(e) = self.notifier.notify(account.id, notice).await {
            tracing::warn!(account_id = account.id, "Failed to send reminder: {}", e);
            return false;
        }
        match self.store.update(account.id, &AccountPatch::new().notified()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(account_id = account.id, "Failed to mark reminder sent: {}", e);
                false
            }
        }
    }

    async fn send(&self, account_id: i64, notice: Notice) {
        if let Err(e) = self.notifier.notify(account_id, notice).await {
            tracing::warn!(account_id, "Failed to deliver notice: {}", e);
        }
    }

    /// Assembles as many modules as the account's stamina pays for.
    async fn process_account(&self, account: Account, now: i64) -> Result<i64, RunFailure> {
        tracing::debug!("Processing account");
        // Marked before any upstream work so a crash mid-run does not re-run it.
        self.store
            .update(account.id, &AccountPatch::new().run_started(now))
            .await
            .map_err(|e| RunFailure::Failed(e.into()))?;

        let account = match self.auth.refresh_if_expired_at(account.id, now).await {
            Ok(account) => account,
            Err(e @ AuthError::TokenExpired(_)) => return Err(RunFailure::Expired(e)),
            Err(e) => return Err(RunFailure::Failed(e)),
        };
        let Some((uid, auth_code)) = account.session() else {
            return Err(RunFailure::Expired(AuthError::NotAuthenticated(account.id)));
        };

        let data = self
            .client
            .load_all(uid, auth_code)
            .await
            .map_err(|e| RunFailure::Failed(e.into()))?;
        let count = data.updated.user_info.stamina / i64::from(self.config.module_cost.max(1));
        if count > 0 {
            self.client
                .purchase_module(uid, auth_code, count)
                .await
                .map_err(|e| RunFailure::Failed(e.into()))?;
        }
        tracing::info!("Assembled {} module(s)", count);
        Ok(count)
    }

    fn record_run(&self, summary: TickSummary) {
        let now = Instant::now();
        let mut runs = self.recent_runs.lock();
        let window_start = now.checked_sub(OBSERVABILITY_WINDOW).unwrap_or(now);
        while let Some((ts, _)) = runs.front() {
            if *ts < window_start {
                runs.pop_front();
            } else {
                break;
            }
        }
        runs.push_back((now, summary));
    }

    pub fn observability_snapshot(&self) -> SchedulerObservabilitySnapshot {
        let now = Instant::now();
        let window_start = now.checked_sub(OBSERVABILITY_WINDOW).unwrap_or(now);
        let runs = self.recent_runs.lock();
        let mut snapshot = SchedulerObservabilitySnapshot {
            runs_last_hour: 0,
            notified_last_hour: 0,
            executed_last_hour: 0,
            failures_last_hour: 0,
        };
        for (_, summary) in runs.iter().filter(|(ts, _)| *ts >= window_start) {
            snapshot.runs_last_hour += 1;
            snapshot.notified_last_hour += summary.notified;
            snapshot.executed_last_hour += summary.executed;
            snapshot.failures_last_hour += summary.failed + summary.expired;
        }
        snapshot
    }

    /// Runs a scan, then sleeps one tick, until cancelled. Cancellation is
    /// observed between scans only.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tick = Duration::from_secs(self.config.tick_secs.max(1));
        tokio::spawn(async move {
            tracing::info!("Automation scheduler started (tick: {:?})", tick);
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = self.run_once().await {
                    tracing::error!("[Scheduler] Scan failed: {}", e);
                }
                let snapshot = self.observability_snapshot();
                tracing::debug!(
                    runs = snapshot.runs_last_hour,
                    notified = snapshot.notified_last_hour,
                    executed = snapshot.executed_last_hour,
                    failures = snapshot.failures_last_hour,
                    "[Scheduler] Last hour"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
            }
            tracing::info!("Automation scheduler stopped");
        })
    }
}
