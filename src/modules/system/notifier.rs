use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// Automated run starts in `minutes`; the account may postpone it.
    Reminder { minutes: i64 },
    ModulesAssembled { count: i64 },
    /// Refresh failed; the account must log in again.
    RefreshExpired,
    AutomationFailed { reason: String },
}

/// Delivery of scheduler notices to account owners. Implemented by the
/// chat front-end.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account_id: i64, notice: Notice) -> Result<(), String>;
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, account_id: i64, notice: Notice) -> Result<(), String> {
        match &notice {
            Notice::AutomationFailed { reason } => {
                tracing::warn!(account_id, "Automation failed: {}", reason)
            }
            other => tracing::info!(account_id, notice = ?other, "Notice"),
        }
        Ok(())
    }
}
