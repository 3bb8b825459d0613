//! Alert delivery interface.
//!
//! The transport that actually reaches people lives outside this crate. An
//! alert counts as fired once the deduplicator lets it through; delivery
//! failures are logged and never undo that.

use std::future::Future;

use tracing::warn;

use crate::error::NotifyError;
use crate::model::{Alert, RecipientScope};

pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        scope: &RecipientScope,
        alert: &Alert,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Writes alerts to the log and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, scope: &RecipientScope, alert: &Alert) -> Result<(), NotifyError> {
        warn!(
            device_id = %alert.key.device_id,
            condition = alert.key.condition.as_str(),
            scope = ?scope,
            stale = alert.stale,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Deliver to both notifiers. The first error is reported after both ran.
impl<A: Notifier, B: Notifier> Notifier for (A, B) {
    async fn notify(&self, scope: &RecipientScope, alert: &Alert) -> Result<(), NotifyError> {
        let first = self.0.notify(scope, alert).await;
        let second = self.1.notify(scope, alert).await;
        first.and(second)
    }
}
