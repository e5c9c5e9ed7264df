use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

use crate::error::Result;
use crate::ledger::Ledger;

/// Periodically deletes exited parking records older than the configured
/// retention period. Parked records are never touched.
pub struct RetentionService {
    ledger: Ledger,
    check_interval: Duration,
}

impl RetentionService {
    pub fn new(ledger: Ledger, check_interval: Duration) -> Self {
        Self {
            ledger,
            check_interval,
        }
    }

    /// Start the purge loop in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting record retention service with interval of {} seconds",
            self.check_interval.as_secs()
        );

        tokio::spawn(async move {
            let mut ticker = interval(self.check_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once(Utc::now()).await {
                    error!("Error running record retention: {}", e);
                }
            }
        })
    }

    /// One purge pass. `retention_days <= 0` disables purging.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<u64> {
        let config = self.ledger.system_config().await?;
        if config.retention_days <= 0 {
            return Ok(0);
        }

        let cutoff = now - chrono::Duration::days(config.retention_days);
        let purged = self.ledger.purge_exited_before(cutoff).await?;
        if purged > 0 {
            info!("Purged {} exited records older than {} days", purged, config.retention_days);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerSettings;

    async fn ledger_with_retention(days: i64) -> Ledger {
        let ledger = Ledger::connect_in_memory().await.unwrap();
        let settings = LedgerSettings {
            retention_days: days,
            ..LedgerSettings::default()
        };
        ledger.seed_system_config(&settings, Utc::now()).await.unwrap();

        let old = Utc::now() - chrono::Duration::days(45);
        ledger
            .record_entry("京A12345", "blue", chrono::Duration::seconds(30), old)
            .await
            .unwrap();
        ledger.record_exit("京A12345", old).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_purges_records_past_retention() {
        let ledger = ledger_with_retention(30).await;
        let service = RetentionService::new(ledger.clone(), Duration::from_secs(3600));
        assert_eq!(service.run_once(Utc::now()).await.unwrap(), 1);
        assert!(ledger.latest_record("京A12345").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_retention_disables_purge() {
        let ledger = ledger_with_retention(0).await;
        let service = RetentionService::new(ledger.clone(), Duration::from_secs(3600));
        assert_eq!(service.run_once(Utc::now()).await.unwrap(), 0);
        assert!(ledger.latest_record("京A12345").await.unwrap().is_some());
    }
}
