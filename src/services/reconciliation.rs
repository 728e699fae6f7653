//! Periodic re-check of orders left `pending` after verification gave up.

use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

use super::orders::OrderService;
use super::verification::PaymentVerifier;
use crate::{errors::ServiceError, metrics};

const BATCH_SIZE: u64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub errors: usize,
}

/// Re-polls each stale pending order once. Indeterminate answers leave the
/// order pending.
pub async fn sweep_once(
    orders: &OrderService,
    verifier: &PaymentVerifier,
    min_age: Duration,
) -> Result<SweepReport, ServiceError> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(min_age)
            .map_err(|e| ServiceError::InternalError(format!("reconciliation age: {}", e)))?;
    let candidates = orders.pending_for_reconciliation(cutoff, BATCH_SIZE).await?;

    let mut report = SweepReport {
        checked: candidates.len(),
        ..SweepReport::default()
    };
    for order in &candidates {
        match verifier.verify_once(order).await {
            Ok(Some(outcome)) => {
                report.resolved += 1;
                metrics::increment_counter(metrics::RECONCILIATION_RESOLVED);
                info!(order_id = %order.id, status = %outcome.status, "reconciled pending order");
            }
            Ok(None) => report.still_pending += 1,
            Err(e) => {
                report.errors += 1;
                error!(order_id = %order.id, error = %e, "reconciliation check failed");
            }
        }
    }
    Ok(report)
}

pub fn start_worker(
    orders: OrderService,
    verifier: PaymentVerifier,
    interval: Duration,
    min_age: Duration,
) {
    info!(?interval, ?min_age, "starting payment reconciliation worker");
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            match sweep_once(&orders, &verifier, min_age).await {
                Ok(report) if report.checked > 0 => info!(?report, "reconciliation sweep finished"),
                Ok(_) => debug!("reconciliation sweep found nothing to do"),
                Err(e) => error!("reconciliation worker error: {}", e),
            }
        }
    });
}
