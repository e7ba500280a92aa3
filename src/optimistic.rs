use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Payment, PaymentStatus};

/// Applies `mutation` locally, commits it remotely and, if the commit fails,
/// applies `inverse` locally before returning the error.
///
/// Not a transaction: a concurrent write from another session may still win
/// at the store, and the next refetch brings the local copy back in line.
pub async fn apply_optimistically<M, T, E, Fut>(
    mutation: M,
    inverse: M,
    mut apply_local: impl FnMut(&M),
    commit: impl FnOnce(M) -> Fut,
) -> Result<T, E>
where
    M: Clone,
    Fut: Future<Output = Result<T, E>>,
{
    apply_local(&mutation);
    match commit(mutation.clone()).await {
        Ok(value) => Ok(value),
        Err(err) => {
            apply_local(&inverse);
            Err(err)
        }
    }
}

/// The `{status, paid_at}` pair that a toggle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPatch {
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentPatch {
    pub fn of(payment: &Payment) -> Self {
        Self {
            status: payment.status,
            paid_at: payment.paid_at,
        }
    }

    /// PAID stamps `paid_at` with `now`, UNPAID clears it.
    pub fn toggle(payment: &Payment, now: DateTime<Utc>) -> Self {
        let status = payment.status.flipped();
        Self {
            status,
            paid_at: match status {
                PaymentStatus::Paid => Some(now),
                PaymentStatus::Unpaid => None,
            },
        }
    }

    pub fn apply_to(&self, payment: &mut Payment) {
        payment.status = self.status;
        payment.paid_at = self.paid_at;
    }
}
