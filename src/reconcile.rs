//! One payment row per apartment per month, seeded when missing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::{Apartment, ApartmentId, Payment, PaymentSeed, PaymentStatus, MONTHS};

/// Seeds for every (apartment, month) slot of `year` with no payment yet.
pub fn reconcile(
    apartments: &[Apartment],
    existing: &[Payment],
    year: i32,
    default_fee: Decimal,
) -> Vec<PaymentSeed> {
    let taken: HashSet<(ApartmentId, u32)> = existing
        .iter()
        .filter(|payment| payment.year == year)
        .map(|payment| (payment.apartment_id, payment.month))
        .collect();

    let mut seeds = Vec::new();
    for apartment in apartments {
        let amount = apartment.fee_or(default_fee);
        for month in MONTHS {
            if taken.contains(&(apartment.id, month)) {
                continue;
            }
            seeds.push(PaymentSeed {
                apartment_id: apartment.id,
                year,
                month,
                amount,
                status: PaymentStatus::Unpaid,
            });
        }
    }
    seeds
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoApartments,
    StillLoading,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Every slot already had a payment row.
    UpToDate,
    /// `attempted` seeds were sent, `inserted` of them were new rows.
    Seeded { attempted: usize, inserted: usize },
    Skipped { reason: SkipReason },
}

/// Single-flight flag: at most one reconciliation pass runs at a time.
#[derive(Debug, Default)]
pub struct ReconcileGuard {
    running: AtomicBool,
}

impl ReconcileGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the flag, or returns `None` if another pass holds it.
    pub fn try_begin(&self) -> Option<InFlight<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the [`ReconcileGuard`] when dropped.
#[derive(Debug)]
pub struct InFlight<'a> {
    guard: &'a ReconcileGuard,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}
