//! Port to the backend that owns every building row.

mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::StoreResult;
use crate::model::{
    Apartment, ApartmentId, AppSettings, Expense, ExpenseId, NewApartment, NewExpense, Payment,
    PaymentId, PaymentSeed, Role, UserId, UserProfile,
};
use crate::optimistic::PaymentPatch;

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentFilter {
    pub year: Option<i32>,
    pub apartment_id: Option<ApartmentId>,
}

impl PaymentFilter {
    pub fn year(year: i32) -> Self {
        Self {
            year: Some(year),
            apartment_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// January 1st to December 31st of `year`.
    pub fn fiscal_year(year: i32) -> Option<Self> {
        Some(Self {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
        })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// A row-level change published on the realtime feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "UPPERCASE")]
pub enum RowChange<T, Id> {
    Insert { new: T },
    Update { new: T },
    Delete { id: Id },
}

/// One event of the shared feed, tagged by the table it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "table", content = "change", rename_all = "snake_case")]
pub enum ChangeEvent {
    Apartments(RowChange<Apartment, ApartmentId>),
    Payments(RowChange<Payment, PaymentId>),
    Expenses(RowChange<Expense, ExpenseId>),
}

/// Realtime subscription; dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ChangeEvent>,
}

/// What [`Subscription::poll`] found.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(ChangeEvent),
    /// Events were dropped; the receiver must refetch everything.
    Lagged(u64),
    Empty,
    Closed,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Delivery {
        match self.receiver.recv().await {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Delivery::Lagged(missed),
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }

    pub fn poll(&mut self) -> Delivery {
        match self.receiver.try_recv() {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Delivery::Lagged(missed),
            Err(broadcast::error::TryRecvError::Empty) => Delivery::Empty,
            Err(broadcast::error::TryRecvError::Closed) => Delivery::Closed,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Apartments ordered by floor, then number.
    async fn list_apartments(&self) -> StoreResult<Vec<Apartment>>;
    async fn insert_apartment(&self, draft: NewApartment) -> StoreResult<Apartment>;
    async fn update_apartment(&self, id: ApartmentId, draft: NewApartment) -> StoreResult<Apartment>;
    /// Leaves the apartment's payments in place.
    async fn delete_apartment(&self, id: ApartmentId) -> StoreResult<()>;
    /// Rewrites every apartment's fee; returns the number of rows touched.
    async fn set_all_monthly_totals(&self, fee: Decimal) -> StoreResult<usize>;

    async fn list_payments(&self, filter: PaymentFilter) -> StoreResult<Vec<Payment>>;
    /// Inserts seeds, silently skipping any that collide on
    /// `(apartment_id, month, year)`. Returns how many rows were new.
    async fn insert_payment_seeds(&self, seeds: &[PaymentSeed]) -> StoreResult<usize>;
    async fn update_payment(&self, id: PaymentId, patch: PaymentPatch) -> StoreResult<Payment>;
    /// Rewrites every payment's amount, all years included.
    async fn set_all_payment_amounts(&self, amount: Decimal) -> StoreResult<usize>;

    /// Expenses inside `range`, newest first.
    async fn list_expenses(&self, range: DateRange) -> StoreResult<Vec<Expense>>;
    async fn insert_expense(&self, draft: NewExpense) -> StoreResult<Expense>;
    async fn delete_expense(&self, id: ExpenseId) -> StoreResult<()>;

    async fn fetch_settings(&self) -> StoreResult<Option<AppSettings>>;
    async fn upsert_settings(&self, settings: &AppSettings, updated_by: &str) -> StoreResult<()>;

    async fn fetch_profile(&self, id: &UserId) -> StoreResult<Option<UserProfile>>;
    /// Profiles, newest first.
    async fn list_profiles(&self) -> StoreResult<Vec<UserProfile>>;
    async fn upsert_profile(&self, profile: &UserProfile) -> StoreResult<()>;
    async fn update_role(&self, id: &UserId, role: Role) -> StoreResult<()>;
    async fn delete_profile(&self, id: &UserId) -> StoreResult<()>;

    fn subscribe(&self) -> Subscription;
}
