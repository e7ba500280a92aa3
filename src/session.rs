use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::access::{ensure_not_self, Requirement};
use crate::auth::{Actor, AuthSession, Identity, IdentityProvider};
use crate::config::FeeCascade;
use crate::error::{SyndicError, SyndicResult};
use crate::model::{
    apartment_order, Apartment, ApartmentId, AppSettings, Expense, ExpenseId, NewApartment,
    NewExpense, Payment, PaymentId, Role, UserId, UserProfile, MONTHS_PER_YEAR,
};
use crate::optimistic::{apply_optimistically, PaymentPatch};
use crate::reconcile::{reconcile, ReconcileGuard, ReconcileOutcome, SkipReason};
use crate::store::{
    ChangeEvent, DateRange, Delivery, PaymentFilter, RemoteStore, RowChange, Subscription,
};
use crate::summary::{aggregate, Summary};
use crate::ui_state::{apartment_matches, clamp_year};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Loading {
    pub apartments: bool,
    pub payments: bool,
    pub expenses: bool,
    pub settings: bool,
}

impl Loading {
    const ALL: Self = Self {
        apartments: true,
        payments: true,
        expenses: true,
        settings: true,
    };

    pub fn any(&self) -> bool {
        self.apartments || self.payments || self.expenses || self.settings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub year: i32,
    pub apartments: Vec<Apartment>,
    pub payments: Vec<Payment>,
    pub expenses: Vec<Expense>,
    pub settings: AppSettings,
    pub loading: Loading,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRow {
    pub apartment: Apartment,
    pub months: [Option<Payment>; MONTHS_PER_YEAR],
    pub paid_months: usize,
}

/// Result of saving the building settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsUpdate {
    pub settings: AppSettings,
    pub fee_changed: bool,
    /// `None` when the rewrite was not attempted or failed.
    pub apartments_updated: Option<usize>,
    pub payments_updated: Option<usize>,
}

#[derive(Debug)]
struct DataState {
    year: i32,
    apartments: Vec<Apartment>,
    payments: Vec<Payment>,
    expenses: Vec<Expense>,
    settings: AppSettings,
    loading: Loading,
    /// Set when the last payments fetch failed.
    payments_stale: bool,
    error: Option<String>,
}

impl DataState {
    fn new(year: i32) -> Self {
        Self {
            year,
            apartments: Vec::new(),
            payments: Vec::new(),
            expenses: Vec::new(),
            settings: AppSettings::default(),
            loading: Loading::ALL,
            payments_stale: false,
            error: None,
        }
    }

    fn in_year(&self, expense: &Expense) -> bool {
        DateRange::fiscal_year(self.year).is_some_and(|range| range.contains(expense.date))
    }

    fn apply(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::Apartments(change) => match change {
                RowChange::Insert { new } | RowChange::Update { new } => {
                    upsert_by(&mut self.apartments, new, |a| a.id);
                    self.apartments.sort_by(apartment_order);
                }
                RowChange::Delete { id } => self.apartments.retain(|a| a.id != id),
            },
            ChangeEvent::Payments(change) => match change {
                RowChange::Insert { new } => {
                    if new.year == self.year {
                        upsert_by(&mut self.payments, new, |p| p.id);
                    }
                }
                RowChange::Update { new } => replace_by(&mut self.payments, new, |p| p.id),
                RowChange::Delete { id } => self.payments.retain(|p| p.id != id),
            },
            ChangeEvent::Expenses(change) => match change {
                RowChange::Insert { new } => {
                    if self.in_year(&new) {
                        self.expenses.retain(|e| e.id != new.id);
                        self.expenses.insert(0, new);
                    }
                }
                RowChange::Update { new } => replace_by(&mut self.expenses, new, |e| e.id),
                RowChange::Delete { id } => self.expenses.retain(|e| e.id != id),
            },
        }
    }
}

fn upsert_by<T, K: PartialEq>(rows: &mut Vec<T>, row: T, key: impl Fn(&T) -> K) {
    let id = key(&row);
    match rows.iter_mut().find(|existing| key(existing) == id) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

fn replace_by<T, K: PartialEq>(rows: &mut [T], row: T, key: impl Fn(&T) -> K) {
    let id = key(&row);
    if let Some(existing) = rows.iter_mut().find(|existing| key(existing) == id) {
        *existing = row;
    }
}

pub struct DataSession<S> {
    store: Arc<S>,
    state: Mutex<DataState>,
    reconcile_guard: ReconcileGuard,
    fee_cascade: FeeCascade,
}

impl<S: RemoteStore> DataSession<S> {
    pub fn new(store: Arc<S>, year: i32, fee_cascade: FeeCascade) -> Self {
        Self {
            store,
            state: Mutex::new(DataState::new(clamp_year(year))),
            reconcile_guard: ReconcileGuard::new(),
            fee_cascade,
        }
    }

    fn state(&self) -> MutexGuard<'_, DataState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn year(&self) -> i32 {
        self.state().year
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state();
        Snapshot {
            year: state.year,
            apartments: state.apartments.clone(),
            payments: state.payments.clone(),
            expenses: state.expenses.clone(),
            settings: state.settings.clone(),
            loading: state.loading,
            error: state.error.clone(),
        }
    }

    pub fn apartments(&self) -> Vec<Apartment> {
        self.state().apartments.clone()
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.state().payments.clone()
    }

    pub fn expenses(&self) -> Vec<Expense> {
        self.state().expenses.clone()
    }

    pub fn settings(&self) -> AppSettings {
        self.state().settings.clone()
    }

    pub fn loading(&self) -> Loading {
        self.state().loading
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn dismiss_error(&self) {
        self.state().error = None;
    }

    pub fn clear(&self) {
        let mut state = self.state();
        let year = state.year;
        *state = DataState::new(year);
    }

    fn record_load_error(&self, err: &SyndicError) {
        error!(error = %err, "load failed");
        self.state().error = Some(err.to_string());
    }

    pub async fn fetch_apartments(&self) -> SyndicResult<()> {
        let result = self.store.list_apartments().await;
        let mut state = self.state();
        state.loading.apartments = false;
        let apartments = result.map_err(SyndicError::load("apartments"))?;
        debug!(count = apartments.len(), "apartments loaded");
        state.apartments = apartments;
        Ok(())
    }

    pub async fn fetch_payments(&self) -> SyndicResult<()> {
        let year = self.year();
        let result = self.store.list_payments(PaymentFilter::year(year)).await;
        let mut state = self.state();
        // The year may have moved on while this request was out.
        if state.year != year {
            return Ok(());
        }
        state.loading.payments = false;
        state.payments_stale = result.is_err();
        state.payments = result.map_err(SyndicError::load("payments"))?;
        Ok(())
    }

    pub async fn fetch_expenses(&self) -> SyndicResult<()> {
        let year = self.year();
        let range = DateRange::fiscal_year(year)
            .ok_or_else(|| SyndicError::validation(format!("year {year} out of range")))?;
        let result = self.store.list_expenses(range).await;
        let mut state = self.state();
        if state.year != year {
            return Ok(());
        }
        state.loading.expenses = false;
        state.expenses = result.map_err(SyndicError::load("expenses"))?;
        Ok(())
    }

    pub async fn fetch_settings(&self) -> SyndicResult<()> {
        let result = self.store.fetch_settings().await;
        let mut state = self.state();
        state.loading.settings = false;
        // No row yet: keep the built-in defaults.
        if let Some(settings) = result.map_err(SyndicError::load("settings"))? {
            state.settings = settings;
        }
        Ok(())
    }

    /// On failure the previous data stays in place; the first error is returned.
    pub async fn load_all(&self) -> SyndicResult<()> {
        {
            let mut state = self.state();
            state.loading = Loading::ALL;
            state.error = None;
        }
        let results = [
            self.fetch_apartments().await,
            self.fetch_payments().await,
            self.fetch_expenses().await,
            self.fetch_settings().await,
        ];
        let mut first = None;
        for result in results {
            if let Err(err) = result {
                self.record_load_error(&err);
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub async fn set_year(&self, year: i32) -> SyndicResult<ReconcileOutcome> {
        let year = clamp_year(year);
        let unchanged = {
            let mut state = self.state();
            let unchanged = state.year == year && !state.loading.payments && !state.payments_stale;
            if !unchanged {
                state.year = year;
                state.payments.clear();
                state.expenses.clear();
                state.loading.payments = true;
                state.loading.expenses = true;
            }
            unchanged
        };
        if unchanged {
            return self.reconcile_year().await;
        }
        info!(year, "fiscal year selected");
        for result in [self.fetch_payments().await, self.fetch_expenses().await] {
            if let Err(err) = result {
                self.record_load_error(&err);
                return Err(err);
            }
        }
        self.reconcile_year().await
    }

    pub fn apply_change(&self, event: ChangeEvent) {
        debug!(?event, "realtime change");
        self.state().apply(event);
    }

    /// Applies every pending event from `subscription`. Returns how many
    /// events were applied; a lagged feed triggers a full reload instead.
    pub async fn pump(&self, subscription: &mut Subscription) -> SyndicResult<usize> {
        let apartments_before = self.state().apartments.len();
        let mut applied = 0;
        loop {
            match subscription.poll() {
                Delivery::Event(event) => {
                    self.apply_change(event);
                    applied += 1;
                }
                Delivery::Lagged(missed) => {
                    warn!(missed, "realtime feed lagged, reloading");
                    self.load_all().await?;
                }
                Delivery::Empty | Delivery::Closed => break,
            }
        }
        if self.state().apartments.len() != apartments_before {
            self.reconcile_year().await?;
        }
        Ok(applied)
    }

    pub async fn reconcile_year(&self) -> SyndicResult<ReconcileOutcome> {
        let Some(_in_flight) = self.reconcile_guard.try_begin() else {
            return Ok(ReconcileOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
            });
        };
        let (year, seeds) = {
            let state = self.state();
            if state.apartments.is_empty() {
                return Ok(ReconcileOutcome::Skipped {
                    reason: SkipReason::NoApartments,
                });
            }
            // A partial payment list would seed rows that already exist.
            if state.loading.apartments || state.loading.payments || state.payments_stale {
                return Ok(ReconcileOutcome::Skipped {
                    reason: SkipReason::StillLoading,
                });
            }
            let seeds = reconcile(
                &state.apartments,
                &state.payments,
                state.year,
                state.settings.default_monthly_fee,
            );
            (state.year, seeds)
        };
        if seeds.is_empty() {
            return Ok(ReconcileOutcome::UpToDate);
        }

        let inserted = self
            .store
            .insert_payment_seeds(&seeds)
            .await
            .map_err(SyndicError::write("payment seeds"))?;
        info!(year, attempted = seeds.len(), inserted, "payments reconciled");
        self.fetch_payments().await?;
        Ok(ReconcileOutcome::Seeded {
            attempted: seeds.len(),
            inserted,
        })
    }

    fn patch_local(&self, id: PaymentId, patch: &PaymentPatch) {
        if let Some(payment) = self.state().payments.iter_mut().find(|p| p.id == id) {
            patch.apply_to(payment);
        }
    }

    pub async fn toggle_payment(&self, actor: &Actor, id: PaymentId) -> SyndicResult<Payment> {
        actor.permissions.require(Requirement::Modify)?;
        let current = self
            .state()
            .payments
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| SyndicError::validation(format!("unknown payment #{id}")))?;

        let before = PaymentPatch::of(&current);
        let patch = PaymentPatch::toggle(&current, Utc::now());
        let store = Arc::clone(&self.store);
        apply_optimistically(
            patch,
            before,
            |m: &PaymentPatch| self.patch_local(id, m),
            |m| async move { store.update_payment(id, m).await },
        )
        .await
        .map_err(|err| {
            warn!(payment = id, error = %err, "toggle rolled back");
            SyndicError::write("payment")(err)
        })
    }

    /// Creates an apartment (`id == None`) or edits an existing one.
    pub async fn save_apartment(
        &self,
        actor: &Actor,
        id: Option<ApartmentId>,
        draft: NewApartment,
    ) -> SyndicResult<Apartment> {
        actor.permissions.require(Requirement::Modify)?;
        let draft = draft.normalized()?;
        let (apartment, event) = match id {
            Some(id) => {
                let apartment = self
                    .store
                    .update_apartment(id, draft)
                    .await
                    .map_err(SyndicError::write("apartment"))?;
                let event = RowChange::Update {
                    new: apartment.clone(),
                };
                (apartment, event)
            }
            None => {
                let apartment = self
                    .store
                    .insert_apartment(draft)
                    .await
                    .map_err(SyndicError::write("apartment"))?;
                let event = RowChange::Insert {
                    new: apartment.clone(),
                };
                (apartment, event)
            }
        };
        self.apply_change(ChangeEvent::Apartments(event));
        if id.is_none() {
            self.reconcile_year().await?;
        }
        Ok(apartment)
    }

    /// Removes an apartment. Its payments stay in the store and are ignored.
    pub async fn delete_apartment(&self, actor: &Actor, id: ApartmentId) -> SyndicResult<()> {
        actor.permissions.require(Requirement::Modify)?;
        self.store
            .delete_apartment(id)
            .await
            .map_err(SyndicError::write("apartment"))?;
        self.apply_change(ChangeEvent::Apartments(RowChange::Delete { id }));
        Ok(())
    }

    pub async fn add_expense(&self, actor: &Actor, draft: NewExpense) -> SyndicResult<Expense> {
        actor.permissions.require(Requirement::Modify)?;
        draft.validate()?;
        let expense = self
            .store
            .insert_expense(draft)
            .await
            .map_err(SyndicError::write("expense"))?;
        self.apply_change(ChangeEvent::Expenses(RowChange::Insert {
            new: expense.clone(),
        }));
        Ok(expense)
    }

    pub async fn delete_expense(&self, actor: &Actor, id: ExpenseId) -> SyndicResult<()> {
        actor.permissions.require(Requirement::Modify)?;
        self.store
            .delete_expense(id)
            .await
            .map_err(SyndicError::write("expense"))?;
        self.apply_change(ChangeEvent::Expenses(RowChange::Delete { id }));
        Ok(())
    }

    /// A changed default fee is pushed to every apartment and, under
    /// [`FeeCascade::Global`], to every payment of every year.
    pub async fn update_settings(&self, actor: &Actor, settings: AppSettings) -> SyndicResult<SettingsUpdate> {
        actor.permissions.require(Requirement::ManageUsers)?;
        settings.validate()?;
        // Another session may have changed the fee since this one loaded it.
        let previous_fee = self
            .store
            .fetch_settings()
            .await
            .map_err(SyndicError::load("settings"))?
            .unwrap_or_default()
            .default_monthly_fee;
        self.store
            .upsert_settings(&settings, actor.id.as_str())
            .await
            .map_err(SyndicError::write("settings"))?;

        let fee = settings.default_monthly_fee;
        let fee_changed = fee != previous_fee;
        let mut report = SettingsUpdate {
            settings: settings.clone(),
            fee_changed,
            apartments_updated: None,
            payments_updated: None,
        };
        if fee_changed {
            report.apartments_updated = match self.store.set_all_monthly_totals(fee).await {
                Ok(count) => Some(count),
                Err(err) => {
                    error!(error = %err, "bulk apartment fee update failed");
                    None
                }
            };
            if self.fee_cascade == FeeCascade::Global {
                report.payments_updated = match self.store.set_all_payment_amounts(fee).await {
                    Ok(count) => Some(count),
                    Err(err) => {
                        error!(error = %err, "bulk payment amount update failed");
                        None
                    }
                };
            }
            info!(%fee, cascade = ?self.fee_cascade, "default monthly fee changed");
        }

        self.state().settings = settings;
        if fee_changed {
            for result in [self.fetch_apartments().await, self.fetch_payments().await] {
                if let Err(err) = result {
                    self.record_load_error(&err);
                }
            }
        }
        Ok(report)
    }

    pub fn payment_matrix(&self, search: &str) -> Vec<PaymentRow> {
        let state = self.state();
        let mut apartments: Vec<&Apartment> = state
            .apartments
            .iter()
            .filter(|apt| apartment_matches(apt, search))
            .collect();
        apartments.sort_by(|a, b| apartment_order(a, b));

        apartments
            .into_iter()
            .map(|apartment| {
                let mut months: [Option<Payment>; MONTHS_PER_YEAR] = std::array::from_fn(|_| None);
                for payment in state
                    .payments
                    .iter()
                    .filter(|p| p.apartment_id == apartment.id && p.year == state.year)
                {
                    if let Some(slot) = (payment.month as usize).checked_sub(1).filter(|s| *s < MONTHS_PER_YEAR) {
                        months[slot] = Some(payment.clone());
                    }
                }
                let paid_months = months.iter().flatten().filter(|p| p.is_paid()).count();
                PaymentRow {
                    apartment: apartment.clone(),
                    months,
                    paid_months,
                }
            })
            .collect()
    }

    pub fn summary(&self) -> Summary {
        let state = self.state();
        aggregate(&state.apartments, &state.payments, &state.expenses, state.year)
    }

    pub async fn list_users(&self, actor: &Actor) -> SyndicResult<Vec<UserProfile>> {
        actor.permissions.require(Requirement::ManageUsers)?;
        self.store
            .list_profiles()
            .await
            .map_err(SyndicError::load("profiles"))
    }

    pub async fn update_user_role(&self, actor: &Actor, target: &UserId, role: Role) -> SyndicResult<()> {
        actor.permissions.require(Requirement::ManageUsers)?;
        ensure_not_self(&actor.id, target, "change the role of")?;
        self.store
            .update_role(target, role)
            .await
            .map_err(SyndicError::write("profile"))?;
        info!(user = %target, role = role.as_str(), "role updated");
        Ok(())
    }

    pub async fn delete_user(&self, actor: &Actor, target: &UserId) -> SyndicResult<()> {
        actor.permissions.require(Requirement::ManageUsers)?;
        ensure_not_self(&actor.id, target, "delete")?;
        self.store
            .delete_profile(target)
            .await
            .map_err(SyndicError::write("profile"))?;
        info!(user = %target, "profile removed");
        Ok(())
    }
}

/// Auth plus data for one signed-in user, with the realtime feed attached.
pub struct Workspace<S, P> {
    auth: AuthSession<S, P>,
    data: DataSession<S>,
    store: Arc<S>,
    feed: tokio::sync::Mutex<Option<Subscription>>,
}

impl<S, P> Workspace<S, P>
where
    S: RemoteStore,
    P: IdentityProvider,
{
    pub fn new(store: Arc<S>, provider: Arc<P>, year: i32, fee_cascade: FeeCascade) -> Self {
        Self {
            auth: AuthSession::new(Arc::clone(&store), provider),
            data: DataSession::new(Arc::clone(&store), year, fee_cascade),
            store,
            feed: tokio::sync::Mutex::new(None),
        }
    }

    pub fn auth(&self) -> &AuthSession<S, P> {
        &self.auth
    }

    pub fn data(&self) -> &DataSession<S> {
        &self.data
    }

    pub fn actor(&self) -> SyndicResult<Actor> {
        self.auth.actor()
    }

    pub async fn start(&self) -> SyndicResult<Option<Identity>> {
        let identity = self.auth.restore().await?;
        self.on_identity_changed(identity.is_some()).await;
        Ok(identity)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> SyndicResult<Identity> {
        let identity = self.auth.sign_in(email, password).await?;
        self.on_identity_changed(true).await;
        Ok(identity)
    }

    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> SyndicResult<UserProfile> {
        let profile = self.auth.bootstrap_admin(email, password).await?;
        self.on_identity_changed(true).await;
        Ok(profile)
    }

    pub async fn sign_out(&self) -> SyndicResult<()> {
        self.auth.sign_out().await?;
        self.on_identity_changed(false).await;
        Ok(())
    }

    pub async fn handle_auth_change(&self, identity: Option<Identity>) {
        let signed_in = identity.is_some();
        self.auth.handle_auth_change(identity).await;
        self.on_identity_changed(signed_in).await;
    }

    pub fn is_subscribed(&self) -> bool {
        self.feed.try_lock().map(|feed| feed.is_some()).unwrap_or(true)
    }

    async fn on_identity_changed(&self, signed_in: bool) {
        let mut feed = self.feed.lock().await;
        // Any previous user's feed and data go away first.
        *feed = None;
        self.data.clear();
        if !signed_in {
            info!("realtime feed closed");
            return;
        }
        *feed = Some(self.store.subscribe());
        drop(feed);
        info!("realtime feed opened");
        if self.data.load_all().await.is_ok() {
            if let Err(err) = self.data.reconcile_year().await {
                warn!(error = %err, "reconciliation failed");
            }
        }
    }

    /// Applies pending realtime events; no-op while signed out.
    pub async fn sync(&self) -> SyndicResult<usize> {
        let mut feed = self.feed.lock().await;
        match feed.as_mut() {
            Some(subscription) => self.data.pump(subscription).await,
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Permissions;
    use crate::error::{StoreError, StoreResult};
    use crate::model::{ApartmentStatus, ExpenseCategory, OccupancyType, PaymentSeed, PaymentStatus};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    const YEAR: i32 = 2026;

    fn actor(role: Role) -> Actor {
        Actor {
            id: UserId::new(format!("{}-1", role.as_str())),
            permissions: Permissions::for_role(role),
        }
    }

    fn draft(number: &str, fee: Option<i64>) -> NewApartment {
        NewApartment {
            number: number.to_string(),
            floor: 1,
            resident_name: format!("Resident {number}"),
            resident_cin: None,
            occupancy: OccupancyType::Owner,
            roommates: Vec::new(),
            status: ApartmentStatus::Occupied,
            monthly_total: fee.map(Decimal::from),
            balance: Decimal::ZERO,
            email: None,
            phone: None,
        }
    }

    async fn loaded(store: Arc<SqliteStore>) -> DataSession<SqliteStore> {
        let session = DataSession::new(store, YEAR, FeeCascade::Global);
        session.load_all().await.expect("load");
        session
    }

    #[tokio::test]
    async fn new_apartment_gets_a_full_year() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let session = loaded(store.clone()).await;
        let apartment = session
            .save_apartment(&actor(Role::Editor), None, draft("1", Some(200)))
            .await
            .expect("save");

        let payments = session.payments();
        assert_eq!(payments.len(), 12);
        for month in 1..=12 {
            let slot: Vec<_> = payments
                .iter()
                .filter(|p| p.apartment_id == apartment.id && p.month == month)
                .collect();
            assert_eq!(slot.len(), 1);
            assert_eq!(slot[0].amount, Decimal::from(200));
            assert_eq!(slot[0].status, PaymentStatus::Unpaid);
        }
        assert_eq!(session.reconcile_year().await.expect("again"), ReconcileOutcome::UpToDate);
    }

    #[tokio::test]
    async fn reconcile_skips_without_apartments_or_while_loading() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let session = DataSession::new(store.clone(), YEAR, FeeCascade::Global);
        assert_eq!(
            session.reconcile_year().await.expect("skip"),
            ReconcileOutcome::Skipped {
                reason: SkipReason::NoApartments
            }
        );

        store.insert_apartment(draft("1", None)).await.expect("insert");
        session.fetch_apartments().await.expect("apartments");
        assert_eq!(
            session.reconcile_year().await.expect("skip"),
            ReconcileOutcome::Skipped {
                reason: SkipReason::StillLoading
            }
        );

        session.fetch_payments().await.expect("payments");
        assert_eq!(
            session.reconcile_year().await.expect("seed"),
            ReconcileOutcome::Seeded {
                attempted: 12,
                inserted: 12
            }
        );
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_duplicate_rows() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        for number in ["1", "2", "3"] {
            store.insert_apartment(draft(number, None)).await.expect("insert");
        }
        let first = loaded(store.clone()).await;
        let second = loaded(store.clone()).await;

        let (a, b) = tokio::join!(first.reconcile_year(), second.reconcile_year());
        let inserted = |outcome: ReconcileOutcome| match outcome {
            ReconcileOutcome::Seeded { inserted, .. } => inserted,
            _ => 0,
        };
        assert_eq!(inserted(a.expect("first")) + inserted(b.expect("second")), 36);

        let rows = store.list_payments(PaymentFilter::year(YEAR)).await.expect("list");
        assert_eq!(rows.len(), 36);
        assert_eq!(second.reconcile_year().await.expect("again"), ReconcileOutcome::UpToDate);
    }

    #[tokio::test]
    async fn toggle_stamps_and_clears_paid_at() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let session = loaded(store.clone()).await;
        let editor = actor(Role::Editor);
        session
            .save_apartment(&editor, None, draft("1", Some(200)))
            .await
            .expect("save");
        let id = session.payments()[0].id;

        let paid = session.toggle_payment(&editor, id).await.expect("pay");
        assert_eq!(paid.status, PaymentStatus::Paid);
        assert!(paid.paid_at.is_some());
        assert_eq!(session.payments()[0].status, PaymentStatus::Paid);

        let unpaid = session.toggle_payment(&editor, id).await.expect("unpay");
        assert_eq!(unpaid.status, PaymentStatus::Unpaid);
        assert_eq!(unpaid.paid_at, None);
        assert_eq!(session.payments()[0].paid_at, None);
    }

    #[tokio::test]
    async fn viewer_cannot_toggle() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let session = loaded(store.clone()).await;
        session
            .save_apartment(&actor(Role::Admin), None, draft("1", None))
            .await
            .expect("save");
        let id = session.payments()[0].id;
        let err = session
            .toggle_payment(&actor(Role::Viewer), id)
            .await
            .expect_err("viewer");
        assert!(matches!(err, SyndicError::PermissionDenied(_)));
        assert_eq!(session.payments()[0].status, PaymentStatus::Unpaid);
    }

    /// Delegates to SQLite; payment writes can be failed and seed inserts or
    /// profile fetches held until released.
    struct TestStore {
        inner: SqliteStore,
        fail_updates: AtomicBool,
        fail_payment_list: AtomicBool,
        hold_seeds: AtomicBool,
        seeds_gate: Notify,
        hold_profiles: AtomicBool,
        profile_gate: Notify,
    }

    impl TestStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().expect("store"),
                fail_updates: AtomicBool::new(false),
                fail_payment_list: AtomicBool::new(false),
                hold_seeds: AtomicBool::new(false),
                seeds_gate: Notify::new(),
                hold_profiles: AtomicBool::new(false),
                profile_gate: Notify::new(),
            }
        }

        fn offline() -> StoreError {
            StoreError::Unavailable("network down".to_string())
        }
    }

    #[async_trait]
    impl RemoteStore for TestStore {
        async fn list_apartments(&self) -> StoreResult<Vec<Apartment>> {
            self.inner.list_apartments().await
        }
        async fn insert_apartment(&self, draft: NewApartment) -> StoreResult<Apartment> {
            self.inner.insert_apartment(draft).await
        }
        async fn update_apartment(&self, id: ApartmentId, draft: NewApartment) -> StoreResult<Apartment> {
            self.inner.update_apartment(id, draft).await
        }
        async fn delete_apartment(&self, id: ApartmentId) -> StoreResult<()> {
            self.inner.delete_apartment(id).await
        }
        async fn set_all_monthly_totals(&self, fee: Decimal) -> StoreResult<usize> {
            self.inner.set_all_monthly_totals(fee).await
        }
        async fn list_payments(&self, filter: PaymentFilter) -> StoreResult<Vec<Payment>> {
            if self.fail_payment_list.load(Ordering::SeqCst) {
                return Err(Self::offline());
            }
            self.inner.list_payments(filter).await
        }
        async fn insert_payment_seeds(&self, seeds: &[PaymentSeed]) -> StoreResult<usize> {
            if self.hold_seeds.load(Ordering::SeqCst) {
                self.seeds_gate.notified().await;
            }
            self.inner.insert_payment_seeds(seeds).await
        }
        async fn update_payment(&self, id: PaymentId, patch: PaymentPatch) -> StoreResult<Payment> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(Self::offline());
            }
            self.inner.update_payment(id, patch).await
        }
        async fn set_all_payment_amounts(&self, amount: Decimal) -> StoreResult<usize> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(Self::offline());
            }
            self.inner.set_all_payment_amounts(amount).await
        }
        async fn list_expenses(&self, range: DateRange) -> StoreResult<Vec<Expense>> {
            self.inner.list_expenses(range).await
        }
        async fn insert_expense(&self, draft: NewExpense) -> StoreResult<Expense> {
            self.inner.insert_expense(draft).await
        }
        async fn delete_expense(&self, id: ExpenseId) -> StoreResult<()> {
            self.inner.delete_expense(id).await
        }
        async fn fetch_settings(&self) -> StoreResult<Option<AppSettings>> {
            self.inner.fetch_settings().await
        }
        async fn upsert_settings(&self, settings: &AppSettings, updated_by: &str) -> StoreResult<()> {
            self.inner.upsert_settings(settings, updated_by).await
        }
        async fn fetch_profile(&self, id: &UserId) -> StoreResult<Option<UserProfile>> {
            if self.hold_profiles.load(Ordering::SeqCst) {
                self.profile_gate.notified().await;
            }
            self.inner.fetch_profile(id).await
        }
        async fn list_profiles(&self) -> StoreResult<Vec<UserProfile>> {
            self.inner.list_profiles().await
        }
        async fn upsert_profile(&self, profile: &UserProfile) -> StoreResult<()> {
            self.inner.upsert_profile(profile).await
        }
        async fn update_role(&self, id: &UserId, role: Role) -> StoreResult<()> {
            self.inner.update_role(id, role).await
        }
        async fn delete_profile(&self, id: &UserId) -> StoreResult<()> {
            self.inner.delete_profile(id).await
        }
        fn subscribe(&self) -> Subscription {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn failed_toggle_restores_previous_state() {
        let store = Arc::new(TestStore::new());
        let session = DataSession::new(store.clone(), YEAR, FeeCascade::Global);
        session.load_all().await.expect("load");
        let editor = actor(Role::Editor);
        session
            .save_apartment(&editor, None, draft("1", None))
            .await
            .expect("save");
        let id = session.payments()[0].id;
        session.toggle_payment(&editor, id).await.expect("pay");
        let before = session.payments()[0].clone();

        store.fail_updates.store(true, Ordering::SeqCst);
        let err = session.toggle_payment(&editor, id).await.expect_err("offline");
        assert!(matches!(err, SyndicError::Write { what: "payment", .. }));
        assert_eq!(session.payments()[0], before);
    }

    #[tokio::test]
    async fn failed_bulk_rewrite_is_reported_not_fatal() {
        let store = Arc::new(TestStore::new());
        store.fail_updates.store(true, Ordering::SeqCst);
        let session = DataSession::new(store.clone(), YEAR, FeeCascade::Global);
        session.load_all().await.expect("load");
        let settings = AppSettings {
            default_monthly_fee: Decimal::from(300),
            ..AppSettings::default()
        };
        let report = session
            .update_settings(&actor(Role::Admin), settings)
            .await
            .expect("settings saved");
        assert!(report.fee_changed);
        assert_eq!(report.apartments_updated, Some(0));
        assert_eq!(report.payments_updated, None);
    }

    #[tokio::test]
    async fn overlapping_reconciliation_is_skipped() {
        let store = Arc::new(TestStore::new());
        store.inner.insert_apartment(draft("1", None)).await.expect("insert");
        let session = DataSession::new(store.clone(), YEAR, FeeCascade::Global);
        session.load_all().await.expect("load");

        store.hold_seeds.store(true, Ordering::SeqCst);
        let (first, second) = tokio::join!(session.reconcile_year(), async {
            tokio::task::yield_now().await;
            let second = session.reconcile_year().await;
            store.seeds_gate.notify_one();
            second
        });
        assert_eq!(
            first.expect("first"),
            ReconcileOutcome::Seeded {
                attempted: 12,
                inserted: 12
            }
        );
        assert_eq!(
            second.expect("second"),
            ReconcileOutcome::Skipped {
                reason: SkipReason::AlreadyRunning
            }
        );
    }

    #[tokio::test]
    async fn failed_payment_fetch_blocks_reconciliation_until_reloaded() {
        let store = Arc::new(TestStore::new());
        store.inner.insert_apartment(draft("1", None)).await.expect("insert");
        store.fail_payment_list.store(true, Ordering::SeqCst);
        let session = DataSession::new(store.clone(), YEAR, FeeCascade::Global);
        assert!(session.load_all().await.is_err());
        assert!(session.error().is_some());
        assert_eq!(
            session.reconcile_year().await.expect("skip"),
            ReconcileOutcome::Skipped {
                reason: SkipReason::StillLoading
            }
        );

        store.fail_payment_list.store(false, Ordering::SeqCst);
        session.fetch_payments().await.expect("payments");
        assert!(matches!(
            session.reconcile_year().await.expect("seed"),
            ReconcileOutcome::Seeded { inserted: 12, .. }
        ));
    }

    #[tokio::test]
    async fn actor_taken_while_profile_loads_cannot_write() {
        let store = Arc::new(TestStore::new());
        let provider = Arc::new(store.inner.clone());
        let admin = provider.sign_up("admin@building.test", "pw").await.expect("sign up");
        store
            .upsert_profile(&UserProfile {
                role: Role::Admin,
                ..UserProfile::transient_viewer(admin.id.clone(), admin.email.clone())
            })
            .await
            .expect("profile");
        let auth = AuthSession::new(store.clone(), provider);
        let session = DataSession::new(store.clone(), YEAR, FeeCascade::Global);

        store.hold_profiles.store(true, Ordering::SeqCst);
        let (signed_in, mid_load) = tokio::join!(auth.sign_in("admin@building.test", "pw"), async {
            tokio::task::yield_now().await;
            let actor = auth.actor();
            store.profile_gate.notify_one();
            actor
        });
        signed_in.expect("sign in");
        let mid_load = mid_load.expect("identity is known");
        assert_eq!(mid_load.permissions, Permissions::PENDING);
        assert!(matches!(
            session.update_settings(&mid_load, AppSettings::default()).await,
            Err(SyndicError::PermissionDenied(_))
        ));

        let loaded = auth.actor().expect("actor");
        assert!(loaded.permissions.can_manage_users);
    }

    #[tokio::test]
    async fn stale_session_still_cascades_fee_change() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let admin = actor(Role::Admin);
        let first = loaded(store.clone()).await;
        first
            .save_apartment(&admin, None, draft("1", None))
            .await
            .expect("save");
        let second = loaded(store.clone()).await;

        let raised = AppSettings {
            default_monthly_fee: Decimal::from(250),
            ..AppSettings::default()
        };
        second.update_settings(&admin, raised).await.expect("raise");

        // The first session still holds the old 200 fee.
        let report = first
            .update_settings(&admin, AppSettings::default())
            .await
            .expect("lower");
        assert!(report.fee_changed);
        let apartments = store.list_apartments().await.expect("apartments");
        assert_eq!(apartments[0].monthly_total, Some(Decimal::from(200)));
        let payments = store.list_payments(PaymentFilter::default()).await.expect("payments");
        assert!(payments.iter().all(|p| p.amount == Decimal::from(200)));
    }

    #[tokio::test]
    async fn fee_change_rewrites_every_year() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let admin = actor(Role::Admin);
        let session = loaded(store.clone()).await;
        session
            .save_apartment(&admin, None, draft("1", Some(200)))
            .await
            .expect("save");
        session.set_year(2030).await.expect("other year");
        session.set_year(YEAR).await.expect("back");

        let settings = AppSettings {
            default_monthly_fee: Decimal::from(250),
            ..AppSettings::default()
        };
        let report = session.update_settings(&admin, settings).await.expect("update");
        assert_eq!(report.apartments_updated, Some(1));
        assert_eq!(report.payments_updated, Some(24));

        let all = store.list_payments(PaymentFilter::default()).await.expect("list");
        assert_eq!(all.len(), 24);
        assert!(all.iter().all(|p| p.amount == Decimal::from(250)));
        assert_eq!(session.apartments()[0].monthly_total, Some(Decimal::from(250)));
        assert!(session.payments().iter().all(|p| p.amount == Decimal::from(250)));
    }

    #[tokio::test]
    async fn apartments_only_cascade_keeps_payment_history() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let admin = actor(Role::Admin);
        let session = DataSession::new(store.clone(), YEAR, FeeCascade::ApartmentsOnly);
        session.load_all().await.expect("load");
        session
            .save_apartment(&admin, None, draft("1", Some(200)))
            .await
            .expect("save");
        let settings = AppSettings {
            default_monthly_fee: Decimal::from(250),
            ..AppSettings::default()
        };
        let report = session.update_settings(&admin, settings).await.expect("update");
        assert_eq!(report.payments_updated, None);
        assert!(session.payments().iter().all(|p| p.amount == Decimal::from(200)));
    }

    #[tokio::test]
    async fn settings_require_admin() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let session = loaded(store).await;
        let err = session
            .update_settings(&actor(Role::Editor), AppSettings::default())
            .await
            .expect_err("editor");
        assert!(matches!(err, SyndicError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn realtime_events_follow_selected_year() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let session = loaded(store.clone()).await;
        let mut feed = store.subscribe();

        let apartment = store.insert_apartment(draft("7", Some(100))).await.expect("insert");
        let next_year: Vec<PaymentSeed> = (1..=12)
            .map(|month| PaymentSeed {
                apartment_id: apartment.id,
                year: YEAR + 1,
                month,
                amount: Decimal::from(100),
                status: PaymentStatus::Unpaid,
            })
            .collect();
        store.insert_payment_seeds(&next_year).await.expect("seed");
        store
            .insert_expense(NewExpense {
                category: ExpenseCategory::Water,
                amount: Decimal::from(40),
                description: "meter".to_string(),
                date: NaiveDate::from_ymd_opt(YEAR, 5, 2).expect("date"),
            })
            .await
            .expect("expense");

        let applied = session.pump(&mut feed).await.expect("pump");
        // 1 apartment + 12 payments + 1 expense events.
        assert_eq!(applied, 14);
        assert_eq!(session.apartments().len(), 1);
        assert_eq!(session.expenses().len(), 1);
        // Only the selected year's rows: the pump's own reconciliation seeded them.
        assert!(session.payments().iter().all(|p| p.year == YEAR));
        assert_eq!(session.payments().len(), 12);
    }

    #[tokio::test]
    async fn orphaned_payments_are_left_out_of_summary() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let editor = actor(Role::Editor);
        let session = loaded(store.clone()).await;
        let keep = session.save_apartment(&editor, None, draft("1", None)).await.expect("save");
        let gone = session.save_apartment(&editor, None, draft("2", None)).await.expect("save");
        let paid_id = session
            .payments()
            .iter()
            .find(|p| p.apartment_id == gone.id)
            .map(|p| p.id)
            .expect("payment");
        session.toggle_payment(&editor, paid_id).await.expect("pay");
        session.delete_apartment(&editor, gone.id).await.expect("delete");

        assert_eq!(session.payments().len(), 24);
        let summary = session.summary();
        assert_eq!(summary.total_apartments, 1);
        assert_eq!(summary.total_paid_records, 0);
        assert_eq!(summary.apartments[0].apartment_id, keep.id);
    }

    #[tokio::test]
    async fn payment_matrix_fills_twelve_slots() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let editor = actor(Role::Editor);
        let session = loaded(store.clone()).await;
        session.save_apartment(&editor, None, draft("10", None)).await.expect("save");
        session.save_apartment(&editor, None, draft("2", None)).await.expect("save");

        let rows = session.payment_matrix("");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].apartment.number, "2");
        assert!(rows.iter().all(|row| row.months.iter().all(Option::is_some)));

        let filtered = session.payment_matrix("resident 10");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].apartment.number, "10");
    }

    #[tokio::test]
    async fn expenses_outside_year_are_not_kept() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let editor = actor(Role::Editor);
        let session = loaded(store.clone()).await;
        let expense = |year| NewExpense {
            category: ExpenseCategory::Maintenance,
            amount: Decimal::from(120),
            description: "elevator".to_string(),
            date: NaiveDate::from_ymd_opt(year, 3, 1).expect("date"),
        };
        session.add_expense(&editor, expense(YEAR)).await.expect("add");
        session.add_expense(&editor, expense(YEAR + 1)).await.expect("add");
        assert_eq!(session.expenses().len(), 1);

        let invalid = NewExpense {
            amount: Decimal::ZERO,
            ..expense(YEAR)
        };
        assert!(matches!(
            session.add_expense(&editor, invalid).await,
            Err(SyndicError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn admins_cannot_demote_or_delete_themselves() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let session = loaded(store).await;
        let admin = actor(Role::Admin);
        assert!(matches!(
            session.update_user_role(&admin, &admin.id, Role::Viewer).await,
            Err(SyndicError::SelfAction(_))
        ));
        assert!(matches!(
            session.delete_user(&admin, &admin.id).await,
            Err(SyndicError::SelfAction(_))
        ));
        assert!(matches!(
            session.list_users(&actor(Role::Editor)).await,
            Err(SyndicError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn workspace_opens_and_closes_feed_with_identity() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let workspace = Workspace::new(store.clone(), store.clone(), YEAR, FeeCascade::Global);
        assert_eq!(workspace.start().await.expect("start"), None);
        assert!(!workspace.is_subscribed());

        workspace
            .bootstrap_admin("admin@building.test", "pw")
            .await
            .expect("bootstrap");
        assert!(workspace.is_subscribed());
        let admin = workspace.actor().expect("actor");
        assert!(admin.permissions.can_manage_users);

        store.insert_apartment(draft("3", None)).await.expect("insert elsewhere");
        workspace.sync().await.expect("sync");
        assert_eq!(workspace.data().apartments().len(), 1);
        assert_eq!(workspace.data().payments().len(), 12);

        workspace.sign_out().await.expect("sign out");
        assert!(!workspace.is_subscribed());
        assert!(workspace.data().apartments().is_empty());
        assert_eq!(workspace.sync().await.expect("sync"), 0);
    }
}
