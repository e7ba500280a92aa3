use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use super::{
    schema, ChangeEvent, DateRange, PaymentFilter, RemoteStore, RowChange, Subscription,
};
use crate::auth::{AuthError, Identity, IdentityProvider};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    sort_apartments, Apartment, ApartmentId, AppSettings, Expense, ExpenseId, NewApartment,
    NewExpense, Payment, PaymentId, PaymentSeed, Role, Roommate, UserId, UserProfile,
    SETTINGS_KEY,
};
use crate::optimistic::PaymentPatch;

const FEED_CAPACITY: usize = 256;

const APARTMENT_COLUMNS: &str = "id, number, floor, resident_name, resident_cin, occupancy_type, \
     roommates_data, status, monthly_total, balance, email, phone";
const PAYMENT_COLUMNS: &str = "id, apartment_id, year, month, amount, status, paid_ts_utc";
const EXPENSE_COLUMNS: &str = "id, category, amount, description, date_local";
const PROFILE_COLUMNS: &str = "id, email, display_name, role, created_ts_utc";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    feed: broadcast::Sender<ChangeEvent>,
    session: Arc<watch::Sender<Option<Identity>>>,
}

impl SqliteStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = schema::open_connection(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::init_db(&conn)?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (session, _) = watch::channel(None);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed,
            session: Arc::new(session),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine: nobody is listening yet.
        let _ = self.feed.send(event);
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|err| conversion_error(idx, err))
}

fn parse_opt_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| value.parse())
        .transpose()
        .map_err(|err| conversion_error(idx, err))
}

fn utc_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    Ok(millis.and_then(DateTime::from_timestamp_millis))
}

fn apartment_from_row(row: &Row<'_>) -> rusqlite::Result<Apartment> {
    let roommates_raw: String = row.get(6)?;
    let roommates: Vec<Roommate> =
        serde_json::from_str(&roommates_raw).map_err(|err| conversion_error(6, err))?;
    Ok(Apartment {
        id: row.get(0)?,
        number: row.get(1)?,
        floor: row.get(2)?,
        resident_name: row.get(3)?,
        resident_cin: row.get(4)?,
        occupancy: parse_at(row, 5)?,
        roommates,
        status: parse_at(row, 7)?,
        monthly_total: parse_opt_at(row, 8)?,
        balance: parse_at(row, 9)?,
        email: row.get(10)?,
        phone: row.get(11)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        apartment_id: row.get(1)?,
        year: row.get(2)?,
        month: row.get(3)?,
        amount: parse_at(row, 4)?,
        status: parse_at(row, 5)?,
        paid_at: utc_at(row, 6)?,
    })
}

fn expense_from_row(row: &Row<'_>) -> rusqlite::Result<Expense> {
    Ok(Expense {
        id: row.get(0)?,
        category: parse_at(row, 1)?,
        amount: parse_at(row, 2)?,
        description: row.get(3)?,
        date: parse_at(row, 4)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    let id: String = row.get(0)?;
    Ok(UserProfile {
        id: UserId::new(id),
        email: row.get(1)?,
        display_name: row.get(2)?,
        role: parse_at(row, 3)?,
        created_at: utc_at(row, 4)?.unwrap_or_default(),
    })
}

fn roommates_json(roommates: &[Roommate]) -> StoreResult<String> {
    serde_json::to_string(roommates).map_err(|err| StoreError::corrupt("apartments", err.to_string()))
}

fn select_apartments(conn: &Connection) -> StoreResult<Vec<Apartment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APARTMENT_COLUMNS} FROM apartments ORDER BY floor ASC, number ASC"
    ))?;
    let rows = stmt.query_map([], apartment_from_row)?;
    let mut apartments = Vec::new();
    for row in rows {
        apartments.push(row?);
    }
    // SQL orders "10" before "2"; re-sort with digit runs compared numerically.
    sort_apartments(&mut apartments);
    Ok(apartments)
}

fn select_payments(conn: &Connection, filter: PaymentFilter) -> StoreResult<Vec<Payment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments
         WHERE (?1 IS NULL OR year = ?1) AND (?2 IS NULL OR apartment_id = ?2)
         ORDER BY apartment_id, year, month"
    ))?;
    let rows = stmt.query_map(params![filter.year, filter.apartment_id], payment_from_row)?;
    let mut payments = Vec::new();
    for row in rows {
        payments.push(row?);
    }
    Ok(payments)
}

fn fetch_payment(conn: &Connection, id: PaymentId) -> StoreResult<Payment> {
    conn.query_row(
        &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"),
        [id],
        payment_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("payments", id))
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn list_apartments(&self) -> StoreResult<Vec<Apartment>> {
        let conn = self.conn()?;
        select_apartments(&conn)
    }

    async fn insert_apartment(&self, draft: NewApartment) -> StoreResult<Apartment> {
        let apartment = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO apartments (number, floor, resident_name, resident_cin, occupancy_type,
                   roommates_data, status, monthly_total, balance, email, phone)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    draft.number,
                    draft.floor,
                    draft.resident_name,
                    draft.resident_cin,
                    draft.occupancy.as_str(),
                    roommates_json(&draft.roommates)?,
                    draft.status.as_str(),
                    draft.monthly_total.map(|fee| fee.to_string()),
                    draft.balance.to_string(),
                    draft.email,
                    draft.phone,
                ],
            )?;
            draft.with_id(conn.last_insert_rowid())
        };
        debug!(apartment = apartment.id, "apartment inserted");
        self.publish(ChangeEvent::Apartments(RowChange::Insert {
            new: apartment.clone(),
        }));
        Ok(apartment)
    }

    async fn update_apartment(&self, id: ApartmentId, draft: NewApartment) -> StoreResult<Apartment> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE apartments SET number = ?1, floor = ?2, resident_name = ?3, resident_cin = ?4,
                   occupancy_type = ?5, roommates_data = ?6, status = ?7, monthly_total = ?8,
                   balance = ?9, email = ?10, phone = ?11
                 WHERE id = ?12",
                params![
                    draft.number,
                    draft.floor,
                    draft.resident_name,
                    draft.resident_cin,
                    draft.occupancy.as_str(),
                    roommates_json(&draft.roommates)?,
                    draft.status.as_str(),
                    draft.monthly_total.map(|fee| fee.to_string()),
                    draft.balance.to_string(),
                    draft.email,
                    draft.phone,
                    id,
                ],
            )?
        };
        if changed == 0 {
            return Err(StoreError::not_found("apartments", id));
        }
        let apartment = draft.with_id(id);
        self.publish(ChangeEvent::Apartments(RowChange::Update {
            new: apartment.clone(),
        }));
        Ok(apartment)
    }

    async fn delete_apartment(&self, id: ApartmentId) -> StoreResult<()> {
        let removed = self
            .conn()?
            .execute("DELETE FROM apartments WHERE id = ?1", params![id])?;
        if removed > 0 {
            self.publish(ChangeEvent::Apartments(RowChange::Delete { id }));
        }
        Ok(())
    }

    async fn set_all_monthly_totals(&self, fee: Decimal) -> StoreResult<usize> {
        let (changed, apartments) = {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE apartments SET monthly_total = ?1",
                params![fee.to_string()],
            )?;
            (changed, select_apartments(&conn)?)
        };
        for apartment in apartments {
            self.publish(ChangeEvent::Apartments(RowChange::Update { new: apartment }));
        }
        Ok(changed)
    }

    async fn list_payments(&self, filter: PaymentFilter) -> StoreResult<Vec<Payment>> {
        let conn = self.conn()?;
        select_payments(&conn, filter)
    }

    async fn insert_payment_seeds(&self, seeds: &[PaymentSeed]) -> StoreResult<usize> {
        let inserted = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let created = now_millis();
            let mut inserted = Vec::new();
            for seed in seeds {
                let changed = tx.execute(
                    "INSERT OR IGNORE INTO payments (apartment_id, year, month, amount, status, paid_ts_utc, created_ts_utc)
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
                    params![
                        seed.apartment_id,
                        seed.year,
                        seed.month,
                        seed.amount.to_string(),
                        seed.status.as_str(),
                        created,
                    ],
                )?;
                if changed == 1 {
                    inserted.push(Payment {
                        id: tx.last_insert_rowid(),
                        apartment_id: seed.apartment_id,
                        year: seed.year,
                        month: seed.month,
                        amount: seed.amount,
                        status: seed.status,
                        paid_at: None,
                    });
                }
            }
            tx.commit()?;
            inserted
        };
        let count = inserted.len();
        debug!(attempted = seeds.len(), inserted = count, "payment seeds written");
        for payment in inserted {
            self.publish(ChangeEvent::Payments(RowChange::Insert { new: payment }));
        }
        Ok(count)
    }

    async fn update_payment(&self, id: PaymentId, patch: PaymentPatch) -> StoreResult<Payment> {
        let payment = {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE payments SET status = ?1, paid_ts_utc = ?2 WHERE id = ?3",
                params![
                    patch.status.as_str(),
                    patch.paid_at.map(|at| at.timestamp_millis()),
                    id
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("payments", id));
            }
            fetch_payment(&conn, id)?
        };
        self.publish(ChangeEvent::Payments(RowChange::Update {
            new: payment.clone(),
        }));
        Ok(payment)
    }

    async fn set_all_payment_amounts(&self, amount: Decimal) -> StoreResult<usize> {
        let (changed, payments) = {
            let conn = self.conn()?;
            let changed = conn.execute("UPDATE payments SET amount = ?1", params![amount.to_string()])?;
            (changed, select_payments(&conn, PaymentFilter::default())?)
        };
        for payment in payments {
            self.publish(ChangeEvent::Payments(RowChange::Update { new: payment }));
        }
        Ok(changed)
    }

    async fn list_expenses(&self, range: DateRange) -> StoreResult<Vec<Expense>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses
             WHERE date_local >= ?1 AND date_local <= ?2
             ORDER BY date_local DESC, id DESC"
        ))?;
        let rows = stmt.query_map(
            params![range.start.to_string(), range.end.to_string()],
            expense_from_row,
        )?;
        let mut expenses = Vec::new();
        for row in rows {
            expenses.push(row?);
        }
        Ok(expenses)
    }

    async fn insert_expense(&self, draft: NewExpense) -> StoreResult<Expense> {
        let expense = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO expenses (category, amount, description, date_local, created_ts_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    draft.category.as_str(),
                    draft.amount.to_string(),
                    draft.description,
                    draft.date.to_string(),
                    now_millis(),
                ],
            )?;
            draft.with_id(conn.last_insert_rowid())
        };
        self.publish(ChangeEvent::Expenses(RowChange::Insert {
            new: expense.clone(),
        }));
        Ok(expense)
    }

    async fn delete_expense(&self, id: ExpenseId) -> StoreResult<()> {
        let removed = self
            .conn()?
            .execute("DELETE FROM expenses WHERE id = ?1", params![id])?;
        if removed > 0 {
            self.publish(ChangeEvent::Expenses(RowChange::Delete { id }));
        }
        Ok(())
    }

    async fn fetch_settings(&self) -> StoreResult<Option<AppSettings>> {
        let conn = self.conn()?;
        let settings = conn
            .query_row(
                "SELECT building_name, building_address, default_monthly_fee, currency
                 FROM settings WHERE id = ?1",
                [SETTINGS_KEY],
                |row| {
                    Ok(AppSettings {
                        building_name: row.get(0)?,
                        building_address: row.get(1)?,
                        default_monthly_fee: parse_at(row, 2)?,
                        currency: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(settings)
    }

    async fn upsert_settings(&self, settings: &AppSettings, updated_by: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO settings (id, building_name, building_address, default_monthly_fee, currency, updated_ts_utc, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
               building_name = excluded.building_name,
               building_address = excluded.building_address,
               default_monthly_fee = excluded.default_monthly_fee,
               currency = excluded.currency,
               updated_ts_utc = excluded.updated_ts_utc,
               updated_by = excluded.updated_by",
            params![
                SETTINGS_KEY,
                settings.building_name,
                settings.building_address,
                settings.default_monthly_fee.to_string(),
                settings.currency,
                now_millis(),
                updated_by,
            ],
        )?;
        Ok(())
    }

    async fn fetch_profile(&self, id: &UserId) -> StoreResult<Option<UserProfile>> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?1"),
                [id.as_str()],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    async fn list_profiles(&self) -> StoreResult<Vec<UserProfile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY created_ts_utc DESC"
        ))?;
        let rows = stmt.query_map([], profile_from_row)?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO profiles (id, email, display_name, role, created_ts_utc)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               email = excluded.email,
               display_name = excluded.display_name,
               role = excluded.role",
            params![
                profile.id.as_str(),
                profile.email,
                profile.display_name,
                profile.role.as_str(),
                profile.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn update_role(&self, id: &UserId, role: Role) -> StoreResult<()> {
        let changed = self.conn()?.execute(
            "UPDATE profiles SET role = ?1 WHERE id = ?2",
            params![role.as_str(), id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("profiles", id));
        }
        Ok(())
    }

    async fn delete_profile(&self, id: &UserId) -> StoreResult<()> {
        self.conn()?
            .execute("DELETE FROM profiles WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.feed.subscribe())
    }
}

/// Argon2id PHC string, salted with fresh random bytes.
fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|err| AuthError::Hashing(err.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hashing(err.to_string()))
}

fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored)
        .map_err(|err| AuthError::Store(StoreError::corrupt("identities", err.to_string())))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl IdentityProvider for SqliteStore {
    async fn current_identity(&self) -> Result<Option<Identity>, AuthError> {
        Ok(self.session.borrow().clone())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = normalize_email(email);
        let stored: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT id, password_hash FROM identities WHERE email = ?1",
                [email.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::from)?;
        let Some((id, hash)) = stored else {
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        let identity = Identity {
            id: UserId::new(id),
            email,
        };
        self.session.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = normalize_email(email);
        let id = uuid::Uuid::new_v4().to_string();
        let hash = hash_password(password)?;
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO identities (id, email, password_hash, created_ts_utc)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, email, hash, now_millis()],
        )
        .map_err(StoreError::from)?;
        if inserted == 0 {
            return Err(AuthError::AlreadyRegistered(email));
        }
        let identity = Identity {
            id: UserId::new(id),
            email,
        };
        self.session.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.session.send_replace(None);
        Ok(())
    }

    fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.session.subscribe()
    }
}
