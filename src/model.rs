use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::SyndicError;

pub type ApartmentId = i64;
pub type PaymentId = i64;
pub type ExpenseId = i64;

/// Months of a fiscal year, January first.
pub const MONTHS: std::ops::RangeInclusive<u32> = 1..=12;
pub const MONTHS_PER_YEAR: usize = 12;

/// Identifier issued by the identity provider; profiles are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn unknown_variant(kind: &str, value: &str) -> SyndicError {
    SyndicError::validation(format!("unknown {kind} `{value}`"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyType {
    Owner,
    Tenant,
    Shared,
}

impl OccupancyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Tenant => "tenant",
            Self::Shared => "shared",
        }
    }
}

impl FromStr for OccupancyType {
    type Err = SyndicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "owner" => Ok(Self::Owner),
            "tenant" => Ok(Self::Tenant),
            "shared" => Ok(Self::Shared),
            other => Err(unknown_variant("occupancy type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApartmentStatus {
    Occupied,
    Vacant,
}

impl ApartmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Occupied => "occupied",
            Self::Vacant => "vacant",
        }
    }
}

impl FromStr for ApartmentStatus {
    type Err = SyndicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "occupied" => Ok(Self::Occupied),
            "vacant" => Ok(Self::Vacant),
            other => Err(unknown_variant("apartment status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roommate {
    pub name: String,
    pub cin: String,
}

/// Colour of an apartment's running balance: nothing owed, or money owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceHealth {
    Healthy,
    Owed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apartment {
    pub id: ApartmentId,
    pub number: String,
    pub floor: i32,
    pub resident_name: String,
    pub resident_cin: Option<String>,
    pub occupancy: OccupancyType,
    pub roommates: Vec<Roommate>,
    pub status: ApartmentStatus,
    pub monthly_total: Option<Decimal>,
    pub balance: Decimal,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Apartment {
    pub fn balance_health(&self) -> BalanceHealth {
        if self.balance <= Decimal::ZERO {
            BalanceHealth::Healthy
        } else {
            BalanceHealth::Owed
        }
    }

    /// Fee owed per month. A missing or zero fee falls back to the building
    /// default, and a zero default to [`FALLBACK_MONTHLY_FEE`].
    pub fn fee_or(&self, default_fee: Decimal) -> Decimal {
        [self.monthly_total, Some(default_fee)]
            .into_iter()
            .flatten()
            .find(|fee| !fee.is_zero())
            .unwrap_or(FALLBACK_MONTHLY_FEE)
    }
}

/// Floor first, then apartment number with digit runs compared numerically.
pub fn apartment_order(a: &Apartment, b: &Apartment) -> Ordering {
    a.floor
        .cmp(&b.floor)
        .then_with(|| natural_cmp(&a.number, &b.number))
}

pub fn sort_apartments(apartments: &mut [Apartment]) {
    apartments.sort_by(apartment_order);
}

/// Compares strings so that "A2" sorts before "A10".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_run = take_digits(&mut left);
                let r_run = take_digits(&mut right);
                let l_trim = l_run.trim_start_matches('0');
                let r_trim = r_run.trim_start_matches('0');
                let ord = l_trim
                    .len()
                    .cmp(&r_trim.len())
                    .then_with(|| l_trim.cmp(r_trim))
                    .then_with(|| l_run.len().cmp(&r_run.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l
                    .to_lowercase()
                    .cmp(r.to_lowercase())
                    .then_with(|| l.cmp(&r));
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

/// Write-side form of an apartment, used for both create and edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewApartment {
    pub number: String,
    pub floor: i32,
    pub resident_name: String,
    #[serde(default)]
    pub resident_cin: Option<String>,
    pub occupancy: OccupancyType,
    #[serde(default)]
    pub roommates: Vec<Roommate>,
    pub status: ApartmentStatus,
    #[serde(default)]
    pub monthly_total: Option<Decimal>,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl NewApartment {
    /// Validates the draft and drops roommates unless the unit is shared.
    pub fn normalized(mut self) -> Result<Self, SyndicError> {
        self.number = self.number.trim().to_string();
        if self.number.is_empty() {
            return Err(SyndicError::validation("apartment number must not be empty"));
        }
        if matches!(self.monthly_total, Some(fee) if fee.is_sign_negative()) {
            return Err(SyndicError::validation("monthly total must be >= 0"));
        }
        if self.occupancy != OccupancyType::Shared {
            self.roommates.clear();
        }
        Ok(self)
    }

    pub fn with_id(self, id: ApartmentId) -> Apartment {
        Apartment {
            id,
            number: self.number,
            floor: self.floor,
            resident_name: self.resident_name,
            resident_cin: self.resident_cin,
            occupancy: self.occupancy,
            roommates: self.roommates,
            status: self.status,
            monthly_total: self.monthly_total,
            balance: self.balance,
            email: self.email,
            phone: self.phone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Paid,
    Unpaid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "PAID",
            Self::Unpaid => "UNPAID",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Paid => Self::Unpaid,
            Self::Unpaid => Self::Paid,
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = SyndicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PAID" => Ok(Self::Paid),
            "UNPAID" => Ok(Self::Unpaid),
            other => Err(unknown_variant("payment status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    /// Weak reference: the apartment may have been deleted since.
    pub apartment_id: ApartmentId,
    pub year: i32,
    pub month: u32,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn is_paid(&self) -> bool {
        self.status == PaymentStatus::Paid
    }
}

/// Missing (apartment, year, month) slot to be inserted as UNPAID.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSeed {
    pub apartment_id: ApartmentId,
    pub year: i32,
    pub month: u32,
    pub amount: Decimal,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpenseCategory {
    Electricity,
    Water,
    Cleaning,
    Maintenance,
    Security,
    Other,
}

impl ExpenseCategory {
    pub const ALL: [Self; 6] = [
        Self::Electricity,
        Self::Water,
        Self::Cleaning,
        Self::Maintenance,
        Self::Security,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Electricity => "ELECTRICITY",
            Self::Water => "WATER",
            Self::Cleaning => "CLEANING",
            Self::Maintenance => "MAINTENANCE",
            Self::Security => "SECURITY",
            Self::Other => "OTHER",
        }
    }
}

impl FromStr for ExpenseCategory {
    type Err = SyndicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == value)
            .ok_or_else(|| unknown_variant("expense category", value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub category: ExpenseCategory,
    pub amount: Decimal,
    pub description: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    pub category: ExpenseCategory,
    pub amount: Decimal,
    pub description: String,
    pub date: NaiveDate,
}

impl NewExpense {
    pub fn validate(&self) -> Result<(), SyndicError> {
        if self.amount <= Decimal::ZERO {
            return Err(SyndicError::validation("expense amount must be > 0"));
        }
        if self.description.trim().is_empty() {
            return Err(SyndicError::validation("expense description must not be empty"));
        }
        Ok(())
    }

    pub fn with_id(self, id: ExpenseId) -> Expense {
        Expense {
            id,
            category: self.category,
            amount: self.amount,
            description: self.description,
            date: self.date,
        }
    }
}

/// Key of the single settings row.
pub const SETTINGS_KEY: &str = "app";

pub const FALLBACK_MONTHLY_FEE: Decimal = Decimal::from_parts(200, 0, 0, false, 0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub building_name: String,
    pub building_address: String,
    pub default_monthly_fee: Decimal,
    pub currency: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            building_name: "SyndicPro".to_string(),
            building_address: String::new(),
            default_monthly_fee: FALLBACK_MONTHLY_FEE,
            currency: "DH".to_string(),
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), SyndicError> {
        if self.building_name.trim().is_empty() {
            return Err(SyndicError::validation("building_name must not be empty"));
        }
        if self.default_monthly_fee.is_sign_negative() {
            return Err(SyndicError::validation("default_monthly_fee must be >= 0"));
        }
        if self.currency.trim().is_empty() {
            return Err(SyndicError::validation("currency must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Editor => "editor",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = SyndicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "viewer" => Ok(Self::Viewer),
            "editor" => Ok(Self::Editor),
            "admin" => Ok(Self::Admin),
            other => Err(unknown_variant("role", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    /// Stand-in used while an identity has no profile row yet.
    pub fn transient_viewer(id: UserId, email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            display_name: display_name_from_email(&email),
            id,
            email,
            role: Role::Viewer,
            created_at: Utc::now(),
        }
    }
}

pub fn display_name_from_email(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}
