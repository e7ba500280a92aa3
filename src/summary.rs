//! Collection statistics and the yearly financial overview.

use std::collections::{BTreeMap, HashMap};

use chrono::Datelike;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::model::{
    apartment_order, Apartment, ApartmentId, Expense, ExpenseCategory, Payment, PaymentStatus,
    MONTHS_PER_YEAR,
};

const RECENT_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowCollection,
    NegativeBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTone {
    Danger,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub tone: AlertTone,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotal {
    pub category: ExpenseCategory,
    pub amount: Decimal,
    /// Share of the year's expenses, rounded to a whole percent.
    pub share_percent: u32,
}

/// One apartment's row in the yearly view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApartmentYear {
    pub apartment_id: ApartmentId,
    pub number: String,
    pub resident_name: String,
    pub paid_months: usize,
    pub paid_amount: Decimal,
    /// Status per month, January first; `None` when no row exists yet.
    pub months: [Option<PaymentStatus>; MONTHS_PER_YEAR],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentPayment {
    pub payment: Payment,
    pub apartment_number: String,
    pub resident_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub year: i32,
    pub total_apartments: usize,
    pub total_paid_records: usize,
    pub total_potential_records: usize,
    pub collection_rate: u32,
    pub total_income: Decimal,
    pub total_expenses: Decimal,
    pub balance: Decimal,
    pub expense_categories: Vec<CategoryTotal>,
    pub alerts: Vec<Alert>,
    pub apartments: Vec<ApartmentYear>,
    pub recent_payments: Vec<RecentPayment>,
    pub recent_expenses: Vec<Expense>,
}

/// Whole-percent collection rate, rounded half up; 0 when nothing is owed.
pub fn collection_rate(paid: usize, potential: usize) -> u32 {
    if potential == 0 {
        return 0;
    }
    let paid = paid as u64;
    let potential = potential as u64;
    let rate = (paid * 200 + potential) / (potential * 2);
    u32::try_from(rate).unwrap_or(u32::MAX)
}

pub fn aggregate(
    apartments: &[Apartment],
    payments: &[Payment],
    expenses: &[Expense],
    year: i32,
) -> Summary {
    let by_id: HashMap<ApartmentId, &Apartment> =
        apartments.iter().map(|apt| (apt.id, apt)).collect();

    // Rows left behind by deleted apartments are not counted.
    let valid: Vec<&Payment> = payments
        .iter()
        .filter(|p| p.year == year && by_id.contains_key(&p.apartment_id))
        .collect();
    let paid: Vec<&Payment> = valid.iter().copied().filter(|p| p.is_paid()).collect();

    let total_apartments = apartments.len();
    let total_paid_records = paid.len();
    let total_potential_records = total_apartments * MONTHS_PER_YEAR;

    let year_expenses: Vec<&Expense> = expenses
        .iter()
        .filter(|e| e.date.year() == year)
        .collect();

    let total_income: Decimal = paid.iter().map(|p| p.amount).sum();
    let total_expenses: Decimal = year_expenses.iter().map(|e| e.amount).sum();
    let balance = total_income - total_expenses;

    let alerts = collect_alerts(total_paid_records, total_potential_records, balance);

    Summary {
        year,
        total_apartments,
        total_paid_records,
        total_potential_records,
        collection_rate: collection_rate(total_paid_records, total_potential_records),
        total_income,
        total_expenses,
        balance,
        expense_categories: category_totals(&year_expenses, total_expenses),
        alerts,
        apartments: apartment_breakdown(apartments, &valid),
        recent_payments: recent_payments(&paid, &by_id),
        recent_expenses: recent_expenses(&year_expenses),
    }
}

fn collect_alerts(paid: usize, potential: usize, balance: Decimal) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if paid * 2 < potential {
        alerts.push(Alert {
            kind: AlertKind::LowCollection,
            tone: AlertTone::Danger,
            message: "Low collection rate for this fiscal year.".to_string(),
        });
    }
    if balance < Decimal::ZERO {
        alerts.push(Alert {
            kind: AlertKind::NegativeBalance,
            tone: AlertTone::Warning,
            message: "Expenses exceed income for this year.".to_string(),
        });
    }
    alerts
}

fn category_totals(expenses: &[&Expense], total: Decimal) -> Vec<CategoryTotal> {
    let mut sums: BTreeMap<ExpenseCategory, Decimal> = BTreeMap::new();
    for expense in expenses {
        *sums.entry(expense.category).or_default() += expense.amount;
    }

    let mut totals: Vec<CategoryTotal> = sums
        .into_iter()
        .map(|(category, amount)| CategoryTotal {
            category,
            amount,
            share_percent: share_percent(amount, total),
        })
        .collect();
    totals.sort_by(|a, b| b.amount.cmp(&a.amount));
    totals
}

fn share_percent(amount: Decimal, total: Decimal) -> u32 {
    if total.is_zero() {
        return 0;
    }
    (amount * Decimal::ONE_HUNDRED / total)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u32()
        .unwrap_or(0)
}

pub fn apartment_breakdown(apartments: &[Apartment], payments: &[&Payment]) -> Vec<ApartmentYear> {
    let mut ordered: Vec<&Apartment> = apartments.iter().collect();
    ordered.sort_by(|a, b| apartment_order(a, b));

    ordered
        .into_iter()
        .map(|apartment| {
            let mut row = ApartmentYear {
                apartment_id: apartment.id,
                number: apartment.number.clone(),
                resident_name: apartment.resident_name.clone(),
                paid_months: 0,
                paid_amount: Decimal::ZERO,
                months: [None; MONTHS_PER_YEAR],
            };
            for payment in payments.iter().filter(|p| p.apartment_id == apartment.id) {
                let Some(slot) = month_slot(payment.month) else {
                    continue;
                };
                row.months[slot] = Some(payment.status);
                if payment.is_paid() {
                    row.paid_months += 1;
                    row.paid_amount += payment.amount;
                }
            }
            row
        })
        .collect()
}

fn month_slot(month: u32) -> Option<usize> {
    let slot = usize::try_from(month).ok()?.checked_sub(1)?;
    (slot < MONTHS_PER_YEAR).then_some(slot)
}

fn recent_payments(paid: &[&Payment], by_id: &HashMap<ApartmentId, &Apartment>) -> Vec<RecentPayment> {
    let mut stamped: Vec<&Payment> = paid.iter().copied().filter(|p| p.paid_at.is_some()).collect();
    stamped.sort_by(|a, b| b.paid_at.cmp(&a.paid_at));
    stamped
        .into_iter()
        .take(RECENT_LIMIT)
        .filter_map(|payment| {
            let apartment = by_id.get(&payment.apartment_id)?;
            Some(RecentPayment {
                payment: payment.clone(),
                apartment_number: apartment.number.clone(),
                resident_name: apartment.resident_name.clone(),
            })
        })
        .collect()
}

fn recent_expenses(expenses: &[&Expense]) -> Vec<Expense> {
    let mut latest: Vec<&Expense> = expenses.to_vec();
    latest.sort_by(|a, b| b.date.cmp(&a.date));
    latest.into_iter().take(RECENT_LIMIT).cloned().collect()
}
