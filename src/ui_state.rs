use serde::{Deserialize, Serialize};

use crate::model::{Apartment, ApartmentStatus, Expense};

pub const FIRST_YEAR: i32 = 2026;
pub const LAST_YEAR: i32 = 2050;

pub fn clamp_year(year: i32) -> i32 {
    year.clamp(FIRST_YEAR, LAST_YEAR)
}

pub fn selectable_years() -> impl Iterator<Item = i32> {
    FIRST_YEAR..=LAST_YEAR
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiState {
    pub theme: Theme,
    pub search_query: String,
}

impl UiState {
    pub fn toggle_theme(&mut self) -> Theme {
        self.theme = self.theme.toggled();
        self.theme
    }

    pub fn set_search(&mut self, query: impl Into<String>) {
        self.search_query = query.into();
    }

    /// The global search box wins over a page's own search field.
    pub fn effective_search<'a>(&'a self, local: &'a str) -> &'a str {
        if self.search_query.is_empty() {
            local
        } else {
            &self.search_query
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApartmentFilter {
    #[default]
    All,
    Occupied,
    Vacant,
}

impl ApartmentFilter {
    fn admits(self, status: ApartmentStatus) -> bool {
        match self {
            Self::All => true,
            Self::Occupied => status == ApartmentStatus::Occupied,
            Self::Vacant => status == ApartmentStatus::Vacant,
        }
    }
}

fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Matches on apartment number or resident name, case-insensitively.
pub fn apartment_matches(apartment: &Apartment, query: &str) -> bool {
    contains_folded(&apartment.number, query) || contains_folded(&apartment.resident_name, query)
}

pub fn filter_apartments<'a>(
    apartments: &'a [Apartment],
    query: &str,
    filter: ApartmentFilter,
) -> Vec<&'a Apartment> {
    apartments
        .iter()
        .filter(|apt| filter.admits(apt.status) && apartment_matches(apt, query))
        .collect()
}

pub fn expense_matches(expense: &Expense, query: &str) -> bool {
    contains_folded(&expense.description, query) || contains_folded(expense.category.as_str(), query)
}

pub fn filter_expenses<'a>(expenses: &'a [Expense], query: &str) -> Vec<&'a Expense> {
    expenses
        .iter()
        .filter(|expense| expense_matches(expense, query))
        .collect()
}
