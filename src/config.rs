use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::SyndicError;

pub const DB_FILE: &str = "syndic.sqlite";
pub const DEFAULT_LOG_FILTER: &str = "info";

pub const ENV_DB_PATH: &str = "SYNDIC_DB_PATH";
pub const ENV_LOG: &str = "SYNDIC_LOG";
pub const ENV_FEE_CASCADE: &str = "SYNDIC_FEE_CASCADE";

/// How far a change of the default monthly fee reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeCascade {
    /// Every apartment fee and every payment amount, past years included.
    #[default]
    Global,
    /// Apartment fees only; existing payment rows keep their amounts.
    ApartmentsOnly,
}

impl FromStr for FeeCascade {
    type Err = SyndicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "global" => Ok(Self::Global),
            "apartments_only" => Ok(Self::ApartmentsOnly),
            other => Err(SyndicError::validation(format!(
                "{ENV_FEE_CASCADE} must be `global` or `apartments_only`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub log_filter: String,
    pub fee_cascade: FeeCascade,
}

impl AppConfig {
    /// Defaults rooted at `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            database_path: data_dir.join(DB_FILE),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            fee_cascade: FeeCascade::default(),
        }
    }

    pub fn from_env(data_dir: &Path) -> Result<Self, SyndicError> {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` on top of [`AppConfig::in_dir`].
    pub fn from_lookup(
        data_dir: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SyndicError> {
        let mut config = Self::in_dir(data_dir);
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            config.database_path = PathBuf::from(path);
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|f| !f.trim().is_empty()) {
            config.log_filter = filter;
        }
        if let Some(cascade) = lookup(ENV_FEE_CASCADE) {
            config.fee_cascade = cascade.parse()?;
        }
        Ok(config)
    }
}

/// Installs the global fmt subscriber; later calls are no-ops.
pub fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
