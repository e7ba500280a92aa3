use thiserror::Error;

/// Failures raised by a [`crate::store::RemoteStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("row not found: {table} #{id}")]
    NotFound { table: &'static str, id: String },
    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        table: &'static str,
        message: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(table: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            table,
            id: id.to_string(),
        }
    }

    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced to the caller of a session operation.
///
/// Nothing here is fatal: load failures leave the last known state in place,
/// write failures are reported next to the action that triggered them.
#[derive(Debug, Error)]
pub enum SyndicError {
    #[error("failed to load {what}: {source}")]
    Load {
        what: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to save {what}: {source}")]
    Write {
        what: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    #[error("you cannot {0} your own account")]
    SelfAction(&'static str),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl SyndicError {
    pub fn load(what: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Load { what, source }
    }

    pub fn write(what: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Write { what, source }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type SyndicResult<T> = Result<T, SyndicError>;
