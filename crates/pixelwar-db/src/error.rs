//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] and [`fred`] errors. At the trait seams of `pixelwar-core` they
//! become a [`StoreError`].

use pixelwar_core::error::StoreError;

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt value: {0}")]
    Corrupt(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Corrupt(detail) => Self::Corrupt(detail),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_values_stay_corrupt() {
        let store: StoreError = DbError::Corrupt(String::from("bad score")).into();
        assert!(matches!(store, StoreError::Corrupt(ref d) if d == "bad score"));

        let store: StoreError = DbError::Config(String::from("bad url")).into();
        assert!(matches!(store, StoreError::Unavailable(_)));
    }
}
