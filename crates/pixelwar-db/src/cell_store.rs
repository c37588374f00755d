//! Durable cell records in the `pixels` table.
//!
//! Inserts use `ON CONFLICT DO NOTHING` and updates are guarded by the row
//! version, so two workers racing on one cell cannot both win.

use chrono::{DateTime, Utc};
use pixelwar_core::cells::{CellRecord, CellStore, CellWrite};
use pixelwar_core::error::StoreError;
use pixelwar_types::{Cell, CellCoord, MessageId, UserId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;
use crate::postgres::PostgresPool;

/// Operations on the `pixels` table.
#[derive(Clone)]
pub struct PgCellStore {
    pool: PgPool,
}

impl PgCellStore {
    /// Create a cell store sharing `pool`'s connections.
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Fetch the record of one cell.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn get(&self, cell: CellCoord) -> Result<Option<CellRecord>, DbError> {
        let row = sqlx::query_as::<_, PixelRow>(
            r"SELECT x, y, color, owner_id, version, last_message_id, last_enqueued_at
              FROM pixels
              WHERE x = $1 AND y = $2",
        )
        .bind(cell.x)
        .bind(cell.y)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PixelRow::into_record))
    }

    /// Insert `record` unless the cell already has one.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert(&self, record: &CellRecord) -> Result<bool, DbError> {
        let result = sqlx::query(
            r"INSERT INTO pixels (x, y, color, owner_id, version, last_message_id, last_enqueued_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT (x, y) DO NOTHING",
        )
        .bind(record.coord.x)
        .bind(record.coord.y)
        .bind(&record.color)
        .bind(record.owner.as_str())
        .bind(record.version)
        .bind(record.last_message_id.map(MessageId::into_inner))
        .bind(record.last_enqueued_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Overwrite color and owner if the row is still at `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the update fails.
    pub async fn update(
        &self,
        cell: CellCoord,
        expected_version: i64,
        write: &CellWrite,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r"UPDATE pixels
              SET color = $3,
                  owner_id = $4,
                  version = version + 1,
                  last_message_id = $5,
                  last_enqueued_at = $6,
                  updated_at = now()
              WHERE x = $1 AND y = $2 AND version = $7",
        )
        .bind(cell.x)
        .bind(cell.y)
        .bind(&write.color)
        .bind(write.owner.as_str())
        .bind(write.message_id.map(MessageId::into_inner))
        .bind(write.enqueued_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cells inside the inclusive bounds, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn in_bounds(
        &self,
        min: CellCoord,
        max: CellCoord,
        limit: u64,
    ) -> Result<Vec<Cell>, DbError> {
        let rows = sqlx::query_as::<_, PixelRow>(
            r"SELECT x, y, color, owner_id, version, last_message_id, last_enqueued_at
              FROM pixels
              WHERE x BETWEEN $1 AND $2 AND y BETWEEN $3 AND $4
              ORDER BY x, y
              LIMIT $5",
        )
        .bind(min.x)
        .bind(max.x)
        .bind(min.y)
        .bind(max.y)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PixelRow::into_cell).collect())
    }

    /// Every claimed cell.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn everything(&self) -> Result<Vec<Cell>, DbError> {
        let rows = sqlx::query_as::<_, PixelRow>(
            r"SELECT x, y, color, owner_id, version, last_message_id, last_enqueued_at
              FROM pixels
              ORDER BY x, y",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PixelRow::into_cell).collect())
    }

    /// Number of cells per owner.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn counts_by_owner(&self) -> Result<Vec<(UserId, i64)>, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r"SELECT owner_id, COUNT(*)
              FROM pixels
              GROUP BY owner_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(owner, count)| (UserId(owner), count))
            .collect())
    }

    /// Delete every row.
    ///
    /// **WARNING:** Only use for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the delete fails.
    pub async fn truncate(&self) -> Result<(), DbError> {
        sqlx::query("TRUNCATE pixels").execute(&self.pool).await?;
        Ok(())
    }
}

impl CellStore for PgCellStore {
    async fn find(&self, cell: CellCoord) -> Result<Option<CellRecord>, StoreError> {
        Ok(self.get(cell).await?)
    }

    async fn insert_if_absent(&self, record: &CellRecord) -> Result<bool, StoreError> {
        Ok(self.insert(record).await?)
    }

    async fn update_if_version(
        &self,
        cell: CellCoord,
        expected_version: i64,
        write: &CellWrite,
    ) -> Result<bool, StoreError> {
        Ok(self.update(cell, expected_version, write).await?)
    }

    async fn find_in_bounds(
        &self,
        min: CellCoord,
        max: CellCoord,
        limit: u64,
    ) -> Result<Vec<Cell>, StoreError> {
        Ok(self.in_bounds(min, max, limit).await?)
    }

    async fn all(&self) -> Result<Vec<Cell>, StoreError> {
        Ok(self.everything().await?)
    }

    async fn ownership_counts(&self) -> Result<Vec<(UserId, i64)>, StoreError> {
        Ok(self.counts_by_owner().await?)
    }
}

/// A row from the `pixels` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PixelRow {
    /// Cell column index.
    pub x: i64,
    /// Cell row index.
    pub y: i64,
    /// Current color.
    pub color: String,
    /// Current owner.
    pub owner_id: String,
    /// Write counter.
    pub version: i64,
    /// Id of the last applied update.
    pub last_message_id: Option<Uuid>,
    /// Enqueue time of the last applied update.
    pub last_enqueued_at: DateTime<Utc>,
}

impl PixelRow {
    /// Convert into the pipeline's record type.
    pub fn into_record(self) -> CellRecord {
        CellRecord {
            coord: CellCoord::new(self.x, self.y),
            color: self.color,
            owner: UserId(self.owner_id),
            version: self.version,
            last_message_id: self.last_message_id.map(MessageId::from),
            last_enqueued_at: self.last_enqueued_at,
        }
    }

    /// Convert into the public cell view.
    pub fn into_cell(self) -> Cell {
        Cell {
            coord: CellCoord::new(self.x, self.y),
            color: self.color,
            owner: UserId(self.owner_id),
        }
    }
}
