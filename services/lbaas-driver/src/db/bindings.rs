//! Postgres-backed tenant binding store.
//!
//! `tenant_id` is the primary key, so the uniqueness invariant is enforced
//! by the database. Inserts use `ON CONFLICT DO NOTHING` and re-read the
//! row, which makes two racing first resolutions converge on one binding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lbaas_id::{DeviceId, TenantId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tracing::debug;

use super::DbError;
use crate::bindings::{BindingStore, BindingStoreError, TenantBinding};

struct BindingRow {
    tenant_id: String,
    device_name: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for BindingRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            tenant_id: row.try_get("tenant_id")?,
            device_name: row.try_get("device_name")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<BindingRow> for TenantBinding {
    type Error = BindingStoreError;

    fn try_from(row: BindingRow) -> Result<Self, Self::Error> {
        let tenant_id = TenantId::try_from(row.tenant_id)
            .map_err(|e| BindingStoreError::InvalidRow(format!("tenant_id: {e}")))?;
        let device_id = DeviceId::try_from(row.device_name)
            .map_err(|e| BindingStoreError::InvalidRow(format!("device_name: {e}")))?;
        Ok(Self {
            tenant_id,
            device_id,
            created_at: row.created_at,
        })
    }
}

/// Binding store over the `tenant_bindings` table.
#[derive(Clone)]
pub struct PgBindingStore {
    pool: PgPool,
}

impl PgBindingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn classify(tenant_id: &TenantId, error: sqlx::Error) -> BindingStoreError {
        let error = DbError::Query(error);
        if error.is_unique_violation() {
            BindingStoreError::Conflict {
                tenant_id: tenant_id.clone(),
            }
        } else {
            BindingStoreError::Database(error)
        }
    }
}

#[async_trait]
impl BindingStore for PgBindingStore {
    async fn get(&self, tenant_id: &TenantId) -> Result<Option<TenantBinding>, BindingStoreError> {
        let row = sqlx::query_as::<_, BindingRow>(
            r#"
            SELECT tenant_id, device_name, created_at
            FROM tenant_bindings
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BindingStoreError::Database(DbError::Query(e)))?;

        row.map(TenantBinding::try_from).transpose()
    }

    async fn insert_if_absent(
        &self,
        tenant_id: &TenantId,
        device_id: &DeviceId,
    ) -> Result<TenantBinding, BindingStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO tenant_bindings (tenant_id, device_name)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(device_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::classify(tenant_id, e))?
        .rows_affected();

        debug!(
            tenant_id = %tenant_id,
            device = %device_id,
            inserted = inserted > 0,
            "Tenant binding upserted"
        );

        // Whoever won the insert, the stored row is the answer.
        self.get(tenant_id)
            .await?
            .ok_or_else(|| BindingStoreError::Conflict {
                tenant_id: tenant_id.clone(),
            })
    }

    async fn replace(
        &self,
        tenant_id: &TenantId,
        device_id: &DeviceId,
    ) -> Result<TenantBinding, BindingStoreError> {
        let row = sqlx::query_as::<_, BindingRow>(
            r#"
            INSERT INTO tenant_bindings (tenant_id, device_name)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id)
            DO UPDATE SET device_name = EXCLUDED.device_name, created_at = now()
            RETURNING tenant_id, device_name, created_at
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(device_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::classify(tenant_id, e))?;

        TenantBinding::try_from(row)
    }
}
