//! Postgres registry backend.

use std::str::FromStr;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::{NoTls, Row, error::SqlState};
use tracing::info;

use super::core::{
    HealthStatus, NewServer, RegistryError, RegistryResult, RegistryStats, RegistryStorage,
    ServerFilter, ServerId, ServerRecord, ServerUpdate, make_registration_id,
};
use crate::config::PostgresConfig;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS inference_servers (
        id BIGSERIAL PRIMARY KEY,
        registration_id VARCHAR(32) NOT NULL UNIQUE,
        model_name TEXT NOT NULL,
        endpoint_url TEXT NOT NULL,
        api_key TEXT,
        health_status VARCHAR(16) NOT NULL DEFAULT 'unknown',
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        last_checked_at TIMESTAMPTZ,
        last_successful_request_at TIMESTAMPTZ,
        last_error TEXT,
        owner_name TEXT,
        owner_email TEXT,
        description TEXT,
        tags TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    CREATE INDEX IF NOT EXISTS idx_inference_servers_routable
        ON inference_servers (model_name, health_status) WHERE is_active;
";

const COLUMNS: &str = "id, registration_id, model_name, endpoint_url, api_key, health_status, \
    consecutive_failures, is_active, last_checked_at, last_successful_request_at, last_error, \
    owner_name, owner_email, description, tags, created_at, updated_at";

/// Attempts at drawing a fresh registration id before giving up.
const MAX_ID_ATTEMPTS: usize = 5;

fn storage_err(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::Storage(e.to_string())
}

fn row_to_record(row: &Row) -> RegistryResult<ServerRecord> {
    let status: String = row.try_get("health_status").map_err(storage_err)?;
    let failures: i32 = row.try_get("consecutive_failures").map_err(storage_err)?;
    Ok(ServerRecord {
        id: ServerId(row.try_get("id").map_err(storage_err)?),
        registration_id: row.try_get("registration_id").map_err(storage_err)?,
        model_name: row.try_get("model_name").map_err(storage_err)?,
        endpoint_url: row.try_get("endpoint_url").map_err(storage_err)?,
        api_key: row.try_get("api_key").map_err(storage_err)?,
        health_status: HealthStatus::from_str(&status)?,
        consecutive_failures: u32::try_from(failures).unwrap_or(0),
        is_active: row.try_get("is_active").map_err(storage_err)?,
        last_checked_at: row.try_get("last_checked_at").map_err(storage_err)?,
        last_successful_request_at: row
            .try_get("last_successful_request_at")
            .map_err(storage_err)?,
        last_error: row.try_get("last_error").map_err(storage_err)?,
        owner_name: row.try_get("owner_name").map_err(storage_err)?,
        owner_email: row.try_get("owner_email").map_err(storage_err)?,
        description: row.try_get("description").map_err(storage_err)?,
        tags: row.try_get("tags").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

fn rows_to_records(rows: &[Row]) -> RegistryResult<Vec<ServerRecord>> {
    rows.iter().map(row_to_record).collect()
}

pub struct PostgresRegistryStorage {
    pool: Pool,
}

impl PostgresRegistryStorage {
    /// Builds the pool and creates the schema if it does not exist.
    pub async fn connect(config: &PostgresConfig) -> RegistryResult<Self> {
        let pg_config = tokio_postgres::Config::from_str(&config.db_url).map_err(storage_err)?;
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.pool_max)
            .build()
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.initialize_schema().await?;
        info!(pool_max = config.pool_max, "Postgres registry ready");
        Ok(storage)
    }

    async fn initialize_schema(&self) -> RegistryResult<()> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await.map_err(storage_err)
    }

    async fn client(&self) -> RegistryResult<Object> {
        self.pool.get().await.map_err(storage_err)
    }
}

#[async_trait]
impl RegistryStorage for PostgresRegistryStorage {
    async fn create_server(&self, input: NewServer) -> RegistryResult<ServerRecord> {
        let client = self.client().await?;
        let api_key = input.api_key.filter(|k| !k.is_empty());
        let sql = format!(
            "INSERT INTO inference_servers \
             (registration_id, model_name, endpoint_url, api_key, owner_name, owner_email, description, tags) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {COLUMNS}"
        );

        let mut last_conflict = String::new();
        for _ in 0..MAX_ID_ATTEMPTS {
            let registration_id = make_registration_id();
            let result = client
                .query_one(
                    &sql,
                    &[
                        &registration_id,
                        &input.model_name,
                        &input.endpoint_url,
                        &api_key,
                        &input.owner_name,
                        &input.owner_email,
                        &input.description,
                        &input.tags,
                    ],
                )
                .await;
            match result {
                Ok(row) => return row_to_record(&row),
                Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                    last_conflict = registration_id;
                }
                Err(e) => return Err(storage_err(e)),
            }
        }
        Err(RegistryError::Duplicate(last_conflict))
    }

    async fn get_server(&self, id: ServerId) -> RegistryResult<Option<ServerRecord>> {
        let client = self.client().await?;
        let sql = format!("SELECT {COLUMNS} FROM inference_servers WHERE id = $1 AND is_active");
        let row = client.query_opt(&sql, &[&id.0]).await.map_err(storage_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn get_by_registration_id(
        &self,
        registration_id: &str,
    ) -> RegistryResult<Option<ServerRecord>> {
        let client = self.client().await?;
        let sql = format!("SELECT {COLUMNS} FROM inference_servers WHERE registration_id = $1");
        let row = client
            .query_opt(&sql, &[&registration_id])
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_servers(&self, filter: &ServerFilter) -> RegistryResult<Vec<ServerRecord>> {
        let client = self.client().await?;
        let status = filter.health_status.map(|s| s.as_str().to_string());
        let sql = format!(
            "SELECT {COLUMNS} FROM inference_servers \
             WHERE ($1::TEXT IS NULL OR model_name = $1) \
               AND ($2::TEXT IS NULL OR health_status = $2) \
               AND ($3 OR is_active) \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = client
            .query(&sql, &[&filter.model_name, &status, &filter.include_inactive])
            .await
            .map_err(storage_err)?;
        rows_to_records(&rows)
    }

    async fn list_healthy_servers(&self, model_name: &str) -> RegistryResult<Vec<ServerRecord>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM inference_servers \
             WHERE model_name = $1 AND health_status = 'healthy' AND is_active \
             ORDER BY last_successful_request_at ASC NULLS FIRST, id ASC"
        );
        let rows = client
            .query(&sql, &[&model_name])
            .await
            .map_err(storage_err)?;
        rows_to_records(&rows)
    }

    async fn list_models(&self) -> RegistryResult<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT DISTINCT model_name FROM inference_servers \
                 WHERE health_status = 'healthy' AND is_active ORDER BY model_name",
                &[],
            )
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(storage_err))
            .collect()
    }

    async fn update_server(
        &self,
        registration_id: &str,
        update: ServerUpdate,
    ) -> RegistryResult<Option<ServerRecord>> {
        if update.is_empty() {
            let current = self.get_by_registration_id(registration_id).await?;
            return Ok(current.filter(|s| s.is_active));
        }
        let client = self.client().await?;
        // An empty api_key clears the column; NULL leaves it untouched.
        let sql = format!(
            "UPDATE inference_servers SET \
                model_name = COALESCE($2, model_name), \
                endpoint_url = COALESCE($3, endpoint_url), \
                api_key = CASE WHEN $4::TEXT IS NULL THEN api_key ELSE NULLIF($4, '') END, \
                owner_name = COALESCE($5, owner_name), \
                owner_email = COALESCE($6, owner_email), \
                description = COALESCE($7, description), \
                tags = COALESCE($8, tags), \
                updated_at = NOW() \
             WHERE registration_id = $1 AND is_active \
             RETURNING {COLUMNS}"
        );
        let row = client
            .query_opt(
                &sql,
                &[
                    &registration_id,
                    &update.model_name,
                    &update.endpoint_url,
                    &update.api_key,
                    &update.owner_name,
                    &update.owner_email,
                    &update.description,
                    &update.tags,
                ],
            )
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn record_health_result(
        &self,
        id: ServerId,
        is_healthy: bool,
        error_message: Option<&str>,
    ) -> RegistryResult<ServerRecord> {
        let client = self.client().await?;
        let row = if is_healthy {
            let sql = format!(
                "UPDATE inference_servers SET \
                    health_status = 'healthy', consecutive_failures = 0, \
                    last_checked_at = NOW(), last_successful_request_at = NOW(), \
                    last_error = NULL, updated_at = NOW() \
                 WHERE id = $1 RETURNING {COLUMNS}"
            );
            client.query_opt(&sql, &[&id.0]).await
        } else {
            let sql = format!(
                "UPDATE inference_servers SET \
                    health_status = 'unhealthy', consecutive_failures = consecutive_failures + 1, \
                    last_checked_at = NOW(), last_error = $2, updated_at = NOW() \
                 WHERE id = $1 RETURNING {COLUMNS}"
            );
            client.query_opt(&sql, &[&id.0, &error_message]).await
        }
        .map_err(storage_err)?;
        match row {
            Some(row) => row_to_record(&row),
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    async fn record_request_success(&self, id: ServerId) -> RegistryResult<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE inference_servers SET last_successful_request_at = NOW(), \
                 consecutive_failures = 0, updated_at = NOW() WHERE id = $1",
                &[&id.0],
            )
            .await
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn deregister_server(&self, registration_id: &str) -> RegistryResult<bool> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE inference_servers SET is_active = FALSE, updated_at = NOW() \
                 WHERE registration_id = $1 AND is_active",
                &[&registration_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(updated > 0)
    }

    async fn stats(&self) -> RegistryResult<RegistryStats> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS total, \
                        COUNT(DISTINCT model_name) AS models, \
                        COUNT(*) FILTER (WHERE health_status = 'healthy') AS healthy, \
                        COUNT(*) FILTER (WHERE health_status = 'unhealthy') AS unhealthy, \
                        COUNT(*) FILTER (WHERE health_status = 'unknown') AS unknown \
                 FROM inference_servers WHERE is_active",
                &[],
            )
            .await
            .map_err(storage_err)?;
        let count = |name: &str| -> RegistryResult<usize> {
            let value: i64 = row.try_get(name).map_err(storage_err)?;
            Ok(usize::try_from(value).unwrap_or(0))
        };
        Ok(RegistryStats {
            total_servers: count("total")?,
            total_models: count("models")?,
            healthy: count("healthy")?,
            unhealthy: count("unhealthy")?,
            unknown: count("unknown")?,
        })
    }
}
