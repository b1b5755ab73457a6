//! SQLite-backed local store for the rignode GPU host agent.
//!
//! Single source of truth for slot state, deployments, and telemetry history.
//! All mutations go through single-statement atomic updates; the slot acquire
//! path is a conditional update so only one writer can ever hold the GPU.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use rig_proto::{
    Deployment, DeploymentStatus, GpuDescriptor, GpuSlot, GpuStatus, HealthRecord, MetricSample,
    NetworkBinding,
};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::path::Path;
use tracing::{debug, info};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("deployment '{0}' already exists")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("slot '{0}' is not available for acquisition")]
    ResourceBusy(String),

    #[error("gpu uuid for '{0}' is already set and immutable")]
    IdentityConflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ─── Partial-update records ──────────────────────────────────────────────────

/// Explicit partial update for the GPU slot. `None` leaves the column alone.
/// Telemetry writers must only fill telemetry and health fields; `status` and
/// `current_deployment_id` belong to the engine's acquire/release path.
#[derive(Debug, Clone, Default)]
pub struct GpuPatch {
    pub status: Option<GpuStatus>,
    pub healthy: Option<bool>,
    pub gpu_utilization: Option<f64>,
    pub vram_used_mb: Option<i64>,
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
    pub fan_speed_pct: Option<f64>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: Option<i64>,
    /// `Some(None)` clears the column, `Some(Some(id))` sets it.
    pub current_deployment_id: Option<Option<String>>,
}

/// Explicit partial update for a deployment row.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPatch {
    pub container_id: Option<String>,
    pub reason: Option<String>,
    pub ssh_port: Option<u16>,
    pub rental_port_1: Option<u16>,
    pub rental_port_2: Option<u16>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
}

/// Fields needed to create a deployment in `deploying`.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub deployment_id: String,
    pub slot_id: String,
    pub template: String,
    pub image: String,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub user_id: String,
}

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the store at `path` and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::write(path, b"")?;
        }
        let url = format!("sqlite:{}", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests. A single pinned connection keeps the
    /// database alive: recycling it would drop every table.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gpu_status (
                slot_id TEXT PRIMARY KEY,
                uuid TEXT UNIQUE,
                name TEXT NOT NULL,
                driver_version TEXT,
                cuda_version TEXT,
                compute_capability TEXT,
                total_vram_mb INTEGER,
                public_ip TEXT NOT NULL,
                ssh_port INTEGER NOT NULL,
                rental_port_1 INTEGER NOT NULL,
                rental_port_2 INTEGER NOT NULL,
                status TEXT NOT NULL,
                healthy INTEGER NOT NULL DEFAULT 1,
                gpu_utilization REAL,
                vram_used_mb INTEGER,
                temperature_c REAL,
                power_draw_w REAL,
                fan_speed_pct REAL,
                last_health_check TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                current_deployment_id TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                deployment_id TEXT PRIMARY KEY,
                slot_id TEXT NOT NULL,
                template TEXT NOT NULL,
                image TEXT NOT NULL,
                container_id TEXT,
                status TEXT NOT NULL,
                reason TEXT,
                start_time TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                ssh_port INTEGER,
                rental_port_1 INTEGER,
                rental_port_2 INTEGER,
                ssh_username TEXT,
                ssh_password TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (slot_id) REFERENCES gpu_status(slot_id)
            );

            CREATE TABLE IF NOT EXISTS gpu_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slot_id TEXT NOT NULL,
                deployment_id TEXT,
                gpu_utilization REAL,
                vram_used_mb INTEGER,
                vram_total_mb INTEGER,
                temperature_c REAL,
                power_draw_w REAL,
                fan_speed_pct REAL,
                container_status TEXT,
                uptime_secs INTEGER,
                ts TEXT NOT NULL,
                FOREIGN KEY (slot_id) REFERENCES gpu_status(slot_id)
            );

            CREATE TABLE IF NOT EXISTS gpu_health_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slot_id TEXT NOT NULL,
                overall TEXT NOT NULL,
                driver_ok INTEGER,
                temp_ok INTEGER,
                power_ok INTEGER,
                ecc_ok INTEGER,
                fan_ok INTEGER,
                error_count INTEGER NOT NULL DEFAULT 0,
                error_msg TEXT,
                ts TEXT NOT NULL,
                FOREIGN KEY (slot_id) REFERENCES gpu_status(slot_id)
            );

            CREATE INDEX IF NOT EXISTS idx_gpu_status_uuid ON gpu_status(uuid);
            CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status);
            CREATE INDEX IF NOT EXISTS idx_deployments_slot ON deployments(slot_id);
            CREATE INDEX IF NOT EXISTS idx_gpu_metrics_ts ON gpu_metrics(ts);
            "#,
        )
        .execute(&self.pool)
        .await?;
        debug!("schema ensured");
        Ok(())
    }

    // ─── GPU slot ────────────────────────────────────────────────────────────

    /// Insert or refresh the slot row. An existing server-assigned uuid is
    /// never overwritten here.
    pub async fn upsert_gpu(
        &self,
        slot_id: &str,
        descriptor: &GpuDescriptor,
        network: &NetworkBinding,
        status: GpuStatus,
        healthy: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gpu_status (
                slot_id, name, driver_version, cuda_version, compute_capability,
                total_vram_mb, public_ip, ssh_port, rental_port_1, rental_port_2,
                status, healthy, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slot_id) DO UPDATE SET
                name = excluded.name,
                driver_version = excluded.driver_version,
                cuda_version = excluded.cuda_version,
                compute_capability = excluded.compute_capability,
                total_vram_mb = excluded.total_vram_mb,
                public_ip = excluded.public_ip,
                ssh_port = excluded.ssh_port,
                rental_port_1 = excluded.rental_port_1,
                rental_port_2 = excluded.rental_port_2,
                status = excluded.status,
                healthy = excluded.healthy,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(slot_id)
        .bind(&descriptor.name)
        .bind(&descriptor.driver_version)
        .bind(&descriptor.cuda_version)
        .bind(&descriptor.compute_capability)
        .bind(descriptor.total_vram_mb)
        .bind(&network.public_ip)
        .bind(network.ssh_port as i64)
        .bind(network.rental_port_1 as i64)
        .bind(network.rental_port_2 as i64)
        .bind(status.as_str())
        .bind(healthy)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the server-assigned uuid. Write-once: a different existing value
    /// is an identity conflict.
    pub async fn set_gpu_uuid(&self, slot_id: &str, uuid: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE gpu_status SET uuid = ?, updated_at = ?
             WHERE slot_id = ? AND (uuid IS NULL OR uuid = ?)",
        )
        .bind(uuid)
        .bind(Utc::now().to_rfc3339())
        .bind(slot_id)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::IdentityConflict(slot_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_gpu(&self, slot_id: &str) -> Result<Option<GpuSlot>> {
        let row = sqlx::query("SELECT * FROM gpu_status WHERE slot_id = ?")
            .bind(slot_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(gpu_from_row).transpose()
    }

    /// Apply a partial update atomically. Unset fields keep their value.
    pub async fn patch_gpu(&self, slot_id: &str, patch: GpuPatch) -> Result<()> {
        let (clear_dep, dep_value) = match &patch.current_deployment_id {
            None => (false, None),
            Some(v) => (true, v.clone()),
        };
        let result = sqlx::query(
            r#"
            UPDATE gpu_status SET
                status = COALESCE(?, status),
                healthy = COALESCE(?, healthy),
                gpu_utilization = COALESCE(?, gpu_utilization),
                vram_used_mb = COALESCE(?, vram_used_mb),
                temperature_c = COALESCE(?, temperature_c),
                power_draw_w = COALESCE(?, power_draw_w),
                fan_speed_pct = COALESCE(?, fan_speed_pct),
                last_health_check = COALESCE(?, last_health_check),
                consecutive_failures = COALESCE(?, consecutive_failures),
                current_deployment_id = CASE WHEN ? THEN ? ELSE current_deployment_id END,
                updated_at = ?
            WHERE slot_id = ?
            "#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.healthy)
        .bind(patch.gpu_utilization)
        .bind(patch.vram_used_mb)
        .bind(patch.temperature_c)
        .bind(patch.power_draw_w)
        .bind(patch.fan_speed_pct)
        .bind(patch.last_health_check.map(|t| t.to_rfc3339()))
        .bind(patch.consecutive_failures)
        .bind(clear_dep)
        .bind(dep_value)
        .bind(Utc::now().to_rfc3339())
        .bind(slot_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("gpu slot '{slot_id}'")));
        }
        Ok(())
    }

    /// Atomic conditional acquire: available + healthy + unoccupied, or
    /// `ResourceBusy`. This is the only path that moves the slot to `busy`.
    pub async fn acquire_slot(&self, slot_id: &str, deployment_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE gpu_status
            SET status = 'busy', current_deployment_id = ?, updated_at = ?
            WHERE slot_id = ?
              AND status = 'available'
              AND healthy = 1
              AND current_deployment_id IS NULL
            "#,
        )
        .bind(deployment_id)
        .bind(Utc::now().to_rfc3339())
        .bind(slot_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ResourceBusy(slot_id.to_string()));
        }
        Ok(())
    }

    /// Return the slot to `available` and clear the deployment link.
    /// Idempotent; used by terminate, compensation, and reconciliation.
    pub async fn release_slot(&self, slot_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE gpu_status
             SET status = 'available', current_deployment_id = NULL, updated_at = ?
             WHERE slot_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(slot_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Deployments ─────────────────────────────────────────────────────────

    /// Create a deployment in `deploying`. A colliding id (command replay)
    /// fails with `AlreadyExists`.
    pub async fn create_deployment(&self, new: &NewDeployment) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO deployments (
                deployment_id, slot_id, template, image, status,
                start_time, duration_minutes, user_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'deploying', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.deployment_id)
        .bind(&new.slot_id)
        .bind(&new.template)
        .bind(&new.image)
        .bind(new.start_time.to_rfc3339())
        .bind(new.duration_minutes)
        .bind(&new.user_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(new.deployment_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE deployment_id = ?")
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(deployment_from_row).transpose()
    }

    /// Move a deployment to `status`, applying extra fields in the same
    /// statement. The transition guard lives in the WHERE clause, so a stale
    /// or replayed caller cannot regress a terminal row.
    pub async fn patch_deployment(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        patch: DeploymentPatch,
    ) -> Result<()> {
        let predecessors: &[DeploymentStatus] = match status {
            DeploymentStatus::Deploying => &[],
            DeploymentStatus::Running => &[DeploymentStatus::Deploying],
            DeploymentStatus::Terminating => {
                &[DeploymentStatus::Deploying, DeploymentStatus::Running]
            }
            DeploymentStatus::Terminated | DeploymentStatus::Completed => {
                &[DeploymentStatus::Terminating]
            }
            DeploymentStatus::Failed => &[
                DeploymentStatus::Deploying,
                DeploymentStatus::Running,
                DeploymentStatus::Terminating,
            ],
        };
        if predecessors.is_empty() {
            return self.invalid_transition(deployment_id, status).await;
        }
        let in_list = predecessors
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE deployments SET
                status = ?,
                container_id = COALESCE(?, container_id),
                reason = COALESCE(?, reason),
                ssh_port = COALESCE(?, ssh_port),
                rental_port_1 = COALESCE(?, rental_port_1),
                rental_port_2 = COALESCE(?, rental_port_2),
                ssh_username = COALESCE(?, ssh_username),
                ssh_password = COALESCE(?, ssh_password),
                updated_at = ?
            WHERE deployment_id = ? AND status IN ({in_list})
            "#
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(patch.container_id)
            .bind(patch.reason)
            .bind(patch.ssh_port.map(|p| p as i64))
            .bind(patch.rental_port_1.map(|p| p as i64))
            .bind(patch.rental_port_2.map(|p| p as i64))
            .bind(patch.ssh_username)
            .bind(patch.ssh_password)
            .bind(Utc::now().to_rfc3339())
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return self.invalid_transition(deployment_id, status).await;
        }
        Ok(())
    }

    async fn invalid_transition(&self, deployment_id: &str, to: DeploymentStatus) -> Result<()> {
        match self.get_deployment(deployment_id).await? {
            Some(d) => Err(StoreError::InvalidTransition {
                id: deployment_id.to_string(),
                from: d.status,
                to,
            }),
            None => Err(StoreError::NotFound(format!(
                "deployment '{deployment_id}'"
            ))),
        }
    }

    /// Expired, still-active deployments, soonest expiry first.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE status IN ('deploying', 'running')",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut expired: Vec<Deployment> = rows
            .into_iter()
            .map(deployment_from_row)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|d| d.is_expired(now))
            .collect();
        expired.sort_by_key(|d| d.expires_at());
        Ok(expired)
    }

    /// Deployments still in flight; consumed by startup reconciliation.
    pub async fn list_nonterminal(&self) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments
             WHERE status IN ('deploying', 'running', 'terminating')
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(deployment_from_row).collect()
    }

    // ─── Telemetry history ───────────────────────────────────────────────────

    pub async fn append_metric(
        &self,
        slot_id: &str,
        sample: &MetricSample,
        deployment_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gpu_metrics (
                slot_id, deployment_id, gpu_utilization, vram_used_mb,
                vram_total_mb, temperature_c, power_draw_w, fan_speed_pct,
                container_status, uptime_secs, ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(slot_id)
        .bind(deployment_id)
        .bind(sample.gpu_utilization)
        .bind(sample.vram_used_mb)
        .bind(sample.vram_total_mb)
        .bind(sample.temperature_c)
        .bind(sample.power_draw_w)
        .bind(sample.fan_speed_pct)
        .bind(&sample.container_status)
        .bind(sample.uptime_secs)
        .bind(sample.ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_health(&self, slot_id: &str, record: &HealthRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gpu_health_history (
                slot_id, overall, driver_ok, temp_ok, power_ok, ecc_ok, fan_ok,
                error_count, error_msg, ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(slot_id)
        .bind(record.overall.as_str())
        .bind(record.checks.driver_responsive)
        .bind(record.checks.temperature_normal)
        .bind(record.checks.power_normal)
        .bind(record.checks.no_ecc_errors)
        .bind(record.checks.fan_operational)
        .bind(record.error_count as i64)
        .bind(&record.error_message)
        .bind(record.ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn metric_count(&self, slot_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM gpu_metrics WHERE slot_id = ?")
            .bind(slot_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn health_count(&self, slot_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM gpu_health_history WHERE slot_id = ?")
            .bind(slot_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn gpu_from_row(row: SqliteRow) -> Result<GpuSlot> {
    let status_raw: String = row.try_get("status")?;
    let status = GpuStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("gpu status '{status_raw}'")))?;
    Ok(GpuSlot {
        slot_id: row.try_get("slot_id")?,
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        driver_version: row.try_get("driver_version")?,
        cuda_version: row.try_get("cuda_version")?,
        compute_capability: row.try_get("compute_capability")?,
        total_vram_mb: row.try_get("total_vram_mb")?,
        public_ip: row.try_get("public_ip")?,
        ssh_port: row.try_get::<i64, _>("ssh_port")? as u16,
        rental_port_1: row.try_get::<i64, _>("rental_port_1")? as u16,
        rental_port_2: row.try_get::<i64, _>("rental_port_2")? as u16,
        status,
        healthy: row.try_get("healthy")?,
        gpu_utilization: row.try_get("gpu_utilization")?,
        vram_used_mb: row.try_get("vram_used_mb")?,
        temperature_c: row.try_get("temperature_c")?,
        power_draw_w: row.try_get("power_draw_w")?,
        fan_speed_pct: row.try_get("fan_speed_pct")?,
        last_health_check: parse_opt_ts(row.try_get("last_health_check")?)?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        current_deployment_id: row.try_get("current_deployment_id")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn deployment_from_row(row: SqliteRow) -> Result<Deployment> {
    let status_raw: String = row.try_get("status")?;
    let status = DeploymentStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("deployment status '{status_raw}'")))?;
    Ok(Deployment {
        deployment_id: row.try_get("deployment_id")?,
        slot_id: row.try_get("slot_id")?,
        template: row.try_get("template")?,
        image: row.try_get("image")?,
        container_id: row.try_get("container_id")?,
        status,
        reason: row.try_get("reason")?,
        start_time: parse_ts(&row.try_get::<String, _>("start_time")?)?,
        duration_minutes: row.try_get("duration_minutes")?,
        user_id: row.try_get("user_id")?,
        ssh_port: row.try_get::<Option<i64>, _>("ssh_port")?.map(|p| p as u16),
        rental_port_1: row
            .try_get::<Option<i64>, _>("rental_port_1")?
            .map(|p| p as u16),
        rental_port_2: row
            .try_get::<Option<i64>, _>("rental_port_2")?
            .map(|p| p as u16),
        ssh_username: row.try_get("ssh_username")?,
        ssh_password: row.try_get("ssh_password")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
