//! PostgreSQL storage for U2F devices, ceremonies, users and sessions
//!
//! Ceremony consumption and counter advancement are single statements so
//! concurrent finishes are decided by the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use u2f_core::{
    CeremonyDirectory, CeremonyPayload, CeremonyRecord, CounterUpdate, DeviceDirectory,
    DeviceRegistration, DeviceStatus, SessionBinding, SessionDeviceStatus, StorageError,
    UserDirectory,
};

/// PostgreSQL-backed implementation of every engine storage seam
pub struct PostgresDirectory {
    pool: PgPool,
}

impl PostgresDirectory {
    /// Connect with a bounded pool
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tracing::info!("Connected to PostgreSQL database");
        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}

/// Database row for devices
#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    user_id: Option<String>,
    application: String,
    key_handle: String,
    key_handle_hash_code: i32,
    public_key: Vec<u8>,
    attestation_certificate: Vec<u8>,
    /// NULL until the first authentication
    counter: Option<i64>,
    status: String,
    display_name: Option<String>,
    creation_date: DateTime<Utc>,
    last_access_time: Option<DateTime<Utc>>,
    expiration_date: Option<DateTime<Utc>>,
    deletable: bool,
}

impl TryFrom<DeviceRow> for DeviceRegistration {
    type Error = StorageError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let status = DeviceStatus::parse(&row.status).ok_or_else(|| {
            StorageError::Serialization(format!("unknown device status '{}'", row.status))
        })?;
        let counter = row
            .counter
            .map(|value| {
                u32::try_from(value).map_err(|_| {
                    StorageError::Serialization(format!("counter out of range: {}", value))
                })
            })
            .transpose()?;

        Ok(DeviceRegistration {
            id: row.id,
            user_id: row.user_id,
            application: row.application,
            key_handle: row.key_handle,
            key_handle_hash_code: row.key_handle_hash_code,
            public_key: row.public_key,
            attestation_certificate: row.attestation_certificate,
            counter,
            status,
            display_name: row.display_name,
            creation_date: row.creation_date,
            last_access_time: row.last_access_time,
            expiration_date: row.expiration_date,
            deletable: row.deletable,
        })
    }
}

const DEVICE_COLUMNS: &str = "id, user_id, application, key_handle, key_handle_hash_code, \
     public_key, attestation_certificate, counter, status, display_name, creation_date, \
     last_access_time, expiration_date, deletable";

#[async_trait]
impl DeviceDirectory for PostgresDirectory {
    async fn insert(&self, device: DeviceRegistration) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO u2f_devices
                (id, user_id, application, key_handle, key_handle_hash_code, public_key,
                 attestation_certificate, counter, status, display_name, creation_date,
                 last_access_time, expiration_date, deletable)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&device.id)
        .bind(&device.user_id)
        .bind(&device.application)
        .bind(&device.key_handle)
        .bind(device.key_handle_hash_code)
        .bind(&device.public_key)
        .bind(&device.attestation_certificate)
        .bind(device.counter.map(i64::from))
        .bind(device.status.as_str())
        .bind(&device.display_name)
        .bind(device.creation_date)
        .bind(device.last_access_time)
        .bind(device.expiration_date)
        .bind(device.deletable)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<DeviceRegistration>, StorageError> {
        let row = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM u2f_devices WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        row.map(DeviceRegistration::try_from).transpose()
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        application: Option<&str>,
    ) -> Result<Vec<DeviceRegistration>, StorageError> {
        let rows = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM u2f_devices \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR application = $2)"
        ))
        .bind(user_id)
        .bind(application)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        rows.into_iter().map(DeviceRegistration::try_from).collect()
    }

    async fn find_by_key_handle(
        &self,
        application: &str,
        key_handle: &str,
    ) -> Result<Option<DeviceRegistration>, StorageError> {
        let row = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM u2f_devices \
             WHERE key_handle_hash_code = $1 AND key_handle = $2 AND application = $3"
        ))
        .bind(u2f_core::device::key_handle_hash_code(key_handle))
        .bind(key_handle)
        .bind(application)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        row.map(DeviceRegistration::try_from).transpose()
    }

    async fn advance_counter(
        &self,
        id: &str,
        counter: u32,
        accessed_at: DateTime<Utc>,
    ) -> Result<CounterUpdate, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE u2f_devices
            SET counter = $2, last_access_time = $3
            WHERE id = $1 AND status = 'active' AND (counter IS NULL OR counter < $2)
            "#,
        )
        .bind(id)
        .bind(i64::from(counter))
        .bind(accessed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(if result.rows_affected() > 0 {
            CounterUpdate::Advanced
        } else {
            CounterUpdate::Rejected
        })
    }

    async fn mark_compromised(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE u2f_devices SET status = 'compromised' WHERE id = $1 AND status <> 'compromised'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_expiration(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE u2f_devices SET expiration_date = NULL, deletable = FALSE WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn attach_user(&self, id: &str, user_id: &str) -> Result<bool, StorageError> {
        let result =
            sqlx::query("UPDATE u2f_devices SET user_id = $2 WHERE id = $1 AND user_id IS NULL")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let result = sqlx::query(
            "DELETE FROM u2f_devices WHERE deletable AND expiration_date IS NOT NULL AND expiration_date <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    async fn check_health(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }
}

/// Database row for ceremonies
#[derive(sqlx::FromRow)]
struct CeremonyRow {
    request_id: String,
    session_id: Option<String>,
    user_id: Option<String>,
    payload: serde_json::Value,
    creation_date: DateTime<Utc>,
    expiration_date: DateTime<Utc>,
}

impl TryFrom<CeremonyRow> for CeremonyRecord {
    type Error = StorageError;

    fn try_from(row: CeremonyRow) -> Result<Self, Self::Error> {
        let payload: CeremonyPayload = serde_json::from_value(row.payload)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        Ok(CeremonyRecord {
            request_id: row.request_id,
            session_id: row.session_id,
            user_id: row.user_id,
            creation_date: row.creation_date,
            expiration_date: row.expiration_date,
            payload,
        })
    }
}

#[async_trait]
impl CeremonyDirectory for PostgresDirectory {
    async fn insert(&self, record: CeremonyRecord) -> Result<bool, StorageError> {
        let payload = serde_json::to_value(&record.payload)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO u2f_ceremonies
                (request_id, kind, session_id, user_id, payload, creation_date, expiration_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(&record.request_id)
        .bind(record.payload.kind())
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&payload)
        .bind(record.creation_date)
        .bind(record.expiration_date)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        for challenge in record.payload.challenges() {
            let claimed = sqlx::query(
                r#"
                INSERT INTO u2f_ceremony_challenges (challenge, request_id)
                VALUES ($1, $2)
                ON CONFLICT (challenge) DO NOTHING
                "#,
            )
            .bind(&challenge)
            .bind(&record.request_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

            // Dropping the transaction rolls back the ceremony row
            if claimed.rows_affected() == 0 {
                return Ok(false);
            }
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(true)
    }

    async fn take_by_challenge(
        &self,
        challenge: &str,
    ) -> Result<Option<CeremonyRecord>, StorageError> {
        // Row locks make exactly one concurrent DELETE observe the record
        let row = sqlx::query_as::<_, CeremonyRow>(
            r#"
            DELETE FROM u2f_ceremonies c
            USING u2f_ceremony_challenges a
            WHERE a.challenge = $1 AND c.request_id = a.request_id
            RETURNING c.request_id, c.session_id, c.user_id, c.payload,
                      c.creation_date, c.expiration_date
            "#,
        )
        .bind(challenge)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = CeremonyRecord::try_from(row)?;
        if record.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM u2f_ceremonies WHERE expiration_date <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM u2f_ceremonies")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(count as usize)
    }
}

#[async_trait]
impl UserDirectory for PostgresDirectory {
    async fn resolve_user_id(&self, username: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar::<_, String>("SELECT user_id FROM u2f_users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))
    }
}

#[async_trait]
impl SessionBinding for PostgresDirectory {
    async fn is_valid(&self, session_id: &str, username: &str) -> Result<bool, StorageError> {
        let valid: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM u2f_sessions
                WHERE session_id = $1 AND state = 'pending'
                  AND (username IS NULL OR username = $2)
            )
            "#,
        )
        .bind(session_id)
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(valid)
    }

    async fn mark_succeeded(
        &self,
        session_id: &str,
        status: &SessionDeviceStatus,
    ) -> Result<(), StorageError> {
        let status_json = serde_json::to_value(status)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE u2f_sessions
            SET state = 'succeeded', device_status = $2, updated_at = NOW()
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(&status_json)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }

    async fn mark_declined(&self, session_id: &str) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE u2f_sessions SET state = 'declined', updated_at = NOW() WHERE session_id = $1",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }
}
