use crate::traits::TakerRepository;
use crate::types::{AnomalyInterval, PipelineError, Result, Taker, TakerId};
use async_trait::async_trait;
use chrono::{NaiveTime, Timelike, Utc};
use sqlx::{postgres::PgRow, PgPool, Pool, Postgres, Row};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct PgTakerRepository {
    db: Pool<Postgres>,
}

impl PgTakerRepository {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db = PgPool::connect(database_url).await?;
        Ok(Self { db })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db)
            .await
            .map_err(|e| PipelineError::Database(e.into()))?;
        info!("Database schema is up to date");
        Ok(())
    }

    fn taker_from_row(row: &PgRow) -> Result<Taker> {
        let check_out_state: String = row.try_get("check_out_state")?;
        let stored_state: String = row.try_get("stored_state")?;

        Ok(Taker {
            id: row.try_get("id")?,
            exam_id: row.try_get("exam_id")?,
            check_out_state: check_out_state.parse()?,
            stored_state: stored_state.parse()?,
            web_cam: row.try_get("web_cam")?,
        })
    }
}

#[async_trait]
impl TakerRepository for PgTakerRepository {
    async fn get_taker(&self, id: TakerId) -> Result<Taker> {
        let row = sqlx::query(
            "SELECT id, exam_id, check_out_state, stored_state, web_cam FROM takers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Self::taker_from_row(&row),
            None => Err(PipelineError::TakerNotFound { id }),
        }
    }

    async fn save_taker(&self, taker: &Taker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO takers (id, exam_id, check_out_state, stored_state, web_cam, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                exam_id = EXCLUDED.exam_id,
                check_out_state = EXCLUDED.check_out_state,
                stored_state = EXCLUDED.stored_state,
                web_cam = EXCLUDED.web_cam,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(taker.id)
        .bind(taker.exam_id)
        .bind(taker.check_out_state.as_str())
        .bind(taker.stored_state.as_str())
        .bind(&taker.web_cam)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        debug!("Saved taker {} (stored_state={})", taker.id, taker.stored_state);
        Ok(())
    }

    async fn insert_anomalies(&self, records: &[AnomalyInterval]) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let mut written = 0;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO abnormals (taker_id, type, detected_time, end_time, segment_reference)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT ON CONSTRAINT abnormals_unique_run DO NOTHING
                "#,
            )
            .bind(record.taker_id)
            .bind(&record.label)
            .bind(record.detected_time)
            .bind(record.end_time)
            .bind(&record.segment_reference)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn list_anomalies(&self, taker_id: TakerId) -> Result<Vec<AnomalyInterval>> {
        let rows = sqlx::query(
            r#"
            SELECT taker_id, type, detected_time, end_time, segment_reference
            FROM abnormals
            WHERE taker_id = $1
            ORDER BY detected_time DESC, type
            "#,
        )
        .bind(taker_id)
        .fetch_all(&self.db)
        .await?;

        let mut anomalies = Vec::with_capacity(rows.len());
        for row in rows {
            anomalies.push(AnomalyInterval {
                taker_id: row.try_get("taker_id")?,
                label: row.try_get("type")?,
                detected_time: row.try_get::<NaiveTime, _>("detected_time")?,
                end_time: row.try_get::<NaiveTime, _>("end_time")?,
                segment_reference: row.try_get("segment_reference")?,
            });
        }

        Ok(anomalies)
    }
}

/// In-process repository for local runs and tests.
#[derive(Default)]
pub struct MemoryTakerRepository {
    takers: RwLock<HashMap<TakerId, Taker>>,
    anomalies: RwLock<BTreeSet<AnomalyInterval>>,
}

impl MemoryTakerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_takers<I>(takers: I) -> Self
    where
        I: IntoIterator<Item = Taker>,
    {
        let repository = Self::new();
        {
            let mut map = repository.takers.write().await;
            for taker in takers {
                map.insert(taker.id, taker);
            }
        }
        repository
    }

    /// Cascades to the taker's anomalies, as the relational schema does.
    pub async fn delete_taker(&self, id: TakerId) {
        self.takers.write().await.remove(&id);
        self.anomalies.write().await.retain(|record| record.taker_id != id);
    }
}

#[async_trait]
impl TakerRepository for MemoryTakerRepository {
    async fn get_taker(&self, id: TakerId) -> Result<Taker> {
        self.takers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(PipelineError::TakerNotFound { id })
    }

    async fn save_taker(&self, taker: &Taker) -> Result<()> {
        self.takers.write().await.insert(taker.id, taker.clone());
        Ok(())
    }

    async fn insert_anomalies(&self, records: &[AnomalyInterval]) -> Result<usize> {
        // All or nothing, like the CHECK constraint inside a transaction
        if let Some(record) = records.iter().find(|r| r.detected_time >= r.end_time) {
            return Err(PipelineError::InvalidInterval {
                label: record.label.clone(),
                start: record.detected_time.num_seconds_from_midnight() as i64,
                end: record.end_time.num_seconds_from_midnight() as i64,
            });
        }

        let mut anomalies = self.anomalies.write().await;
        let mut written = 0;
        for record in records {
            if anomalies.insert(record.clone()) {
                written += 1;
            }
        }

        Ok(written)
    }

    async fn list_anomalies(&self, taker_id: TakerId) -> Result<Vec<AnomalyInterval>> {
        let mut anomalies: Vec<AnomalyInterval> = self
            .anomalies
            .read()
            .await
            .iter()
            .filter(|record| record.taker_id == taker_id)
            .cloned()
            .collect();

        anomalies.sort_by(|a, b| {
            b.detected_time
                .cmp(&a.detected_time)
                .then_with(|| a.label.cmp(&b.label))
        });

        Ok(anomalies)
    }
}
