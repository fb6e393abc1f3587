use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use charter_core::domain::compliance::{CalendarId, ComplianceCalendar};
use charter_core::repository::{CalendarRepository, StoreError};

use super::RepositoryError;
use crate::DbPool;

pub struct SqlCalendarRepository {
    pool: DbPool,
}

impl SqlCalendarRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &CalendarId) -> Result<Option<ComplianceCalendar>, RepositoryError> {
        let row = sqlx::query("SELECT id, document_json FROM compliance_calendar WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(calendar_from_row).transpose()
    }

    async fn upsert(&self, calendar: &ComplianceCalendar) -> Result<(), RepositoryError> {
        let document = serde_json::to_string(calendar)?;
        let event_count = i64::try_from(calendar.events.len()).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO compliance_calendar (
                id,
                entity_ref,
                jurisdiction,
                formation_date,
                covers_through_year,
                event_count,
                document_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                covers_through_year = excluded.covers_through_year,
                event_count = excluded.event_count,
                document_json = excluded.document_json,
                updated_at = excluded.updated_at",
        )
        .bind(&calendar.id.0)
        .bind(&calendar.entity_ref)
        .bind(calendar.jurisdiction.as_str())
        .bind(calendar.formation_date.to_string())
        .bind(i64::from(calendar.covers_through_year))
        .bind(event_count)
        .bind(document)
        .bind(calendar.created_at.to_rfc3339())
        .bind(calendar.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ids(&self) -> Result<Vec<CalendarId>, RepositoryError> {
        let rows = sqlx::query("SELECT id FROM compliance_calendar ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok(CalendarId(row.try_get::<String, _>("id")?)))
            .collect()
    }
}

#[async_trait]
impl CalendarRepository for SqlCalendarRepository {
    async fn find_by_id(&self, id: &CalendarId) -> Result<Option<ComplianceCalendar>, StoreError> {
        Ok(self.fetch(id).await?)
    }

    async fn save(&self, calendar: ComplianceCalendar) -> Result<(), StoreError> {
        Ok(self.upsert(&calendar).await?)
    }

    async fn list_ids(&self) -> Result<Vec<CalendarId>, StoreError> {
        Ok(self.ids().await?)
    }
}

fn calendar_from_row(row: SqliteRow) -> Result<ComplianceCalendar, RepositoryError> {
    let id = row.try_get::<String, _>("id")?;
    let document = row.try_get::<String, _>("document_json")?;
    serde_json::from_str(&document)
        .map_err(|error| RepositoryError::Decode(format!("calendar `{id}`: {error}")))
}
