use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use charter_core::domain::workflow::{WorkflowId, WorkflowInstance, WorkflowStatus};
use charter_core::repository::{StoreError, WorkflowRepository};

use super::RepositoryError;
use crate::DbPool;

/// Stores each instance as a JSON document next to a few indexed summary columns.
pub struct SqlWorkflowRepository {
    pool: DbPool,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &WorkflowId) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row =
            sqlx::query("SELECT id, status, document_json FROM workflow_instance WHERE id = ?")
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(instance_from_row).transpose()
    }

    async fn upsert(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let document = serde_json::to_string(instance)?;
        sqlx::query(
            "INSERT INTO workflow_instance (
                id,
                entity_name,
                entity_kind,
                jurisdiction,
                status,
                progress,
                document_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                entity_name = excluded.entity_name,
                status = excluded.status,
                progress = excluded.progress,
                document_json = excluded.document_json,
                updated_at = excluded.updated_at",
        )
        .bind(&instance.id.0)
        .bind(&instance.entity_name)
        .bind(instance.entity_kind.as_str())
        .bind(instance.jurisdiction.as_str())
        .bind(instance.status.as_str())
        .bind(i64::from(instance.progress))
        .bind(document)
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.fetch(id).await?)
    }

    async fn save(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        Ok(self.upsert(&instance).await?)
    }
}

fn instance_from_row(row: SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    let id = row.try_get::<String, _>("id")?;
    let status = row.try_get::<String, _>("status")?;
    let document = row.try_get::<String, _>("document_json")?;
    let instance: WorkflowInstance = serde_json::from_str(&document)
        .map_err(|error| RepositoryError::Decode(format!("workflow `{id}`: {error}")))?;

    if instance.id.0 != id {
        return Err(RepositoryError::Decode(format!(
            "workflow row `{id}` holds document for `{}`",
            instance.id
        )));
    }
    if WorkflowStatus::parse(&status) != Some(instance.status) {
        return Err(RepositoryError::Decode(format!(
            "workflow `{id}` summary status `{status}` disagrees with its document"
        )));
    }
    Ok(instance)
}
