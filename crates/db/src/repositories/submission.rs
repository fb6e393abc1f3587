//! Durable hand-off for formation steps when no registration API is configured.
//!
//! Each request is recorded once per idempotency key; replays of the same key
//! return the original receipt so retries never create a second submission.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::info;

use charter_core::collaborators::{CollaboratorError, FormationService, StepReceipt, StepRequest};
use charter_core::domain::workflow::{OperationKey, StepId, WorkflowId};

use super::{parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

#[derive(Clone, Debug, PartialEq)]
pub struct QueuedSubmission {
    pub idempotency_key: OperationKey,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub step_kind: String,
    pub jurisdiction: String,
    pub attempt: u32,
    pub request: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

pub struct SubmissionQueue {
    pool: DbPool,
}

impl SubmissionQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts the request unless its key is already queued. Returns true when a row was added.
    pub async fn enqueue(
        &self,
        request: &StepRequest,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let payload = serde_json::to_string(request)?;
        let result = sqlx::query(
            "INSERT INTO formation_submission (
                idempotency_key,
                workflow_id,
                step_id,
                step_kind,
                jurisdiction,
                attempt,
                request_json,
                submitted_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(&request.idempotency_key.0)
        .bind(&request.workflow_id.0)
        .bind(&request.step_id.0)
        .bind(request.kind.as_str())
        .bind(request.jurisdiction.as_str())
        .bind(i64::from(request.attempt))
        .bind(payload)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find(
        &self,
        key: &OperationKey,
    ) -> Result<Option<QueuedSubmission>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                idempotency_key,
                workflow_id,
                step_id,
                step_kind,
                jurisdiction,
                attempt,
                request_json,
                submitted_at
             FROM formation_submission
             WHERE idempotency_key = ?",
        )
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(submission_from_row).transpose()
    }

    pub async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<QueuedSubmission>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                idempotency_key,
                workflow_id,
                step_id,
                step_kind,
                jurisdiction,
                attempt,
                request_json,
                submitted_at
             FROM formation_submission
             WHERE workflow_id = ?
             ORDER BY submitted_at ASC, step_id ASC",
        )
        .bind(&workflow_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(submission_from_row).collect()
    }
}

#[async_trait]
impl FormationService for SubmissionQueue {
    async fn perform(&self, request: StepRequest) -> Result<StepReceipt, CollaboratorError> {
        let unavailable = |error: RepositoryError| CollaboratorError::Unavailable(error.to_string());

        let inserted = self.enqueue(&request, Utc::now()).await.map_err(unavailable)?;
        let queued = self
            .find(&request.idempotency_key)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| {
                CollaboratorError::Unavailable(format!(
                    "submission `{}` vanished after enqueue",
                    request.idempotency_key
                ))
            })?;

        info!(
            event_name = "formation.submission.queued",
            workflow_id = %queued.workflow_id,
            step_id = %queued.step_id,
            idempotency_key = %queued.idempotency_key,
            replay = !inserted,
            "formation step queued for manual submission"
        );

        Ok(StepReceipt {
            reference: format!("queued:{}", queued.idempotency_key),
            detail: json!({
                "queued_at": queued.submitted_at.to_rfc3339(),
                "first_attempt": queued.attempt,
                "replay": !inserted,
            }),
        })
    }
}

fn submission_from_row(row: SqliteRow) -> Result<QueuedSubmission, RepositoryError> {
    let request_json = row.try_get::<String, _>("request_json")?;

    Ok(QueuedSubmission {
        idempotency_key: OperationKey(row.try_get("idempotency_key")?),
        workflow_id: WorkflowId(row.try_get("workflow_id")?),
        step_id: StepId(row.try_get("step_id")?),
        step_kind: row.try_get("step_kind")?,
        jurisdiction: row.try_get("jurisdiction")?,
        attempt: parse_u32("attempt", row.try_get("attempt")?)?,
        request: serde_json::from_str(&request_json)?,
        submitted_at: parse_timestamp("submitted_at", row.try_get("submitted_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use charter_core::collaborators::{FormationService, StepRequest};
    use charter_core::domain::jurisdiction::{EntityKind, Jurisdiction};
    use charter_core::domain::workflow::{OperationKey, StepId, StepKind, WorkflowId};

    use super::SubmissionQueue;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn request(attempt: u32) -> StepRequest {
        let workflow_id = WorkflowId("wf_queue".to_string());
        let step_id = StepId::from("formation_filing");
        StepRequest {
            idempotency_key: OperationKey::for_step(&workflow_id, &step_id),
            workflow_id,
            step_id,
            kind: StepKind::FormationFiling,
            jurisdiction: Jurisdiction::Wyoming,
            entity_name: "Prairie Goods LLC".to_string(),
            entity_kind: EntityKind::Llc,
            attempt,
            input: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn replayed_key_returns_original_submission() {
        let pool = setup_pool().await;
        let queue = SubmissionQueue::new(pool.clone());

        let first = queue.perform(request(1)).await.expect("first");
        let retry = queue.perform(request(2)).await.expect("retry");

        assert_eq!(first.reference, retry.reference);
        assert_eq!(first.detail["replay"], false);
        assert_eq!(retry.detail["replay"], true);
        assert_eq!(retry.detail["first_attempt"], 1);

        let queued = queue
            .list_for_workflow(&WorkflowId("wf_queue".to_string()))
            .await
            .expect("list");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].step_kind, "formation_filing");
        assert_eq!(queued[0].request["entity_name"], "Prairie Goods LLC");
    }

    #[tokio::test]
    async fn closed_pool_surfaces_as_unavailable() {
        let pool = setup_pool().await;
        let queue = SubmissionQueue::new(pool.clone());
        pool.close().await;

        let error = queue.perform(request(1)).await.unwrap_err();
        assert!(matches!(error, charter_core::CollaboratorError::Unavailable(_)));
    }
}
