//! Workflow Orchestrator
//!
//! Owns the lifecycle of formation workflows. Mutations of one instance are
//! serialized by a per-workflow lock that is held only while reserving a step
//! and while committing its outcome. Collaborator calls run unlocked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::collaborators::{CollaboratorError, StepReceipt, StepRequest, StepServiceRouter};
use crate::domain::jurisdiction::{Jurisdiction, JurisdictionRules};
use crate::domain::workflow::{
    EntityInfo, StepId, StepStatus, WorkflowId, WorkflowInstance, WorkflowStatus,
};
use crate::errors::ApplicationError;
use crate::execution_engine::{CommitOutcome, StepExecutionEngine, StepReservation};
use crate::locks::KeyedLocks;
use crate::repository::WorkflowRepository;

const ACTOR: &str = "workflow-orchestrator";
const MAX_ENTITY_NAME_LEN: usize = 200;
const DEFAULT_RECLAIM_GRACE: Duration = Duration::from_secs(60);
const COMMIT_SAVE_ATTEMPTS: u32 = 3;
const COMMIT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of one `execute_step` call that reached a terminal step state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub status: StepStatus,
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub progress: u8,
    pub workflow_status: WorkflowStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub workflow_id: WorkflowId,
    pub progress: u8,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub status: WorkflowStatus,
    /// Sum of nominal step fees for the whole formation.
    pub estimated_cost: Decimal,
    /// Longest dependency chain in nominal days.
    pub critical_path_days: u32,
}

pub struct WorkflowOrchestrator {
    repository: Arc<dyn WorkflowRepository>,
    services: StepServiceRouter,
    audit: Arc<dyn AuditSink>,
    engine: StepExecutionEngine,
    locks: KeyedLocks,
    step_timeout: Duration,
    reclaim_grace: Duration,
}

enum StepOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
}

impl WorkflowOrchestrator {
    pub fn new(
        repository: Arc<dyn WorkflowRepository>,
        services: StepServiceRouter,
        audit: Arc<dyn AuditSink>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            services,
            audit,
            engine: StepExecutionEngine::new(),
            locks: KeyedLocks::new(),
            step_timeout,
            reclaim_grace: DEFAULT_RECLAIM_GRACE,
        }
    }

    /// An `in_progress` step older than the step timeout plus `grace` is
    /// treated as abandoned and may be reserved again.
    pub fn with_reclaim_grace(mut self, grace: Duration) -> Self {
        self.reclaim_grace = grace;
        self
    }

    pub async fn create_workflow(
        &self,
        entity: EntityInfo,
        correlation_id: &str,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let jurisdiction = validate_entity(&entity)?;
        let definition = JurisdictionRules::for_jurisdiction(jurisdiction)
            .workflow_definition(entity.entity_kind)?;

        let id = WorkflowId(format!("wf_{}", Uuid::new_v4().simple()));
        let instance = WorkflowInstance::from_definition(
            id,
            entity.entity_name.trim(),
            entity.contact_email.map(|email| email.trim().to_string()),
            &definition,
            Utc::now(),
        );
        self.repository.save(instance.clone()).await?;

        info!(
            event_name = "workflow.created",
            correlation_id,
            workflow_id = %instance.id,
            jurisdiction = jurisdiction.code(),
            entity_kind = instance.entity_kind.as_str(),
            steps = instance.steps.len(),
            estimated_cost = %definition.total_nominal_cost(),
            critical_path_days = definition.critical_path_days(),
            "formation workflow created"
        );
        self.audit.emit(
            AuditEvent::new(
                instance.id.0.clone(),
                correlation_id,
                "workflow.created",
                AuditCategory::Workflow,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("jurisdiction", jurisdiction.code())
            .with_metadata("entity_kind", instance.entity_kind.as_str())
            .with_metadata("estimated_cost", definition.total_nominal_cost().to_string()),
        );

        Ok(instance)
    }

    /// Runs one step: reserve under the lock, call the collaborator unlocked,
    /// then commit under the lock. A collaborator failure is committed as
    /// `failed` and returned as `ExternalService`.
    pub async fn execute_step(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        input: serde_json::Value,
        correlation_id: &str,
    ) -> Result<StepResult, ApplicationError> {
        let (reservation, request) = {
            let _guard = self.locks.lock(&workflow_id.0).await;
            let mut instance = self.load(workflow_id).await?;

            let step = instance
                .step(step_id)
                .ok_or_else(|| ApplicationError::not_found("step", step_id.0.clone()))?;
            if !step.automatable && is_blank(&input) {
                return Err(ApplicationError::Validation(format!(
                    "step `{step_id}` is confirmed manually and needs a non-empty input payload"
                )));
            }

            let now = Utc::now();
            if let Some(cutoff) = self.stale_before(now) {
                if let Some(reclaimed) =
                    self.engine.reclaim_stale(&mut instance, step_id, cutoff, now)?
                {
                    self.report_reclaim(&instance, &reclaimed, correlation_id);
                }
            }

            let reservation = match self.engine.reserve(&mut instance, step_id, now) {
                Ok(reservation) => reservation,
                Err(error) => {
                    info!(
                        event_name = "workflow.step.rejected",
                        correlation_id,
                        workflow_id = %workflow_id,
                        step_id = %step_id,
                        error_kind = error.kind().as_str(),
                        "step reservation rejected"
                    );
                    return Err(error);
                }
            };
            self.repository.save(instance.clone()).await?;

            let request = StepRequest {
                workflow_id: workflow_id.clone(),
                step_id: step_id.clone(),
                kind: reservation.kind,
                jurisdiction: instance.jurisdiction,
                entity_name: instance.entity_name.clone(),
                entity_kind: instance.entity_kind,
                attempt: reservation.attempt,
                idempotency_key: reservation.idempotency_key.clone(),
                input: input.clone(),
            };
            (reservation, request)
        };

        info!(
            event_name = "workflow.step.reserved",
            correlation_id,
            workflow_id = %workflow_id,
            step_id = %step_id,
            attempt = reservation.attempt,
            idempotency_key = %reservation.idempotency_key,
            "step reserved"
        );
        self.emit_step("step.reserved", &reservation, correlation_id, AuditOutcome::Success, None);

        let outcome = if reservation.automatable {
            match self.call_service(request).await {
                Ok(receipt) => StepOutcome::Succeeded(serde_json::json!({
                    "reference": receipt.reference,
                    "detail": receipt.detail,
                    "idempotency_key": reservation.idempotency_key.0.clone(),
                })),
                Err(error) => StepOutcome::Failed(error.to_string()),
            }
        } else {
            StepOutcome::Succeeded(serde_json::json!({ "confirmation": input }))
        };

        self.commit(&reservation, outcome, correlation_id).await
    }

    async fn call_service(&self, request: StepRequest) -> Result<StepReceipt, CollaboratorError> {
        match tokio::time::timeout(self.step_timeout, self.services.dispatch(request)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(self.step_timeout.as_secs())),
        }
    }

    async fn commit(
        &self,
        reservation: &StepReservation,
        outcome: StepOutcome,
        correlation_id: &str,
    ) -> Result<StepResult, ApplicationError> {
        let workflow_id = &reservation.workflow_id;
        let step_id = &reservation.step_id;
        let _guard = self.locks.lock(&workflow_id.0).await;
        let mut instance = self.load(workflow_id).await?;
        let now = Utc::now();
        self.ensure_reservation_held(&instance, reservation, correlation_id)?;

        let (committed, failure) = match outcome {
            StepOutcome::Succeeded(result) => {
                (self.engine.complete(&mut instance, step_id, result, now)?, None)
            }
            StepOutcome::Failed(message) => {
                (self.engine.fail(&mut instance, step_id, message.clone(), now)?, Some(message))
            }
        };
        self.save_commit(&instance, correlation_id).await?;

        self.report_commit(reservation, &instance, &committed, failure.as_deref(), correlation_id);

        if let Some(message) = failure {
            return Err(ApplicationError::ExternalService {
                operation: reservation.kind.as_str().to_string(),
                message,
            });
        }

        let step = instance
            .step(step_id)
            .ok_or_else(|| ApplicationError::not_found("step", step_id.0.clone()))?;
        Ok(StepResult {
            workflow_id: workflow_id.clone(),
            step_id: step_id.clone(),
            status: step.status,
            attempt: step.attempts,
            result: step.result.clone(),
            progress: instance.progress,
            workflow_status: instance.status,
        })
    }

    /// Rejects a commit whose reservation was reclaimed in the meantime.
    fn ensure_reservation_held(
        &self,
        instance: &WorkflowInstance,
        reservation: &StepReservation,
        correlation_id: &str,
    ) -> Result<(), ApplicationError> {
        let step_id = &reservation.step_id;
        let step = instance
            .step(step_id)
            .ok_or_else(|| ApplicationError::not_found("step", step_id.0.clone()))?;
        if step.status == StepStatus::InProgress && step.attempts == reservation.attempt {
            return Ok(());
        }

        warn!(
            event_name = "workflow.step.superseded",
            correlation_id,
            workflow_id = %instance.id,
            step_id = %step_id,
            attempt = reservation.attempt,
            current_attempt = step.attempts,
            "reservation was reclaimed before its outcome was committed"
        );
        Err(match step.status {
            StepStatus::Completed => ApplicationError::AlreadyCompleted(step_id.clone()),
            StepStatus::InProgress => ApplicationError::AlreadyInProgress(step_id.clone()),
            StepStatus::Pending | StepStatus::Failed => ApplicationError::ExternalService {
                operation: reservation.kind.as_str().to_string(),
                message: "reservation expired before the outcome was committed".to_string(),
            },
        })
    }

    async fn save_commit(
        &self,
        instance: &WorkflowInstance,
        correlation_id: &str,
    ) -> Result<(), ApplicationError> {
        let mut attempt = 1;
        loop {
            match self.repository.save(instance.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < COMMIT_SAVE_ATTEMPTS => {
                    warn!(
                        event_name = "workflow.commit.retry",
                        correlation_id,
                        workflow_id = %instance.id,
                        attempt,
                        error = %error,
                        "saving the step outcome failed, retrying"
                    );
                    tokio::time::sleep(COMMIT_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn stale_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = chrono::Duration::from_std(self.step_timeout + self.reclaim_grace).ok()?;
        now.checked_sub_signed(window)
    }

    /// Reclaims every abandoned step of a loaded copy, so listings show them
    /// as retryable before anything is persisted.
    fn reclaim_all_stale(&self, instance: &mut WorkflowInstance) -> Result<(), ApplicationError> {
        let now = Utc::now();
        let Some(cutoff) = self.stale_before(now) else {
            return Ok(());
        };
        let busy: Vec<StepId> = instance
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::InProgress)
            .map(|step| step.id.clone())
            .collect();
        for step_id in busy {
            self.engine.reclaim_stale(instance, &step_id, cutoff, now)?;
        }
        Ok(())
    }

    fn report_reclaim(
        &self,
        instance: &WorkflowInstance,
        reclaimed: &CommitOutcome,
        correlation_id: &str,
    ) {
        let step_id = &reclaimed.transition.step_id;
        let attempt = instance.step(step_id).map_or(0, |step| step.attempts);
        warn!(
            event_name = "workflow.step.reclaimed",
            correlation_id,
            workflow_id = %instance.id,
            step_id = %step_id,
            attempt,
            "abandoned reservation reclaimed as failed"
        );
        self.audit.emit(
            AuditEvent::new(
                instance.id.0.clone(),
                correlation_id,
                "step.reclaimed",
                AuditCategory::Step,
                ACTOR,
                AuditOutcome::Failed,
            )
            .with_metadata("step_id", step_id.0.clone())
            .with_metadata("attempt", attempt.to_string()),
        );
    }

    fn report_commit(
        &self,
        reservation: &StepReservation,
        instance: &WorkflowInstance,
        committed: &CommitOutcome,
        failure: Option<&str>,
        correlation_id: &str,
    ) {
        match failure {
            None => {
                info!(
                    event_name = "workflow.step.completed",
                    correlation_id,
                    workflow_id = %instance.id,
                    step_id = %reservation.step_id,
                    progress = instance.progress,
                    "step completed"
                );
                self.emit_step(
                    "step.completed",
                    reservation,
                    correlation_id,
                    AuditOutcome::Success,
                    Some(instance.progress),
                );
            }
            Some(message) => {
                warn!(
                    event_name = "workflow.step.failed",
                    correlation_id,
                    workflow_id = %instance.id,
                    step_id = %reservation.step_id,
                    attempt = reservation.attempt,
                    error = message,
                    "step failed, retry is allowed"
                );
                self.emit_step(
                    "step.failed",
                    reservation,
                    correlation_id,
                    AuditOutcome::Failed,
                    Some(instance.progress),
                );
            }
        }

        if committed.workflow_completed {
            info!(
                event_name = "workflow.completed",
                correlation_id,
                workflow_id = %instance.id,
                progress = instance.progress,
                "all critical steps completed"
            );
            self.audit.emit(
                AuditEvent::new(
                    instance.id.0.clone(),
                    correlation_id,
                    "workflow.completed",
                    AuditCategory::Workflow,
                    ACTOR,
                    AuditOutcome::Success,
                )
                .with_metadata("progress", instance.progress.to_string()),
            );
        }
    }

    fn emit_step(
        &self,
        event_type: &str,
        reservation: &StepReservation,
        correlation_id: &str,
        outcome: AuditOutcome,
        progress: Option<u8>,
    ) {
        let mut event = AuditEvent::new(
            reservation.workflow_id.0.clone(),
            correlation_id,
            event_type,
            AuditCategory::Step,
            ACTOR,
            outcome,
        )
        .with_metadata("step_id", reservation.step_id.0.clone())
        .with_metadata("attempt", reservation.attempt.to_string());
        if let Some(progress) = progress {
            event = event.with_metadata("progress", progress.to_string());
        }
        self.audit.emit(event);
    }

    pub async fn next_actionable_steps(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<StepId>, ApplicationError> {
        Ok(self.load(workflow_id).await?.actionable_step_ids())
    }

    pub async fn retryable_steps(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<StepId>, ApplicationError> {
        let mut instance = self.load(workflow_id).await?;
        self.reclaim_all_stale(&mut instance)?;
        Ok(instance.retryable_step_ids())
    }

    pub async fn progress(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<ProgressSnapshot, ApplicationError> {
        let instance = self.load(workflow_id).await?;
        let definition = JurisdictionRules::for_jurisdiction(instance.jurisdiction)
            .workflow_definition(instance.entity_kind)?;
        Ok(ProgressSnapshot {
            workflow_id: instance.id.clone(),
            progress: instance.progress,
            completed_steps: instance.completed_steps(),
            total_steps: instance.steps.len(),
            status: instance.status,
            estimated_cost: definition.total_nominal_cost(),
            critical_path_days: definition.critical_path_days(),
        })
    }

    pub async fn workflow_status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowInstance, ApplicationError> {
        self.load(workflow_id).await
    }

    async fn load(&self, workflow_id: &WorkflowId) -> Result<WorkflowInstance, ApplicationError> {
        self.repository
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("workflow", workflow_id.0.clone()))
    }
}

fn validate_entity(entity: &EntityInfo) -> Result<Jurisdiction, ApplicationError> {
    let name = entity.entity_name.trim();
    if name.is_empty() {
        return Err(ApplicationError::Validation("entity_name must not be blank".to_string()));
    }
    if name.chars().count() > MAX_ENTITY_NAME_LEN {
        return Err(ApplicationError::Validation(format!(
            "entity_name must be at most {MAX_ENTITY_NAME_LEN} characters"
        )));
    }
    if let Some(email) = &entity.contact_email {
        if !email.contains('@') {
            return Err(ApplicationError::Validation(format!(
                "contact_email `{email}` is not a valid address"
            )));
        }
    }
    Jurisdiction::parse(&entity.jurisdiction).ok_or_else(|| {
        ApplicationError::Validation(format!(
            "unsupported jurisdiction `{}` (expected one of DE|WY|CA)",
            entity.jurisdiction
        ))
    })
}

fn is_blank(input: &serde_json::Value) -> bool {
    match input {
        serde_json::Value::Null => true,
        serde_json::Value::String(value) => value.trim().is_empty(),
        serde_json::Value::Array(values) => values.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::WorkflowOrchestrator;
    use crate::audit::InMemoryAuditSink;
    use crate::collaborators::{
        CollaboratorError, FormationService, StepReceipt, StepRequest, StepServiceRouter,
    };
    use crate::domain::jurisdiction::{EntityKind, Jurisdiction, JurisdictionRules};
    use crate::domain::workflow::{EntityInfo, StepId, StepStatus, WorkflowStatus};
    use crate::domain::workflow::{WorkflowId, WorkflowInstance};
    use crate::errors::ApplicationError;
    use crate::repository::{InMemoryWorkflowRepository, StoreError, WorkflowRepository};

    #[derive(Default)]
    struct RecordingService {
        calls: AtomicUsize,
        fail_next: AtomicBool,
        delay_ms: u64,
    }

    #[async_trait]
    impl FormationService for RecordingService {
        async fn perform(&self, request: StepRequest) -> Result<StepReceipt, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(CollaboratorError::Unavailable("registry offline".to_string()));
            }
            Ok(StepReceipt {
                reference: format!("ref-{}", request.step_id),
                detail: json!({ "attempt": request.attempt }),
            })
        }
    }

    /// Fails the saves whose 1-based sequence numbers are listed in `failing`.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryWorkflowRepository,
        saves: AtomicUsize,
        failing: Vec<usize>,
    }

    #[async_trait]
    impl WorkflowRepository for FlakyRepository {
        async fn find_by_id(
            &self,
            id: &WorkflowId,
        ) -> Result<Option<WorkflowInstance>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn save(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
            let sequence = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.contains(&sequence) {
                return Err(StoreError::Unavailable(format!("save #{sequence} dropped")));
            }
            self.inner.save(instance).await
        }
    }

    fn flaky_orchestrator(
        repository: Arc<FlakyRepository>,
        timeout: Duration,
    ) -> (WorkflowOrchestrator, InMemoryAuditSink) {
        let audit = InMemoryAuditSink::default();
        let orchestrator = WorkflowOrchestrator::new(
            repository,
            StepServiceRouter::with_fallback(Arc::new(RecordingService::default())),
            Arc::new(audit.clone()),
            timeout,
        );
        (orchestrator, audit)
    }

    fn orchestrator(
        service: Arc<RecordingService>,
        timeout: Duration,
    ) -> (WorkflowOrchestrator, InMemoryAuditSink) {
        let audit = InMemoryAuditSink::default();
        let orchestrator = WorkflowOrchestrator::new(
            Arc::new(InMemoryWorkflowRepository::default()),
            StepServiceRouter::with_fallback(service),
            Arc::new(audit.clone()),
            timeout,
        );
        (orchestrator, audit)
    }

    fn entity(jurisdiction: &str) -> EntityInfo {
        EntityInfo {
            entity_name: "Acme Holdings LLC".to_string(),
            jurisdiction: jurisdiction.to_string(),
            entity_kind: EntityKind::Llc,
            contact_email: Some("founder@acme.test".to_string()),
        }
    }

    #[tokio::test]
    async fn create_workflow_validates_entity_info() {
        let (orchestrator, _) =
            orchestrator(Arc::new(RecordingService::default()), Duration::from_secs(1));

        let blank = EntityInfo { entity_name: "  ".to_string(), ..entity("DE") };
        let unknown = entity("XX");
        let bad_email = EntityInfo { contact_email: Some("nobody".to_string()), ..entity("DE") };

        for info in [blank, unknown, bad_email] {
            let error = orchestrator.create_workflow(info, "req-1").await.unwrap_err();
            assert!(matches!(error, ApplicationError::Validation(_)), "{error:?}");
        }
    }

    #[tokio::test]
    async fn created_workflow_exposes_root_step_as_actionable() {
        let (orchestrator, audit) =
            orchestrator(Arc::new(RecordingService::default()), Duration::from_secs(1));

        let instance = orchestrator.create_workflow(entity("wyoming"), "req-1").await.unwrap();
        let next = orchestrator.next_actionable_steps(&instance.id).await.unwrap();

        assert_eq!(next, vec![StepId::from("name_check")]);
        let snapshot = orchestrator.progress(&instance.id).await.unwrap();
        assert_eq!(snapshot.progress, 0);
        let definition = JurisdictionRules::for_jurisdiction(Jurisdiction::Wyoming)
            .workflow_definition(EntityKind::Llc)
            .unwrap();
        assert_eq!(snapshot.estimated_cost, definition.total_nominal_cost());
        assert_eq!(snapshot.critical_path_days, definition.critical_path_days());
        assert!(snapshot.estimated_cost > rust_decimal::Decimal::ZERO);
        assert_eq!(audit.event_types(), vec!["workflow.created".to_string()]);
    }

    #[tokio::test]
    async fn executing_steps_advances_progress_and_records_results() {
        let service = Arc::new(RecordingService::default());
        let (orchestrator, audit) = orchestrator(service.clone(), Duration::from_secs(1));
        let instance = orchestrator.create_workflow(entity("WY"), "req-1").await.unwrap();

        let result = orchestrator
            .execute_step(&instance.id, &StepId::from("name_check"), json!(null), "req-2")
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.result.as_ref().unwrap()["reference"], "ref-name_check");
        assert!(result.progress > 0);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            orchestrator.next_actionable_steps(&instance.id).await.unwrap(),
            vec![StepId::from("registered_agent")]
        );
        assert_eq!(
            audit.event_types(),
            vec!["workflow.created", "step.reserved", "step.completed"]
        );
    }

    #[tokio::test]
    async fn unmet_dependency_leaves_instance_untouched() {
        let service = Arc::new(RecordingService::default());
        let (orchestrator, _) = orchestrator(service.clone(), Duration::from_secs(1));
        let instance = orchestrator.create_workflow(entity("DE"), "req-1").await.unwrap();

        let error = orchestrator
            .execute_step(&instance.id, &StepId::from("formation_filing"), json!(null), "req-2")
            .await
            .unwrap_err();

        assert!(matches!(error, ApplicationError::DependencyNotSatisfied { .. }));
        assert_eq!(orchestrator.workflow_status(&instance.id).await.unwrap(), instance);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_execution_of_one_step_calls_the_service_once() {
        let service = Arc::new(RecordingService { delay_ms: 50, ..RecordingService::default() });
        let (orchestrator, _) = orchestrator(service.clone(), Duration::from_secs(2));
        let orchestrator = Arc::new(orchestrator);
        let instance = orchestrator.create_workflow(entity("DE"), "req-1").await.unwrap();
        let step_id = StepId::from("name_check");

        let first = {
            let orchestrator = orchestrator.clone();
            let (id, step) = (instance.id.clone(), step_id.clone());
            tokio::spawn(
                async move { orchestrator.execute_step(&id, &step, json!(null), "a").await },
            )
        };
        let second = {
            let orchestrator = orchestrator.clone();
            let (id, step) = (instance.id.clone(), step_id.clone());
            tokio::spawn(
                async move { orchestrator.execute_step(&id, &step, json!(null), "b").await },
            )
        };
        let outcomes = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|outcome| matches!(
            outcome,
            Err(ApplicationError::AlreadyInProgress(_)) | Err(ApplicationError::AlreadyCompleted(_))
        )));
    }

    #[tokio::test]
    async fn collaborator_failure_marks_step_failed_and_retry_succeeds() {
        let service = Arc::new(RecordingService::default());
        service.fail_next.store(true, Ordering::SeqCst);
        let (orchestrator, audit) = orchestrator(service.clone(), Duration::from_secs(1));
        let instance = orchestrator.create_workflow(entity("CA"), "req-1").await.unwrap();
        let step_id = StepId::from("name_check");

        let error = orchestrator
            .execute_step(&instance.id, &step_id, json!(null), "req-2")
            .await
            .unwrap_err();
        assert!(error.is_retryable());
        let retryable = orchestrator.retryable_steps(&instance.id).await.unwrap();
        assert_eq!(retryable, vec![step_id.clone()]);
        assert!(orchestrator.next_actionable_steps(&instance.id).await.unwrap().is_empty());

        let retry =
            orchestrator.execute_step(&instance.id, &step_id, json!(null), "req-3").await.unwrap();
        assert_eq!(retry.status, StepStatus::Completed);
        assert_eq!(retry.attempt, 2);
        assert!(audit.event_types().contains(&"step.failed".to_string()));
    }

    #[tokio::test]
    async fn slow_collaborator_times_out_as_failed() {
        let service = Arc::new(RecordingService { delay_ms: 200, ..RecordingService::default() });
        let (orchestrator, _) = orchestrator(service, Duration::from_millis(20));
        let instance = orchestrator.create_workflow(entity("WY"), "req-1").await.unwrap();
        let step_id = StepId::from("name_check");

        let error = orchestrator
            .execute_step(&instance.id, &step_id, json!(null), "req-2")
            .await
            .unwrap_err();

        assert!(matches!(error, ApplicationError::ExternalService { .. }));
        let snapshot = orchestrator.workflow_status(&instance.id).await.unwrap();
        assert_eq!(snapshot.step(&step_id).unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn manual_step_requires_confirmation_payload() {
        let service = Arc::new(RecordingService::default());
        let (orchestrator, audit) = orchestrator(service.clone(), Duration::from_secs(1));
        let instance = orchestrator.create_workflow(entity("WY"), "req-1").await.unwrap();
        for step in ["name_check", "registered_agent", "formation_filing", "ein_application"] {
            orchestrator
                .execute_step(&instance.id, &StepId::from(step), json!(null), "req")
                .await
                .unwrap();
        }
        let bank = StepId::from("bank_account");
        let calls_before = service.calls.load(Ordering::SeqCst);

        let error =
            orchestrator.execute_step(&instance.id, &bank, json!({}), "req").await.unwrap_err();
        assert!(matches!(error, ApplicationError::Validation(_)));

        let confirmed = orchestrator
            .execute_step(&instance.id, &bank, json!({"account_last4": "4821"}), "req")
            .await
            .unwrap();
        assert_eq!(confirmed.result.unwrap()["confirmation"]["account_last4"], "4821");
        assert_eq!(service.calls.load(Ordering::SeqCst), calls_before);
        assert_eq!(confirmed.workflow_status, WorkflowStatus::Completed);
        assert!(audit.event_types().contains(&"workflow.completed".to_string()));
    }

    #[tokio::test]
    async fn commit_save_failing_once_is_retried() {
        // Save 1 creates the workflow, save 2 reserves, save 3 commits.
        let repository = Arc::new(FlakyRepository { failing: vec![3], ..Default::default() });
        let (orchestrator, _) = flaky_orchestrator(repository.clone(), Duration::from_secs(1));
        let instance = orchestrator.create_workflow(entity("WY"), "req-1").await.unwrap();
        let step_id = StepId::from("name_check");

        let result =
            orchestrator.execute_step(&instance.id, &step_id, json!(null), "req-2").await.unwrap();

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(repository.saves.load(Ordering::SeqCst), 4);
        let stored = orchestrator.workflow_status(&instance.id).await.unwrap();
        assert_eq!(stored.step(&step_id).unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn step_left_in_progress_by_a_lost_commit_is_reclaimed() {
        let repository = Arc::new(FlakyRepository { failing: vec![3, 4, 5], ..Default::default() });
        let (orchestrator, audit) = flaky_orchestrator(repository, Duration::from_millis(20));
        let orchestrator = orchestrator.with_reclaim_grace(Duration::ZERO);
        let instance = orchestrator.create_workflow(entity("WY"), "req-1").await.unwrap();
        let step_id = StepId::from("name_check");

        let error = orchestrator
            .execute_step(&instance.id, &step_id, json!(null), "req-2")
            .await
            .unwrap_err();
        assert!(matches!(error, ApplicationError::Persistence(_)), "{error:?}");
        let stuck = orchestrator.workflow_status(&instance.id).await.unwrap();
        assert_eq!(stuck.step(&step_id).unwrap().status, StepStatus::InProgress);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let retryable = orchestrator.retryable_steps(&instance.id).await.unwrap();
        assert_eq!(retryable, vec![step_id.clone()]);
        let unchanged = orchestrator.workflow_status(&instance.id).await.unwrap();
        assert_eq!(unchanged.step(&step_id).unwrap().status, StepStatus::InProgress);

        let retry =
            orchestrator.execute_step(&instance.id, &step_id, json!(null), "req-3").await.unwrap();
        assert_eq!(retry.status, StepStatus::Completed);
        assert_eq!(retry.attempt, 2);

        let stored = orchestrator.workflow_status(&instance.id).await.unwrap();
        let reasons: Vec<&str> =
            stored.history.iter().map(|transition| transition.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec!["step_reserved", "step_reclaimed", "step_retry_reserved", "step_completed"]
        );
        assert!(audit.event_types().contains(&"step.reclaimed".to_string()));
    }

    #[tokio::test]
    async fn fresh_reservation_is_not_reclaimed() {
        let service = Arc::new(RecordingService { delay_ms: 100, ..RecordingService::default() });
        let (orchestrator, _) = orchestrator(service.clone(), Duration::from_secs(2));
        let orchestrator = Arc::new(orchestrator);
        let instance = orchestrator.create_workflow(entity("DE"), "req-1").await.unwrap();
        let step_id = StepId::from("name_check");

        let running = {
            let orchestrator = orchestrator.clone();
            let (id, step) = (instance.id.clone(), step_id.clone());
            tokio::spawn(
                async move { orchestrator.execute_step(&id, &step, json!(null), "a").await },
            )
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let error = orchestrator
            .execute_step(&instance.id, &step_id, json!(null), "b")
            .await
            .unwrap_err();
        assert_eq!(error, ApplicationError::AlreadyInProgress(step_id.clone()));
        assert!(orchestrator.retryable_steps(&instance.id).await.unwrap().is_empty());
        assert!(running.await.unwrap().is_ok());
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }
}
