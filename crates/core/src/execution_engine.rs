//! Step Execution Engine
//!
//! Deterministic state machine for formation steps. Every transition is
//! validated, recorded in the instance history and followed by a progress
//! recompute. The engine never performs I/O: callers reserve a step, run the
//! side effect themselves and then commit the outcome.

use chrono::{DateTime, Utc};

use crate::domain::workflow::{
    OperationKey, StepId, StepKind, StepStatus, StepTransitionRecord, WorkflowId,
    WorkflowInstance,
};
use crate::errors::{ApplicationError, DomainError};

/// Proof that a step moved to `in_progress` and may now run its side effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepReservation {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub kind: StepKind,
    pub automatable: bool,
    pub attempt: u32,
    pub idempotency_key: OperationKey,
    pub transition: StepTransitionRecord,
}

/// Result of committing a step outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitOutcome {
    pub transition: StepTransitionRecord,
    /// True only for the commit that archived the workflow.
    pub workflow_completed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct StepExecutionEngine;

impl StepExecutionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Compare-and-swap `{pending, failed} -> in_progress`.
    ///
    /// Leaves the instance untouched when the step is missing, busy, already
    /// done or still waiting on a dependency.
    pub fn reserve(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &StepId,
        now: DateTime<Utc>,
    ) -> Result<StepReservation, ApplicationError> {
        let step = instance
            .step(step_id)
            .ok_or_else(|| ApplicationError::not_found("step", step_id.0.clone()))?;

        match step.status {
            StepStatus::Pending | StepStatus::Failed => {}
            StepStatus::InProgress => {
                return Err(ApplicationError::AlreadyInProgress(step_id.clone()));
            }
            StepStatus::Completed => {
                return Err(ApplicationError::AlreadyCompleted(step_id.clone()));
            }
        }

        let unmet = instance.unmet_dependencies(step);
        if !unmet.is_empty() {
            return Err(ApplicationError::DependencyNotSatisfied {
                step_id: step_id.clone(),
                unmet,
            });
        }

        let reason =
            if step.status == StepStatus::Failed { "step_retry_reserved" } else { "step_reserved" };
        let outcome = self.apply(instance, step_id, StepStatus::InProgress, reason, now)?;

        let step = instance
            .step_mut(step_id)
            .ok_or_else(|| ApplicationError::not_found("step", step_id.0.clone()))?;
        step.attempts += 1;
        step.started_at = Some(now);
        let (kind, automatable, attempt) = (step.kind, step.automatable, step.attempts);

        Ok(StepReservation {
            workflow_id: instance.id.clone(),
            step_id: step_id.clone(),
            kind,
            automatable,
            attempt,
            idempotency_key: OperationKey::for_step(&instance.id, step_id),
            transition: outcome.transition,
        })
    }

    /// `in_progress -> failed` for a reservation taken before `stale_before`
    /// whose outcome never got committed. `None` when the step is not stale.
    pub fn reclaim_stale(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &StepId,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<CommitOutcome>, ApplicationError> {
        let step = instance
            .step(step_id)
            .ok_or_else(|| ApplicationError::not_found("step", step_id.0.clone()))?;
        let stale = step.status == StepStatus::InProgress
            && step.started_at.map_or(true, |started_at| started_at < stale_before);
        if !stale {
            return Ok(None);
        }

        let outcome = self.apply(instance, step_id, StepStatus::Failed, "step_reclaimed", now)?;
        if let Some(step) = instance.step_mut(step_id) {
            step.last_error =
                Some("reservation expired before its outcome was committed".to_string());
        }
        Ok(Some(outcome))
    }

    /// `in_progress -> completed`, recording the collaborator result.
    pub fn complete(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &StepId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, ApplicationError> {
        let outcome = self.apply(instance, step_id, StepStatus::Completed, "step_completed", now)?;
        if let Some(step) = instance.step_mut(step_id) {
            step.completed_at = Some(now);
            step.result = Some(result);
            step.last_error = None;
        }
        Ok(outcome)
    }

    /// `in_progress -> failed`. The step stays retryable.
    pub fn fail(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &StepId,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, ApplicationError> {
        let outcome = self.apply(instance, step_id, StepStatus::Failed, "step_failed", now)?;
        if let Some(step) = instance.step_mut(step_id) {
            step.last_error = Some(error.into());
        }
        Ok(outcome)
    }

    fn apply(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &StepId,
        to: StepStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, ApplicationError> {
        let step = instance
            .step_mut(step_id)
            .ok_or_else(|| ApplicationError::not_found("step", step_id.0.clone()))?;
        let from = step.status;
        Self::validate_transition(step_id, from, to)?;
        step.status = to;

        let workflow_completed = instance.refresh_status(now);
        let transition = StepTransitionRecord {
            step_id: step_id.clone(),
            from,
            to,
            reason: reason.to_string(),
            progress_after: instance.progress,
            occurred_at: now,
        };
        instance.history.push(transition.clone());

        Ok(CommitOutcome { transition, workflow_completed })
    }

    /// Allowed: pending|failed -> in_progress, in_progress -> completed|failed.
    pub fn validate_transition(
        step_id: &StepId,
        from: StepStatus,
        to: StepStatus,
    ) -> Result<(), DomainError> {
        let valid = matches!(
            (from, to),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::Failed, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Completed)
                | (StepStatus::InProgress, StepStatus::Failed)
        );

        if valid {
            Ok(())
        } else {
            Err(DomainError::InvalidStepTransition { step_id: step_id.clone(), from, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::domain::jurisdiction::{EntityKind, Jurisdiction, JurisdictionRules};

    fn delaware_instance() -> WorkflowInstance {
        let definition = JurisdictionRules::for_jurisdiction(Jurisdiction::Delaware)
            .workflow_definition(EntityKind::Llc)
            .expect("valid definition");
        WorkflowInstance::from_definition(
            WorkflowId("wf-test-001".to_string()),
            "Acme Holdings LLC",
            None,
            &definition,
            Utc::now(),
        )
    }

    fn run(engine: &StepExecutionEngine, instance: &mut WorkflowInstance, step: &str) {
        let step_id = StepId::from(step);
        engine.reserve(instance, &step_id, Utc::now()).expect("reserve");
        engine.complete(instance, &step_id, json!({"ok": true}), Utc::now()).expect("complete");
    }

    #[test]
    fn reserve_moves_pending_step_to_in_progress() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();

        let reservation =
            engine.reserve(&mut instance, &StepId::from("name_check"), Utc::now()).unwrap();

        assert_eq!(reservation.attempt, 1);
        assert_eq!(reservation.kind, StepKind::NameAvailability);
        assert_eq!(reservation.transition.from, StepStatus::Pending);
        assert_eq!(reservation.transition.to, StepStatus::InProgress);
        let step = instance.step(&StepId::from("name_check")).unwrap();
        assert_eq!(step.status, StepStatus::InProgress);
        assert!(step.started_at.is_some());
    }

    #[test]
    fn unmet_dependency_is_rejected_without_mutation() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();
        run(&engine, &mut instance, "name_check");
        let before = instance.clone();

        let result = engine.reserve(&mut instance, &StepId::from("formation_filing"), Utc::now());

        assert_eq!(
            result.unwrap_err(),
            ApplicationError::DependencyNotSatisfied {
                step_id: StepId::from("formation_filing"),
                unmet: vec![StepId::from("registered_agent")],
            }
        );
        assert_eq!(instance, before);
    }

    #[test]
    fn second_reservation_reports_in_progress_then_completed() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();
        let step_id = StepId::from("name_check");

        engine.reserve(&mut instance, &step_id, Utc::now()).unwrap();
        assert_eq!(
            engine.reserve(&mut instance, &step_id, Utc::now()).unwrap_err(),
            ApplicationError::AlreadyInProgress(step_id.clone())
        );

        engine.complete(&mut instance, &step_id, json!({}), Utc::now()).unwrap();
        assert_eq!(
            engine.reserve(&mut instance, &step_id, Utc::now()).unwrap_err(),
            ApplicationError::AlreadyCompleted(step_id)
        );
    }

    #[test]
    fn failed_step_can_be_retried_with_same_idempotency_key() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();
        let step_id = StepId::from("name_check");

        let first = engine.reserve(&mut instance, &step_id, Utc::now()).unwrap();
        engine.fail(&mut instance, &step_id, "registry offline", Utc::now()).unwrap();
        assert_eq!(instance.step(&step_id).unwrap().status, StepStatus::Failed);
        assert_eq!(
            instance.step(&step_id).unwrap().last_error.as_deref(),
            Some("registry offline")
        );

        let retry = engine.reserve(&mut instance, &step_id, Utc::now()).unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.idempotency_key, first.idempotency_key);
        assert_eq!(retry.transition.reason, "step_retry_reserved");
    }

    #[test]
    fn completing_a_pending_step_is_an_invalid_transition() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();

        let result =
            engine.complete(&mut instance, &StepId::from("name_check"), json!({}), Utc::now());

        assert!(matches!(
            result,
            Err(ApplicationError::Domain(DomainError::InvalidStepTransition {
                from: StepStatus::Pending,
                to: StepStatus::Completed,
                ..
            }))
        ));
    }

    #[test]
    fn workflow_completes_after_last_critical_step() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();
        for step in ["name_check", "registered_agent", "formation_filing", "ein_application"] {
            run(&engine, &mut instance, step);
        }

        let step_id = StepId::from("state_tax_registration");
        engine.reserve(&mut instance, &step_id, Utc::now()).unwrap();
        let outcome = engine.complete(&mut instance, &step_id, json!({}), Utc::now()).unwrap();

        assert!(outcome.workflow_completed);
        assert!(instance.completed_at.is_some());
        assert!(!instance.actionable_step_ids().is_empty(), "non-critical steps remain");
        let progress: Vec<u8> = instance.history.iter().map(|t| t.progress_after).collect();
        assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn stale_reservation_is_reclaimed_as_failed_and_reserved_again() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();
        let step_id = StepId::from("name_check");
        let started = Utc::now() - chrono::Duration::minutes(10);
        engine.reserve(&mut instance, &step_id, started).unwrap();

        let fresh_cutoff = started - chrono::Duration::minutes(1);
        let untouched = engine.reclaim_stale(&mut instance, &step_id, fresh_cutoff, Utc::now());
        assert_eq!(untouched, Ok(None));
        assert_eq!(instance.step(&step_id).unwrap().status, StepStatus::InProgress);

        let outcome = engine
            .reclaim_stale(&mut instance, &step_id, Utc::now(), Utc::now())
            .unwrap()
            .expect("stale step reclaimed");
        assert_eq!(outcome.transition.from, StepStatus::InProgress);
        assert_eq!(outcome.transition.to, StepStatus::Failed);
        assert_eq!(outcome.transition.reason, "step_reclaimed");
        assert_eq!(instance.retryable_step_ids(), vec![step_id.clone()]);

        let retry = engine.reserve(&mut instance, &step_id, Utc::now()).unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.transition.reason, "step_retry_reserved");
    }

    #[test]
    fn pending_steps_are_never_reclaimed() {
        let engine = StepExecutionEngine::new();
        let mut instance = delaware_instance();
        let before = instance.clone();

        let reclaimed = engine
            .reclaim_stale(&mut instance, &StepId::from("name_check"), Utc::now(), Utc::now())
            .unwrap();

        assert!(reclaimed.is_none());
        assert_eq!(instance, before);
    }
}
