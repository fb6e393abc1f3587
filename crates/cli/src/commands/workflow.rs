use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use charter_core::config::AppConfig;
use charter_core::{
    EntityInfo, StepId, StepServiceRouter, TracingAuditSink, WorkflowId, WorkflowOrchestrator,
};
use charter_db::{DbPool, SqlWorkflowRepository, SubmissionQueue};

use crate::commands::{correlation_id, to_data, with_store, CommandResult};
use crate::WorkflowCommand;

/// The operator CLI never calls remote registries; every automated step lands in the
/// submission queue for manual filing.
fn orchestrator(config: &AppConfig, pool: DbPool) -> WorkflowOrchestrator {
    WorkflowOrchestrator::new(
        Arc::new(SqlWorkflowRepository::new(pool.clone())),
        StepServiceRouter::with_fallback(Arc::new(SubmissionQueue::new(pool))),
        Arc::new(TracingAuditSink),
        Duration::from_secs(config.execution.step_timeout_secs),
    )
}

fn parse_input(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(raw) => serde_json::from_str(raw).context("--input must be valid JSON"),
    }
}

pub fn run(command: WorkflowCommand) -> CommandResult {
    match command {
        WorkflowCommand::Create { name, jurisdiction, kind, email } => {
            with_store("workflow.create", |config, pool| async move {
                let entity = EntityInfo {
                    entity_name: name,
                    jurisdiction,
                    entity_kind: kind,
                    contact_email: email,
                };
                match orchestrator(&config, pool).create_workflow(entity, &correlation_id()).await
                {
                    Ok(instance) => CommandResult::success_with_data(
                        "workflow.create",
                        format!("created workflow {}", instance.id),
                        to_data(&instance),
                    ),
                    Err(error) => CommandResult::application_failure("workflow.create", &error),
                }
            })
        }
        WorkflowCommand::Execute { workflow_id, step_id, input } => {
            let input = match parse_input(input.as_deref()) {
                Ok(input) => input,
                Err(error) => {
                    return CommandResult::failure(
                        "workflow.execute",
                        "invalid_input",
                        format!("{error:#}"),
                        2,
                    );
                }
            };
            with_store("workflow.execute", |config, pool| async move {
                let result = orchestrator(&config, pool)
                    .execute_step(
                        &WorkflowId(workflow_id),
                        &StepId(step_id),
                        input,
                        &correlation_id(),
                    )
                    .await;
                match result {
                    Ok(result) => CommandResult::success_with_data(
                        "workflow.execute",
                        format!("step {} {}", result.step_id, result.status.as_str()),
                        to_data(&result),
                    ),
                    Err(error) => CommandResult::application_failure("workflow.execute", &error),
                }
            })
        }
        WorkflowCommand::Show { workflow_id } => {
            with_store("workflow.show", |config, pool| async move {
                match orchestrator(&config, pool).workflow_status(&WorkflowId(workflow_id)).await {
                    Ok(instance) => CommandResult::success_with_data(
                        "workflow.show",
                        format!(
                            "workflow {} is {} at {}%",
                            instance.id,
                            instance.status.as_str(),
                            instance.progress
                        ),
                        to_data(&instance),
                    ),
                    Err(error) => CommandResult::application_failure("workflow.show", &error),
                }
            })
        }
        WorkflowCommand::Next { workflow_id } => {
            with_store("workflow.next", |config, pool| async move {
                let orchestrator = orchestrator(&config, pool);
                let workflow_id = WorkflowId(workflow_id);
                let next = match orchestrator.next_actionable_steps(&workflow_id).await {
                    Ok(next) => next,
                    Err(error) => {
                        return CommandResult::application_failure("workflow.next", &error);
                    }
                };
                match orchestrator.retryable_steps(&workflow_id).await {
                    Ok(retryable) => CommandResult::success_with_data(
                        "workflow.next",
                        format!("{} actionable, {} retryable", next.len(), retryable.len()),
                        Some(json!({ "actionable": next, "retryable": retryable })),
                    ),
                    Err(error) => CommandResult::application_failure("workflow.next", &error),
                }
            })
        }
    }
}
