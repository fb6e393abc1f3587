//! Ports to the external services the core drives: registration/tax/agent
//! services for formation steps and the document generator for compliance
//! preparation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::compliance::Artifact;
use crate::domain::jurisdiction::{EntityKind, Jurisdiction};
use crate::domain::workflow::{OperationKey, StepId, StepKind, WorkflowId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("call timed out after {0}s")]
    Timeout(u64),
}

/// Everything a formation service needs to perform one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub kind: StepKind,
    pub jurisdiction: Jurisdiction,
    pub entity_name: String,
    pub entity_kind: EntityKind,
    pub attempt: u32,
    pub idempotency_key: OperationKey,
    pub input: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepReceipt {
    /// Reference assigned by the remote service (filing number, ticket id, ...).
    pub reference: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

#[async_trait]
pub trait FormationService: Send + Sync {
    /// Must be idempotent for a given `request.idempotency_key`.
    async fn perform(&self, request: StepRequest) -> Result<StepReceipt, CollaboratorError>;
}

/// Routes step requests to the service registered for their kind.
#[derive(Clone, Default)]
pub struct StepServiceRouter {
    services: HashMap<StepKind, Arc<dyn FormationService>>,
    fallback: Option<Arc<dyn FormationService>>,
}

impl StepServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves every kind without a dedicated registration.
    pub fn with_fallback(service: Arc<dyn FormationService>) -> Self {
        Self { services: HashMap::new(), fallback: Some(service) }
    }

    pub fn register(mut self, kind: StepKind, service: Arc<dyn FormationService>) -> Self {
        self.services.insert(kind, service);
        self
    }

    pub fn service_for(&self, kind: StepKind) -> Option<Arc<dyn FormationService>> {
        self.services.get(&kind).cloned().or_else(|| self.fallback.clone())
    }

    pub async fn dispatch(&self, request: StepRequest) -> Result<StepReceipt, CollaboratorError> {
        let service = self.service_for(request.kind).ok_or_else(|| {
            CollaboratorError::Unavailable(format!(
                "no formation service registered for `{}`",
                request.kind.as_str()
            ))
        })?;
        service.perform(request).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentTemplate {
    AnnualReport,
    TaxReturn,
    LicenseRenewal,
    RegisteredAgentRenewal,
}

impl DocumentTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnnualReport => "annual_report",
            Self::TaxReturn => "tax_return",
            Self::LicenseRenewal => "license_renewal",
            Self::RegisteredAgentRenewal => "registered_agent_renewal",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub template: DocumentTemplate,
    pub jurisdiction: Jurisdiction,
    pub idempotency_key: OperationKey,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn render(&self, request: DocumentRequest) -> Result<Artifact, CollaboratorError>;
}
