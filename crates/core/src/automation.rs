use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::collaborators::{
    CollaboratorError, DocumentGenerator, DocumentRequest, DocumentTemplate,
};
use crate::domain::compliance::{Artifact, CalendarId, ComplianceEvent, EventId, ObligationType};
use crate::domain::jurisdiction::Jurisdiction;
use crate::domain::semantic_id;
use crate::domain::workflow::OperationKey;

/// Entity details the executor needs besides the event itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityContext {
    pub calendar_id: CalendarId,
    pub entity_ref: String,
    pub entity_name: String,
    pub jurisdiction: Jurisdiction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub event_id: EventId,
    pub success: bool,
    pub revenue: Decimal,
    pub artifacts: Vec<Artifact>,
    pub error: Option<String>,
}

/// Flat fee charged for preparing a filing of the given type.
pub fn service_fee(obligation_type: ObligationType) -> Decimal {
    match obligation_type {
        ObligationType::AnnualReport => Decimal::new(4900, 2),
        ObligationType::TaxFiling => Decimal::new(9900, 2),
        ObligationType::LicenseRenewal => Decimal::new(7900, 2),
        ObligationType::RegisteredAgentRenewal => Decimal::new(3900, 2),
    }
}

/// Key for the document request of one event. Stable across monitor passes.
pub fn preparation_key(calendar_id: &CalendarId, event_id: &EventId) -> OperationKey {
    OperationKey(semantic_id("op", &["prepare", &calendar_id.0, &event_id.0]))
}

/// Prepares filings for compliance events. Never submits: a successful result
/// means "prepared, pending approval".
pub struct AutomationExecutor {
    documents: Arc<dyn DocumentGenerator>,
    timeout: Duration,
}

impl AutomationExecutor {
    pub fn new(documents: Arc<dyn DocumentGenerator>, timeout: Duration) -> Self {
        Self { documents, timeout }
    }

    /// Collaborator failures are reported in the result, never raised.
    pub async fn execute(&self, event: &ComplianceEvent, context: &EntityContext) -> ActionResult {
        let (template, data) = match event.obligation_type {
            ObligationType::AnnualReport => (
                DocumentTemplate::AnnualReport,
                json!({ "report_year": event.fiscal_year }),
            ),
            ObligationType::TaxFiling => (
                DocumentTemplate::TaxReturn,
                json!({
                    "tax_year": event.fiscal_year,
                    "period": event.period_index + 1,
                    "estimated_amount": event.cost.to_string(),
                }),
            ),
            ObligationType::LicenseRenewal => (
                DocumentTemplate::LicenseRenewal,
                json!({ "renewal_year": event.fiscal_year }),
            ),
            ObligationType::RegisteredAgentRenewal => (
                DocumentTemplate::RegisteredAgentRenewal,
                json!({ "term_year": event.fiscal_year }),
            ),
        };

        let mut payload = json!({
            "entity_name": context.entity_name,
            "entity_ref": context.entity_ref,
            "jurisdiction": context.jurisdiction.as_str(),
            "jurisdiction_code": context.jurisdiction.code(),
            "title": event.title,
            "due_date": event.due_date.to_string(),
            "filing_fee": event.cost.to_string(),
        });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), data.as_object()) {
            target.extend(extra.iter().map(|(key, value)| (key.clone(), value.clone())));
        }

        let request = DocumentRequest {
            template,
            jurisdiction: context.jurisdiction,
            idempotency_key: preparation_key(&context.calendar_id, &event.id),
            data: payload,
        };

        let rendering = tokio::time::timeout(self.timeout, self.documents.render(request));
        let rendered = match rendering.await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(self.timeout.as_secs())),
        };

        match rendered {
            Ok(artifact) => {
                let revenue = service_fee(event.obligation_type);
                info!(
                    event_name = "automation.prepared",
                    calendar_id = %context.calendar_id,
                    event_id = %event.id,
                    template = template.as_str(),
                    revenue = %revenue,
                    "filing prepared, pending approval"
                );
                ActionResult {
                    event_id: event.id.clone(),
                    success: true,
                    revenue,
                    artifacts: vec![artifact],
                    error: None,
                }
            }
            Err(error) => {
                warn!(
                    event_name = "automation.failed",
                    calendar_id = %context.calendar_id,
                    event_id = %event.id,
                    template = template.as_str(),
                    error = %error,
                    "filing preparation failed"
                );
                ActionResult {
                    event_id: event.id.clone(),
                    success: false,
                    revenue: Decimal::ZERO,
                    artifacts: Vec::new(),
                    error: Some(format!("event {}: {error}", event.id)),
                }
            }
        }
    }
}
