use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::jurisdiction::{EntityKind, Jurisdiction};
use crate::domain::semantic_id;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

/// Idempotency key handed to collaborators for one side-effecting call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey(pub String);

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl OperationKey {
    /// Same key for every attempt of a step, so a remote service can drop a
    /// replay of an action that already succeeded.
    pub fn for_step(workflow_id: &WorkflowId, step_id: &StepId) -> Self {
        Self(semantic_id("op", &["step", &workflow_id.0, &step_id.0]))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    NameAvailability,
    RegisteredAgent,
    FormationFiling,
    EinApplication,
    GoverningDocument,
    StateTaxRegistration,
    BeneficialOwnershipReport,
    BankAccount,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NameAvailability => "name_availability",
            Self::RegisteredAgent => "registered_agent",
            Self::FormationFiling => "formation_filing",
            Self::EinApplication => "ein_application",
            Self::GoverningDocument => "governing_document",
            Self::StateTaxRegistration => "state_tax_registration",
            Self::BeneficialOwnershipReport => "beneficial_ownership_report",
            Self::BankAccount => "bank_account",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    pub kind: StepKind,
    pub name: String,
    pub dependency_ids: Vec<StepId>,
    pub nominal_duration_days: u32,
    pub nominal_cost: Decimal,
    pub automatable: bool,
    pub critical: bool,
}

/// Immutable, ordered step template for one jurisdiction and entity kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    jurisdiction: Jurisdiction,
    entity_kind: EntityKind,
    steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    /// Builds a definition, rejecting duplicate ids, unknown dependencies and cycles.
    pub fn new(
        jurisdiction: Jurisdiction,
        entity_kind: EntityKind,
        steps: Vec<StepSpec>,
    ) -> Result<Self, DomainError> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.clone()) {
                return Err(DomainError::InvalidDefinition(format!(
                    "duplicate step id `{}`",
                    step.id
                )));
            }
        }

        for step in &steps {
            if let Some(unknown) = step.dependency_ids.iter().find(|dep| !seen.contains(*dep)) {
                return Err(DomainError::InvalidDefinition(format!(
                    "step `{}` depends on unknown step `{unknown}`",
                    step.id
                )));
            }
        }

        topological_order(&steps)?;

        Ok(Self { jurisdiction, entity_kind, steps })
    }

    pub fn jurisdiction(&self) -> Jurisdiction {
        self.jurisdiction
    }

    pub fn entity_kind(&self) -> EntityKind {
        self.entity_kind
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn step(&self, id: &StepId) -> Option<&StepSpec> {
        self.steps.iter().find(|step| &step.id == id)
    }

    pub fn total_nominal_cost(&self) -> Decimal {
        self.steps.iter().map(|step| step.nominal_cost).sum()
    }

    /// Longest dependency chain measured in nominal days.
    pub fn critical_path_days(&self) -> u32 {
        let mut finish: HashMap<&StepId, u32> = HashMap::new();
        // Definitions are validated acyclic, so the order always resolves.
        let order = topological_order(&self.steps).unwrap_or_default();
        for index in order {
            let step = &self.steps[index];
            let start = step
                .dependency_ids
                .iter()
                .filter_map(|dep| finish.get(dep).copied())
                .max()
                .unwrap_or(0);
            finish.insert(&step.id, start + step.nominal_duration_days);
        }
        finish.values().copied().max().unwrap_or(0)
    }
}

fn topological_order(steps: &[StepSpec]) -> Result<Vec<usize>, DomainError> {
    let index: HashMap<&StepId, usize> =
        steps.iter().enumerate().map(|(position, step)| (&step.id, position)).collect();
    let mut remaining: Vec<usize> = steps.iter().map(|step| step.dependency_ids.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (position, step) in steps.iter().enumerate() {
        for dep in &step.dependency_ids {
            if let Some(&dep_position) = index.get(dep) {
                dependents[dep_position].push(position);
            }
        }
    }

    let mut ready: Vec<usize> = (0..steps.len()).filter(|&i| remaining[i] == 0).rev().collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != steps.len() {
        return Err(DomainError::InvalidDefinition(
            "step dependencies contain a cycle".to_string(),
        ));
    }
    Ok(order)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub id: StepId,
    pub kind: StepKind,
    pub name: String,
    pub dependency_ids: Vec<StepId>,
    pub critical: bool,
    pub automatable: bool,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl From<&StepSpec> for StepState {
    fn from(spec: &StepSpec) -> Self {
        Self {
            id: spec.id.clone(),
            kind: spec.kind,
            name: spec.name.clone(),
            dependency_ids: spec.dependency_ids.clone(),
            critical: spec.critical,
            automatable: spec.automatable,
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTransitionRecord {
    pub step_id: StepId,
    pub from: StepStatus,
    pub to: StepStatus,
    pub reason: String,
    pub progress_after: u8,
    pub occurred_at: DateTime<Utc>,
}

/// Formation request as received from a caller, before validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub entity_name: String,
    pub jurisdiction: String,
    #[serde(default)]
    pub entity_kind: EntityKind,
    #[serde(default)]
    pub contact_email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub entity_name: String,
    pub entity_kind: EntityKind,
    pub jurisdiction: Jurisdiction,
    pub contact_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepState>,
    pub progress: u8,
    pub status: WorkflowStatus,
    pub history: Vec<StepTransitionRecord>,
}

impl WorkflowInstance {
    pub fn from_definition(
        id: WorkflowId,
        entity_name: impl Into<String>,
        contact_email: Option<String>,
        definition: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            entity_name: entity_name.into(),
            entity_kind: definition.entity_kind(),
            jurisdiction: definition.jurisdiction(),
            contact_email,
            created_at: now,
            updated_at: now,
            completed_at: None,
            steps: definition.steps().iter().map(StepState::from).collect(),
            progress: 0,
            status: WorkflowStatus::InProgress,
            history: Vec::new(),
        }
    }

    pub fn step(&self, id: &StepId) -> Option<&StepState> {
        self.steps.iter().find(|step| &step.id == id)
    }

    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|step| &step.id == id)
    }

    /// Dependencies of `step` that are not yet completed, in declaration order.
    pub fn unmet_dependencies(&self, step: &StepState) -> Vec<StepId> {
        step.dependency_ids
            .iter()
            .filter(|dep| {
                self.step(dep).map(|state| state.status != StepStatus::Completed).unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Pending steps whose dependencies are all completed.
    pub fn actionable_step_ids(&self) -> Vec<StepId> {
        self.steps_ready_in(StepStatus::Pending)
    }

    /// Failed steps whose dependencies are all completed.
    pub fn retryable_step_ids(&self) -> Vec<StepId> {
        self.steps_ready_in(StepStatus::Failed)
    }

    fn steps_ready_in(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|step| step.status == status && self.unmet_dependencies(step).is_empty())
            .map(|step| step.id.clone())
            .collect()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|step| step.status == StepStatus::Completed).count()
    }

    pub fn compute_progress(&self) -> u8 {
        if self.steps.is_empty() {
            return 100;
        }
        ((self.completed_steps() * 100) / self.steps.len()) as u8
    }

    pub fn critical_steps_completed(&self) -> bool {
        self.steps
            .iter()
            .filter(|step| step.critical)
            .all(|step| step.status == StepStatus::Completed)
    }

    /// Recomputes progress and archives the workflow once every critical step is done.
    /// Returns true when this call moved the workflow to completed.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) -> bool {
        self.progress = self.progress.max(self.compute_progress());
        self.updated_at = now;

        if self.status == WorkflowStatus::InProgress && self.critical_steps_completed() {
            self.status = WorkflowStatus::Completed;
            self.completed_at = Some(now);
            return true;
        }
        false
    }
}
