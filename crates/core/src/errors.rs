use thiserror::Error;

use crate::domain::workflow::{StepId, StepStatus};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid step transition for `{step_id}` from {from:?} to {to:?}")]
    InvalidStepTransition { step_id: StepId, from: StepStatus, to: StepStatus },
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Coarse classification used by transports and CLI output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    DependencyNotSatisfied,
    AlreadyInProgress,
    AlreadyCompleted,
    ExternalService,
    Persistence,
    Configuration,
    Domain,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found",
            Self::DependencyNotSatisfied => "dependency_not_satisfied",
            Self::AlreadyInProgress => "already_in_progress",
            Self::AlreadyCompleted => "already_completed",
            Self::ExternalService => "external_service_error",
            Self::Persistence => "persistence_error",
            Self::Configuration => "configuration_error",
            Self::Domain => "domain_error",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("step `{step_id}` is waiting on dependencies: {unmet:?}")]
    DependencyNotSatisfied { step_id: StepId, unmet: Vec<StepId> },
    #[error("step `{0}` is already in progress")]
    AlreadyInProgress(StepId),
    #[error("step `{0}` is already completed")]
    AlreadyCompleted(StepId),
    #[error("external service failure during {operation}: {message}")]
    ExternalService { operation: String, message: String },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { resource, id: id.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain(_) => ErrorKind::Domain,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DependencyNotSatisfied { .. } => ErrorKind::DependencyNotSatisfied,
            Self::AlreadyInProgress(_) => ErrorKind::AlreadyInProgress,
            Self::AlreadyCompleted(_) => ErrorKind::AlreadyCompleted,
            Self::ExternalService { .. } => ErrorKind::ExternalService,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Safe to repeat the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalService { .. } | Self::Persistence(_))
    }

    /// The caller should poll or wait; the workflow itself has not failed.
    pub fn is_wait_signal(&self) -> bool {
        matches!(
            self,
            Self::DependencyNotSatisfied { .. }
                | Self::AlreadyInProgress(_)
                | Self::AlreadyCompleted(_)
        )
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::Conflict { .. } => "The step is not ready yet. Wait and check status again.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Validation(_) | ApplicationError::Domain(_) => {
                Self::BadRequest { message, correlation_id }
            }
            ApplicationError::NotFound { .. } => Self::NotFound { message, correlation_id },
            ApplicationError::DependencyNotSatisfied { .. }
            | ApplicationError::AlreadyInProgress(_)
            | ApplicationError::AlreadyCompleted(_) => Self::Conflict { message, correlation_id },
            ApplicationError::ExternalService { .. } | ApplicationError::Persistence(_) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(_) => Self::Internal { message, correlation_id },
        }
    }
}
