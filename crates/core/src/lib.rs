pub mod audit;
pub mod automation;
pub mod calendar;
pub mod collaborators;
pub mod config;
pub mod documents;
pub mod domain;
pub mod errors;
pub mod execution_engine;
pub mod locks;
pub mod monitor;
pub mod orchestrator;
pub mod repository;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use automation::{ActionResult, AutomationExecutor, EntityContext};
pub use calendar::{CalendarGenerator, CalendarRequest, CalendarService};
pub use collaborators::{
    CollaboratorError, DocumentGenerator, FormationService, StepReceipt, StepRequest,
    StepServiceRouter,
};
pub use documents::TemplateDocumentGenerator;
pub use domain::compliance::{
    CalendarId, ComplianceCalendar, ComplianceEvent, EventId, EventStatus, ObligationType,
};
pub use domain::jurisdiction::{EntityKind, Jurisdiction, JurisdictionRules};
pub use domain::workflow::{
    EntityInfo, StepId, StepKind, StepStatus, WorkflowId, WorkflowInstance, WorkflowStatus,
};
pub use errors::{ApplicationError, DomainError, ErrorKind, InterfaceError};
pub use execution_engine::StepExecutionEngine;
pub use locks::KeyedLocks;
pub use monitor::{classify, ComplianceMonitor, ComplianceReport, ComplianceStatus, MonitorSettings};
pub use orchestrator::{ProgressSnapshot, StepResult, WorkflowOrchestrator};
pub use repository::{
    CalendarRepository, InMemoryCalendarRepository, InMemoryWorkflowRepository, StoreError,
    WorkflowRepository,
};
