use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::compliance::{CalendarId, ComplianceCalendar};
use crate::domain::workflow::{WorkflowId, WorkflowInstance};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        Self::Persistence(value.to_string())
    }
}

/// One durable record per workflow instance, holding the full structure.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<WorkflowInstance>, StoreError>;
    async fn save(&self, instance: WorkflowInstance) -> Result<(), StoreError>;
}

/// One durable record per compliance calendar, holding the full structure.
#[async_trait]
pub trait CalendarRepository: Send + Sync {
    async fn find_by_id(&self, id: &CalendarId) -> Result<Option<ComplianceCalendar>, StoreError>;
    async fn save(&self, calendar: ComplianceCalendar) -> Result<(), StoreError>;
    async fn list_ids(&self) -> Result<Vec<CalendarId>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    instances: RwLock<HashMap<String, WorkflowInstance>>,
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<WorkflowInstance>, StoreError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn save(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.0.clone(), instance);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCalendarRepository {
    calendars: RwLock<HashMap<String, ComplianceCalendar>>,
}

#[async_trait]
impl CalendarRepository for InMemoryCalendarRepository {
    async fn find_by_id(&self, id: &CalendarId) -> Result<Option<ComplianceCalendar>, StoreError> {
        let calendars = self.calendars.read().await;
        Ok(calendars.get(&id.0).cloned())
    }

    async fn save(&self, calendar: ComplianceCalendar) -> Result<(), StoreError> {
        let mut calendars = self.calendars.write().await;
        calendars.insert(calendar.id.0.clone(), calendar);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<CalendarId>, StoreError> {
        let calendars = self.calendars.read().await;
        let mut ids: Vec<String> = calendars.keys().cloned().collect();
        ids.sort();
        Ok(ids.into_iter().map(CalendarId).collect())
    }
}
