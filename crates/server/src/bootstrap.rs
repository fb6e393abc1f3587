use std::sync::Arc;
use std::time::Duration;

use charter_core::config::{AppConfig, ConfigError};
use charter_core::{
    AutomationExecutor, CalendarService, ComplianceMonitor, FormationService, KeyedLocks,
    MonitorSettings, StepServiceRouter, TemplateDocumentGenerator, TracingAuditSink,
    WorkflowOrchestrator,
};
use charter_db::{
    connect_with_settings, migrations, DbPool, SqlCalendarRepository, SqlWorkflowRepository,
    SubmissionQueue,
};
use thiserror::Error;
use tracing::info;

use crate::api::AppState;
use crate::registration::HttpRegistrationService;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("filing templates failed to load: {0}")]
    Templates(String),
    #[error("registration client could not be built: {0}")]
    RegistrationClient(#[source] reqwest::Error),
}

#[cfg(test)]
pub async fn bootstrap(
    options: charter_core::config::LoadOptions,
) -> Result<Application, BootstrapError> {
    bootstrap_with_config(AppConfig::load(options)?).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let state = build_state(&config, db_pool.clone())?;
    Ok(Application { config, db_pool, state })
}

/// Wires the services for one pool. Calendar writers share one set of keyed locks.
pub fn build_state(config: &AppConfig, db_pool: DbPool) -> Result<AppState, BootstrapError> {
    let audit = Arc::new(TracingAuditSink);

    let formation: Arc<dyn FormationService> = match &config.services.registration_base_url {
        Some(base_url) => {
            info!(
                event_name = "system.bootstrap.registration_service",
                correlation_id = "bootstrap",
                mode = "http",
                base_url = %base_url,
                "formation steps are sent to the registration service"
            );
            Arc::new(
                HttpRegistrationService::new(
                    base_url,
                    config.services.registration_api_key.clone(),
                    Duration::from_secs(config.services.request_timeout_secs),
                )
                .map_err(BootstrapError::RegistrationClient)?,
            )
        }
        None => {
            info!(
                event_name = "system.bootstrap.registration_service",
                correlation_id = "bootstrap",
                mode = "queue",
                "formation steps are queued for manual filing"
            );
            Arc::new(SubmissionQueue::new(db_pool.clone()))
        }
    };

    let orchestrator = WorkflowOrchestrator::new(
        Arc::new(SqlWorkflowRepository::new(db_pool.clone())),
        StepServiceRouter::with_fallback(formation),
        audit.clone(),
        Duration::from_secs(config.execution.step_timeout_secs),
    );

    let documents = TemplateDocumentGenerator::with_embedded_templates()
        .map_err(|error| BootstrapError::Templates(error.to_string()))?;
    let calendars = Arc::new(SqlCalendarRepository::new(db_pool));
    let locks = KeyedLocks::default();

    let calendar_service = CalendarService::new(
        calendars.clone(),
        audit.clone(),
        locks.clone(),
        config.compliance.horizon_years,
    )
    .with_max_horizon_years(config.compliance.max_horizon_years);
    let monitor = ComplianceMonitor::new(
        calendars,
        AutomationExecutor::new(
            Arc::new(documents),
            Duration::from_secs(config.services.request_timeout_secs),
        ),
        audit,
        locks,
        MonitorSettings {
            upcoming_window_days: config.compliance.upcoming_window_days,
            auto_extend: config.compliance.auto_extend,
        },
    );

    Ok(AppState {
        orchestrator: Arc::new(orchestrator),
        calendars: Arc::new(calendar_service),
        monitor: Arc::new(monitor),
    })
}
