use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use charter_core::config::AppConfig;
use charter_core::{
    AutomationExecutor, CalendarId, CalendarRequest, CalendarService, ComplianceMonitor,
    KeyedLocks, MonitorSettings, TemplateDocumentGenerator, TracingAuditSink,
};
use charter_db::{DbPool, SqlCalendarRepository};

use crate::commands::{correlation_id, to_data, with_store, CommandResult};
use crate::CalendarCommand;

struct CalendarServices {
    calendars: CalendarService,
    monitor: ComplianceMonitor,
}

fn services(config: &AppConfig, pool: DbPool) -> Result<CalendarServices, CommandResult> {
    let documents = TemplateDocumentGenerator::with_embedded_templates().map_err(|error| {
        CommandResult::failure("calendar", "template_load", error.to_string(), 3)
    })?;
    let repository = Arc::new(SqlCalendarRepository::new(pool));
    let audit = Arc::new(TracingAuditSink);
    let locks = KeyedLocks::default();

    Ok(CalendarServices {
        calendars: CalendarService::new(
            repository.clone(),
            audit.clone(),
            locks.clone(),
            config.compliance.horizon_years,
        )
        .with_max_horizon_years(config.compliance.max_horizon_years),
        monitor: ComplianceMonitor::new(
            repository,
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
        ),
    })
}

/// `as_of` dates are evaluated at noon UTC.
fn evaluation_time(as_of: Option<NaiveDate>) -> DateTime<Utc> {
    as_of
        .and_then(|date| date.and_hms_opt(12, 0, 0))
        .map(|moment| moment.and_utc())
        .unwrap_or_else(Utc::now)
}

pub fn run(command: CalendarCommand) -> CommandResult {
    match command {
        CalendarCommand::Generate { entity_ref, name, jurisdiction, formation_date, years } => {
            with_store("calendar.generate", |config, pool| async move {
                let services = match services(&config, pool) {
                    Ok(services) => services,
                    Err(failure) => return failure,
                };
                let request = CalendarRequest {
                    entity_ref,
                    entity_name: name,
                    jurisdiction,
                    formation_date,
                    horizon_years: years,
                };
                match services
                    .calendars
                    .generate_calendar(request, Utc::now(), &correlation_id())
                    .await
                {
                    Ok(calendar) => CommandResult::success_with_data(
                        "calendar.generate",
                        format!(
                            "calendar {} holds {} events through {}",
                            calendar.id,
                            calendar.events.len(),
                            calendar.covers_through_year
                        ),
                        to_data(&calendar),
                    ),
                    Err(error) => CommandResult::application_failure("calendar.generate", &error),
                }
            })
        }
        CalendarCommand::Extend { calendar_id, years } => {
            with_store("calendar.extend", |config, pool| async move {
                let services = match services(&config, pool) {
                    Ok(services) => services,
                    Err(failure) => return failure,
                };
                let result = services
                    .calendars
                    .extend_calendar(&CalendarId(calendar_id), years, Utc::now(), &correlation_id())
                    .await;
                match result {
                    Ok(calendar) => CommandResult::success_with_data(
                        "calendar.extend",
                        format!(
                            "calendar {} now covers {}",
                            calendar.id, calendar.covers_through_year
                        ),
                        to_data(&calendar),
                    ),
                    Err(error) => CommandResult::application_failure("calendar.extend", &error),
                }
            })
        }
        CalendarCommand::Show { calendar_id } => {
            with_store("calendar.show", |config, pool| async move {
                let services = match services(&config, pool) {
                    Ok(services) => services,
                    Err(failure) => return failure,
                };
                match services.calendars.get_calendar(&CalendarId(calendar_id)).await {
                    Ok(calendar) => CommandResult::success_with_data(
                        "calendar.show",
                        format!("calendar {} for {}", calendar.id, calendar.entity_name),
                        to_data(&calendar),
                    ),
                    Err(error) => CommandResult::application_failure("calendar.show", &error),
                }
            })
        }
        CalendarCommand::Monitor { calendar_id, as_of } => {
            with_store("calendar.monitor", |config, pool| async move {
                let services = match services(&config, pool) {
                    Ok(services) => services,
                    Err(failure) => return failure,
                };
                let result = services
                    .monitor
                    .monitor(&CalendarId(calendar_id), evaluation_time(as_of), &correlation_id())
                    .await;
                match result {
                    Ok(report) => CommandResult::success_with_data(
                        "calendar.monitor",
                        format!(
                            "{}: {} overdue, {} upcoming, {} prepared",
                            report.status.as_str(),
                            report.overdue.len(),
                            report.upcoming.len(),
                            report.actions.iter().filter(|action| action.success).count()
                        ),
                        to_data(&report),
                    ),
                    Err(error) => CommandResult::application_failure("calendar.monitor", &error),
                }
            })
        }
        CalendarCommand::Sweep { as_of } => {
            with_store("calendar.sweep", |config, pool| async move {
                let services = match services(&config, pool) {
                    Ok(services) => services,
                    Err(failure) => return failure,
                };
                match services.monitor.sweep_all(evaluation_time(as_of), &correlation_id()).await {
                    Ok(summary) => CommandResult::success_with_data(
                        "calendar.sweep",
                        format!(
                            "monitored {} calendars, {} failed",
                            summary.reports.len(),
                            summary.failures.len()
                        ),
                        to_data(&summary),
                    ),
                    Err(error) => CommandResult::application_failure("calendar.sweep", &error),
                }
            })
        }
    }
}
