//! Compliance Monitor
//!
//! Classifies calendar events relative to a point in time and dispatches
//! eligible ones to the [`AutomationExecutor`]. Each pass follows the same
//! reserve, act, commit discipline as step execution: actionable events are
//! reserved in an in-flight set under the calendar lock, prepared without the
//! lock and committed with a `scheduled -> actioned` check under the lock.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::automation::{ActionResult, AutomationExecutor, EntityContext};
use crate::calendar::CalendarGenerator;
use crate::domain::compliance::{
    CalendarId, ComplianceCalendar, ComplianceEvent, EventId, EventStatus, ObligationType,
    Preparation,
};
use crate::errors::ApplicationError;
use crate::locks::{InFlight, KeyedLocks};
use crate::repository::CalendarRepository;

const ACTOR: &str = "compliance-monitor";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventClassification {
    pub days_until_due: i64,
    pub overdue: bool,
    pub upcoming: bool,
    pub actionable: bool,
}

/// Pure classification of one event as of `today`.
pub fn classify(
    due_date: NaiveDate,
    automatable: bool,
    automation_trigger_days: u32,
    status: EventStatus,
    today: NaiveDate,
    upcoming_window_days: u32,
) -> EventClassification {
    let days_until_due = (due_date - today).num_days();
    let in_future = days_until_due >= 0;

    EventClassification {
        days_until_due,
        overdue: !in_future && status != EventStatus::Actioned,
        upcoming: in_future && days_until_due <= i64::from(upcoming_window_days),
        actionable: automatable
            && in_future
            && days_until_due <= i64::from(automation_trigger_days)
            && status == EventStatus::Scheduled,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    ActionRequired,
    NonCompliant,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::ActionRequired => "action_required",
            Self::NonCompliant => "non_compliant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_id: EventId,
    pub obligation_type: ObligationType,
    pub title: String,
    pub due_date: NaiveDate,
    pub days_until_due: i64,
    pub status: EventStatus,
    pub critical: bool,
    pub penalty: Decimal,
    pub revenue_opportunity: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub calendar_id: CalendarId,
    pub as_of: NaiveDate,
    pub status: ComplianceStatus,
    pub overdue: Vec<EventSummary>,
    pub upcoming: Vec<EventSummary>,
    pub actionable: Vec<EventId>,
    /// Upcoming and overdue events, overdue first, then by revenue descending.
    pub opportunities: Vec<EventSummary>,
    pub revenue_opportunity: Decimal,
    pub actions: Vec<ActionResult>,
    pub newly_overdue_unactioned: Vec<EventId>,
    pub extended_through_year: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub reports: Vec<ComplianceReport>,
    pub failures: Vec<(CalendarId, String)>,
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub upcoming_window_days: u32,
    pub auto_extend: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { upcoming_window_days: 30, auto_extend: true }
    }
}

pub struct ComplianceMonitor {
    repository: Arc<dyn CalendarRepository>,
    executor: AutomationExecutor,
    audit: Arc<dyn AuditSink>,
    locks: KeyedLocks,
    in_flight: InFlight,
    generator: CalendarGenerator,
    settings: MonitorSettings,
}

struct Reserved {
    report: ComplianceReport,
    context: EntityContext,
    events: Vec<ComplianceEvent>,
}

impl ComplianceMonitor {
    /// `locks` must be shared with every other writer of calendars.
    pub fn new(
        repository: Arc<dyn CalendarRepository>,
        executor: AutomationExecutor,
        audit: Arc<dyn AuditSink>,
        locks: KeyedLocks,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            repository,
            executor,
            audit,
            locks,
            in_flight: InFlight::default(),
            generator: CalendarGenerator::new(),
            settings,
        }
    }

    pub async fn monitor(
        &self,
        calendar_id: &CalendarId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<ComplianceReport, ApplicationError> {
        let Reserved { mut report, context, events } = self.reserve(calendar_id, now).await?;

        let mut results = Vec::with_capacity(events.len());
        for event in &events {
            results.push(self.executor.execute(event, &context).await);
        }

        let committed = self.commit(calendar_id, &results, now).await;
        for event in &events {
            self.in_flight.release(&in_flight_key(calendar_id, &event.id));
        }
        committed?;

        for result in &results {
            self.audit.emit(
                AuditEvent::new(
                    calendar_id.0.clone(),
                    correlation_id,
                    if result.success { "automation.prepared" } else { "automation.failed" },
                    AuditCategory::Automation,
                    ACTOR,
                    if result.success { AuditOutcome::Success } else { AuditOutcome::Failed },
                )
                .with_metadata("event_id", result.event_id.0.clone())
                .with_metadata("revenue", result.revenue.to_string()),
            );
        }
        report.actions = results;

        info!(
            event_name = "compliance.monitor.completed",
            correlation_id,
            calendar_id = %calendar_id,
            status = report.status.as_str(),
            overdue = report.overdue.len(),
            upcoming = report.upcoming.len(),
            actioned = report.actions.iter().filter(|action| action.success).count(),
            "compliance monitor pass finished"
        );
        Ok(report)
    }

    /// Runs [`Self::monitor`] over every stored calendar. One failing calendar
    /// does not stop the sweep.
    pub async fn sweep_all(
        &self,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<SweepSummary, ApplicationError> {
        let mut summary = SweepSummary::default();
        for calendar_id in self.repository.list_ids().await? {
            match self.monitor(&calendar_id, now, correlation_id).await {
                Ok(report) => summary.reports.push(report),
                Err(error) => {
                    warn!(
                        event_name = "compliance.sweep.calendar_failed",
                        correlation_id,
                        calendar_id = %calendar_id,
                        error = %error,
                        "compliance monitor pass failed"
                    );
                    summary.failures.push((calendar_id, error.to_string()));
                }
            }
        }
        Ok(summary)
    }

    async fn reserve(
        &self,
        calendar_id: &CalendarId,
        now: DateTime<Utc>,
    ) -> Result<Reserved, ApplicationError> {
        let today = now.date_naive();
        let _guard = self.locks.lock(&calendar_id.0).await;
        let mut calendar = self.load(calendar_id).await?;
        let mut changed = false;

        let mut extended_through_year = None;
        let required_year = today.year() + 1;
        if self.settings.auto_extend && calendar.covers_through_year < required_year {
            let missing = (required_year - calendar.covers_through_year) as u32;
            self.generator.extend(&mut calendar, missing, now)?;
            extended_through_year = Some(calendar.covers_through_year);
            changed = true;
        }

        let mut report = ComplianceReport {
            calendar_id: calendar_id.clone(),
            as_of: today,
            status: ComplianceStatus::Compliant,
            overdue: Vec::new(),
            upcoming: Vec::new(),
            actionable: Vec::new(),
            opportunities: Vec::new(),
            revenue_opportunity: Decimal::ZERO,
            actions: Vec::new(),
            newly_overdue_unactioned: Vec::new(),
            extended_through_year,
        };
        let mut reserved = Vec::new();

        for event in &mut calendar.events {
            let class = classify(
                event.due_date,
                event.automatable,
                event.automation_trigger_days,
                event.status,
                today,
                self.settings.upcoming_window_days,
            );

            if class.overdue {
                report.overdue.push(summarize(event, class.days_until_due));
            }
            if class.upcoming {
                report.upcoming.push(summarize(event, class.days_until_due));
            }
            if class.actionable {
                report.actionable.push(event.id.clone());
                if self.in_flight.try_reserve(&in_flight_key(calendar_id, &event.id)) {
                    reserved.push(event.clone());
                }
            }
            if class.overdue && event.status == EventStatus::Scheduled {
                event.status = EventStatus::OverdueUnactioned;
                report.newly_overdue_unactioned.push(event.id.clone());
                changed = true;
            }
        }

        if changed {
            calendar.updated_at = now;
            if let Err(error) = self.repository.save(calendar.clone()).await {
                for event in &reserved {
                    self.in_flight.release(&in_flight_key(calendar_id, &event.id));
                }
                return Err(error.into());
            }
        }

        for event_id in &report.newly_overdue_unactioned {
            warn!(
                event_name = "compliance.event.overdue_unactioned",
                calendar_id = %calendar_id,
                event_id = %event_id,
                "automation window closed without preparation"
            );
        }

        report.status = if !report.overdue.is_empty() {
            ComplianceStatus::NonCompliant
        } else if !report.upcoming.is_empty() {
            ComplianceStatus::ActionRequired
        } else {
            ComplianceStatus::Compliant
        };
        report.opportunities = rank_opportunities(&report.overdue, &report.upcoming);
        report.revenue_opportunity =
            report.opportunities.iter().map(|summary| summary.revenue_opportunity).sum();

        let context = EntityContext {
            calendar_id: calendar.id.clone(),
            entity_ref: calendar.entity_ref.clone(),
            entity_name: calendar.entity_name.clone(),
            jurisdiction: calendar.jurisdiction,
        };
        Ok(Reserved { report, context, events: reserved })
    }

    async fn commit(
        &self,
        calendar_id: &CalendarId,
        results: &[ActionResult],
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        if results.is_empty() {
            return Ok(());
        }
        let _guard = self.locks.lock(&calendar_id.0).await;
        let mut calendar = self.load(calendar_id).await?;

        for result in results {
            let Some(event) = calendar.event_mut(&result.event_id) else {
                continue;
            };
            if event.status != EventStatus::Scheduled {
                continue;
            }
            if result.success {
                event.status = EventStatus::Actioned;
                event.last_error = None;
                event.preparation = Some(Preparation {
                    artifacts: result.artifacts.clone(),
                    revenue: result.revenue,
                    prepared_at: now,
                    pending_approval: true,
                });
            } else {
                event.last_error = result.error.clone();
            }
        }
        calendar.updated_at = now;
        self.repository.save(calendar).await?;
        Ok(())
    }

    async fn load(&self, calendar_id: &CalendarId) -> Result<ComplianceCalendar, ApplicationError> {
        self.repository
            .find_by_id(calendar_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("calendar", calendar_id.0.clone()))
    }
}

fn in_flight_key(calendar_id: &CalendarId, event_id: &EventId) -> String {
    format!("{}:{}", calendar_id.0, event_id.0)
}

fn summarize(event: &ComplianceEvent, days_until_due: i64) -> EventSummary {
    EventSummary {
        event_id: event.id.clone(),
        obligation_type: event.obligation_type,
        title: event.title.clone(),
        due_date: event.due_date,
        days_until_due,
        status: event.status,
        critical: event.critical,
        penalty: event.penalty,
        revenue_opportunity: event.revenue_opportunity,
    }
}

fn rank_opportunities(overdue: &[EventSummary], upcoming: &[EventSummary]) -> Vec<EventSummary> {
    let mut ranked: Vec<(bool, EventSummary)> = overdue
        .iter()
        .map(|summary| (true, summary.clone()))
        .chain(upcoming.iter().map(|summary| (false, summary.clone())))
        .collect();
    ranked.sort_by(|(left_overdue, left), (right_overdue, right)| {
        right_overdue
            .cmp(left_overdue)
            .then_with(|| right.revenue_opportunity.cmp(&left.revenue_opportunity))
            .then_with(|| left.due_date.cmp(&right.due_date))
            .then_with(|| left.event_id.cmp(&right.event_id))
    });
    ranked.into_iter().map(|(_, summary)| summary).collect()
}
