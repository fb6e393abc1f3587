//! Compliance calendar projection.
//!
//! [`CalendarGenerator`] is pure: the same entity, rules and dates always
//! yield the same events with the same ids. [`CalendarService`] persists the
//! result, merging into an existing calendar instead of replacing it.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::compliance::{
    CalendarId, ComplianceCalendar, ComplianceEvent, EventId, EventStatus,
};
use crate::domain::jurisdiction::{Jurisdiction, JurisdictionRules, ObligationRule, Schedule};
use crate::errors::{ApplicationError, DomainError};
use crate::locks::KeyedLocks;
use crate::repository::CalendarRepository;

const ACTOR: &str = "calendar-service";

/// Cap used when a service is built without an explicit one.
pub const DEFAULT_MAX_HORIZON_YEARS: u32 = 50;

/// Last year of a span of `years` starting at `first_year`.
fn span_end(first_year: i32, years: u32) -> Result<i32, DomainError> {
    i32::try_from(years)
        .ok()
        .and_then(|years| first_year.checked_add(years))
        .and_then(|end| end.checked_sub(1))
        .filter(|end| *end <= NaiveDate::MAX.year())
        .ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "a {years}-year span from {first_year} leaves the supported date range"
            ))
        })
}

#[derive(Clone, Debug, Default)]
pub struct CalendarGenerator;

impl CalendarGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Events for every obligation of `jurisdiction` in `first_year..=last_year`,
    /// sorted by due date then id. Events due before `formation_date` are skipped.
    pub fn project(
        &self,
        entity_ref: &str,
        jurisdiction: Jurisdiction,
        formation_date: NaiveDate,
        first_year: i32,
        last_year: i32,
        generated_on: NaiveDate,
    ) -> Result<Vec<ComplianceEvent>, DomainError> {
        let rules = JurisdictionRules::for_jurisdiction(jurisdiction);
        let mut events = Vec::new();

        for year in first_year..=last_year {
            for rule in &rules.obligations {
                for (period_index, due_date) in due_dates(rule, year, formation_date)? {
                    if due_date < formation_date {
                        continue;
                    }
                    let event =
                        build_event(entity_ref, rule, year, period_index, due_date, generated_on);
                    events.push(event);
                }
            }
        }

        events.sort_by(|left, right| {
            left.due_date.cmp(&right.due_date).then_with(|| left.id.cmp(&right.id))
        });
        Ok(events)
    }

    /// A new calendar covering `horizon_years` starting at the formation year.
    pub fn generate(
        &self,
        entity_ref: &str,
        entity_name: &str,
        jurisdiction: Jurisdiction,
        formation_date: NaiveDate,
        horizon_years: u32,
        now: DateTime<Utc>,
    ) -> Result<ComplianceCalendar, DomainError> {
        if horizon_years == 0 {
            return Err(DomainError::InvariantViolation(
                "calendar horizon must cover at least one year".to_string(),
            ));
        }
        let first_year = formation_date.year();
        let last_year = span_end(first_year, horizon_years)?;
        let events = self.project(
            entity_ref,
            jurisdiction,
            formation_date,
            first_year,
            last_year,
            now.date_naive(),
        )?;

        Ok(ComplianceCalendar {
            id: CalendarId::for_entity(entity_ref),
            entity_ref: entity_ref.to_string(),
            entity_name: entity_name.to_string(),
            jurisdiction,
            formation_date,
            covers_through_year: last_year,
            created_at: now,
            updated_at: now,
            events,
        })
    }

    /// Appends the next `additional_years` to `calendar`. Returns the number of new events.
    pub fn extend(
        &self,
        calendar: &mut ComplianceCalendar,
        additional_years: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, DomainError> {
        if additional_years == 0 {
            return Ok(0);
        }
        let first_year = calendar.covers_through_year.checked_add(1).ok_or_else(|| {
            DomainError::InvariantViolation(
                "calendar already covers the last supported year".to_string(),
            )
        })?;
        let last_year = span_end(first_year, additional_years)?;
        let events = self.project(
            &calendar.entity_ref,
            calendar.jurisdiction,
            calendar.formation_date,
            first_year,
            last_year,
            now.date_naive(),
        )?;

        let added = calendar.merge_events(events);
        calendar.covers_through_year = last_year;
        calendar.updated_at = now;
        Ok(added)
    }
}

fn due_dates(
    rule: &ObligationRule,
    year: i32,
    formation_date: NaiveDate,
) -> Result<Vec<(u32, NaiveDate)>, DomainError> {
    match &rule.schedule {
        Schedule::FixedDate { month, day } => Ok(vec![(0, clamped_date(year, *month, *day)?)]),
        Schedule::Anniversary { day } => {
            Ok(vec![(0, clamped_date(year, formation_date.month(), *day)?)])
        }
        Schedule::Periodic { period, month_offset, day } => (0..period.per_year())
            .map(|index| {
                let start_month = 1 + index * period.months();
                clamped_date(year, start_month + month_offset, *day).map(|date| (index, date))
            })
            .collect(),
    }
}

/// `month` may run past 12, rolling into the following years. `day` is clamped
/// to the last day of the resulting month.
pub(crate) fn clamped_date(year: i32, month: u32, day: u32) -> Result<NaiveDate, DomainError> {
    let invalid = || DomainError::InvariantViolation(format!("no date for {year}-{month}-{day}"));
    if month == 0 || day == 0 {
        return Err(invalid());
    }
    let year = year + ((month - 1) / 12) as i32;
    let month = (month - 1) % 12 + 1;

    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(invalid)?;
    let last_day = first_of_next.pred_opt().ok_or_else(invalid)?.day();

    NaiveDate::from_ymd_opt(year, month, day.min(last_day)).ok_or_else(invalid)
}

fn build_event(
    entity_ref: &str,
    rule: &ObligationRule,
    year: i32,
    period_index: u32,
    due_date: NaiveDate,
    generated_on: NaiveDate,
) -> ComplianceEvent {
    let lead_days = (due_date - generated_on).num_days().max(0);
    let trigger_days =
        u32::try_from(lead_days).unwrap_or(u32::MAX).min(rule.automation_trigger_days);

    ComplianceEvent {
        id: EventId::derive(entity_ref, &rule.code, year, period_index),
        obligation_type: rule.obligation_type,
        rule_code: rule.code.clone(),
        title: rule.title.clone(),
        fiscal_year: year,
        period_index,
        due_date,
        cost: rule.cost,
        penalty: rule.penalty,
        critical: rule.critical,
        automatable: rule.automatable,
        automation_trigger_days: trigger_days,
        revenue_opportunity: rule.revenue_opportunity,
        status: EventStatus::Scheduled,
        last_error: None,
        preparation: None,
    }
}

/// Request to create (or merge into) the calendar of one entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRequest {
    pub entity_ref: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub jurisdiction: String,
    pub formation_date: NaiveDate,
    #[serde(default)]
    pub horizon_years: Option<u32>,
}

pub struct CalendarService {
    repository: Arc<dyn CalendarRepository>,
    audit: Arc<dyn AuditSink>,
    locks: KeyedLocks,
    generator: CalendarGenerator,
    default_horizon_years: u32,
    max_horizon_years: u32,
}

impl CalendarService {
    /// `locks` must be shared with every other writer of calendars.
    pub fn new(
        repository: Arc<dyn CalendarRepository>,
        audit: Arc<dyn AuditSink>,
        locks: KeyedLocks,
        default_horizon_years: u32,
    ) -> Self {
        Self {
            repository,
            audit,
            locks,
            generator: CalendarGenerator::new(),
            default_horizon_years,
            max_horizon_years: DEFAULT_MAX_HORIZON_YEARS.max(default_horizon_years),
        }
    }

    /// Rejects requested horizons and extensions longer than `max_years`.
    pub fn with_max_horizon_years(mut self, max_years: u32) -> Self {
        self.max_horizon_years = max_years;
        self
    }

    fn check_years(&self, field: &str, years: u32) -> Result<(), ApplicationError> {
        if years == 0 {
            return Err(ApplicationError::Validation(format!("{field} must be at least 1")));
        }
        if years > self.max_horizon_years {
            return Err(ApplicationError::Validation(format!(
                "{field} must be at most {}",
                self.max_horizon_years
            )));
        }
        Ok(())
    }

    pub async fn generate_calendar(
        &self,
        request: CalendarRequest,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<ComplianceCalendar, ApplicationError> {
        let entity_ref = request.entity_ref.trim();
        if entity_ref.is_empty() {
            return Err(ApplicationError::Validation("entity_ref must not be blank".to_string()));
        }
        let jurisdiction = Jurisdiction::parse(&request.jurisdiction).ok_or_else(|| {
            ApplicationError::Validation(format!(
                "unsupported jurisdiction `{}` (expected one of DE|WY|CA)",
                request.jurisdiction
            ))
        })?;
        let horizon_years = request.horizon_years.unwrap_or(self.default_horizon_years);
        self.check_years("horizon_years", horizon_years)?;
        let entity_name = request
            .entity_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(entity_ref);

        let generated = self.generator.generate(
            entity_ref,
            entity_name,
            jurisdiction,
            request.formation_date,
            horizon_years,
            now,
        )?;

        let _guard = self.locks.lock(&generated.id.0).await;
        let (calendar, added) = match self.repository.find_by_id(&generated.id).await? {
            Some(mut existing) => {
                if existing.jurisdiction != jurisdiction
                    || existing.formation_date != request.formation_date
                {
                    return Err(ApplicationError::Validation(format!(
                        "entity `{entity_ref}` already has a calendar for {} formed {}",
                        existing.jurisdiction.code(),
                        existing.formation_date
                    )));
                }
                let added = existing.merge_events(generated.events);
                existing.covers_through_year =
                    existing.covers_through_year.max(generated.covers_through_year);
                existing.updated_at = now;
                (existing, added)
            }
            None => {
                let added = generated.events.len();
                (generated, added)
            }
        };
        self.repository.save(calendar.clone()).await?;

        info!(
            event_name = "calendar.generated",
            correlation_id,
            calendar_id = %calendar.id,
            jurisdiction = calendar.jurisdiction.code(),
            events_added = added,
            events_total = calendar.events.len(),
            covers_through_year = calendar.covers_through_year,
            "compliance calendar generated"
        );
        self.audit.emit(
            AuditEvent::new(
                calendar.id.0.clone(),
                correlation_id,
                "calendar.generated",
                AuditCategory::Calendar,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("events_added", added.to_string())
            .with_metadata("covers_through_year", calendar.covers_through_year.to_string()),
        );

        Ok(calendar)
    }

    pub async fn extend_calendar(
        &self,
        calendar_id: &CalendarId,
        additional_years: u32,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<ComplianceCalendar, ApplicationError> {
        self.check_years("additional_years", additional_years)?;
        let _guard = self.locks.lock(&calendar_id.0).await;
        let mut calendar = self.load(calendar_id).await?;
        let added = self.generator.extend(&mut calendar, additional_years, now)?;
        self.repository.save(calendar.clone()).await?;

        info!(
            event_name = "calendar.extended",
            correlation_id,
            calendar_id = %calendar.id,
            events_added = added,
            covers_through_year = calendar.covers_through_year,
            "compliance calendar extended"
        );
        self.audit.emit(
            AuditEvent::new(
                calendar.id.0.clone(),
                correlation_id,
                "calendar.extended",
                AuditCategory::Calendar,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("events_added", added.to_string()),
        );

        Ok(calendar)
    }

    pub async fn get_calendar(
        &self,
        calendar_id: &CalendarId,
    ) -> Result<ComplianceCalendar, ApplicationError> {
        self.load(calendar_id).await
    }

    async fn load(&self, calendar_id: &CalendarId) -> Result<ComplianceCalendar, ApplicationError> {
        self.repository
            .find_by_id(calendar_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("calendar", calendar_id.0.clone()))
    }
}
