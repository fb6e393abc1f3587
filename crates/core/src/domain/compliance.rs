use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::jurisdiction::Jurisdiction;
use crate::domain::semantic_id;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalendarId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl CalendarId {
    /// One calendar per entity, so the id is derived from the entity reference alone.
    pub fn for_entity(entity_ref: &str) -> Self {
        Self(semantic_id("cal", &[entity_ref]))
    }
}

impl EventId {
    pub fn derive(entity_ref: &str, rule_code: &str, year: i32, period_index: u32) -> Self {
        Self(semantic_id(
            "evt",
            &[entity_ref, rule_code, &year.to_string(), &period_index.to_string()],
        ))
    }
}

impl fmt::Display for CalendarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationType {
    AnnualReport,
    TaxFiling,
    LicenseRenewal,
    RegisteredAgentRenewal,
}

impl ObligationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnnualReport => "annual_report",
            Self::TaxFiling => "tax_filing",
            Self::LicenseRenewal => "license_renewal",
            Self::RegisteredAgentRenewal => "registered_agent_renewal",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    Actioned,
    OverdueUnactioned,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Actioned => "actioned",
            Self::OverdueUnactioned => "overdue_unactioned",
        }
    }
}

/// A rendered filing draft produced by the document generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub media_type: String,
    pub content: String,
    pub checksum: String,
}

/// Outcome of automated preparation. Submission still needs explicit approval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preparation {
    pub artifacts: Vec<Artifact>,
    pub revenue: Decimal,
    pub prepared_at: DateTime<Utc>,
    pub pending_approval: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceEvent {
    pub id: EventId,
    pub obligation_type: ObligationType,
    pub rule_code: String,
    pub title: String,
    pub fiscal_year: i32,
    pub period_index: u32,
    pub due_date: NaiveDate,
    pub cost: Decimal,
    pub penalty: Decimal,
    pub critical: bool,
    pub automatable: bool,
    pub automation_trigger_days: u32,
    pub revenue_opportunity: Decimal,
    pub status: EventStatus,
    pub last_error: Option<String>,
    pub preparation: Option<Preparation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCalendar {
    pub id: CalendarId,
    pub entity_ref: String,
    pub entity_name: String,
    pub jurisdiction: Jurisdiction,
    pub formation_date: NaiveDate,
    pub covers_through_year: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<ComplianceEvent>,
}

impl ComplianceCalendar {
    pub fn event(&self, id: &EventId) -> Option<&ComplianceEvent> {
        self.events.iter().find(|event| &event.id == id)
    }

    pub fn event_mut(&mut self, id: &EventId) -> Option<&mut ComplianceEvent> {
        self.events.iter_mut().find(|event| &event.id == id)
    }

    /// Appends events whose ids are not yet present; existing events are left untouched.
    /// Returns the number of events added.
    pub fn merge_events(&mut self, events: Vec<ComplianceEvent>) -> usize {
        let mut added = 0;
        for event in events {
            if self.event(&event.id).is_none() {
                self.events.push(event);
                added += 1;
            }
        }
        self.events.sort_by(|left, right| {
            left.due_date.cmp(&right.due_date).then_with(|| left.id.cmp(&right.id))
        });
        added
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use super::{
        CalendarId, ComplianceCalendar, ComplianceEvent, EventId, EventStatus, ObligationType,
    };
    use crate::domain::jurisdiction::Jurisdiction;

    fn event(id: &str, due: NaiveDate) -> ComplianceEvent {
        ComplianceEvent {
            id: EventId(id.to_string()),
            obligation_type: ObligationType::AnnualReport,
            rule_code: "wy_annual_report".to_string(),
            title: "Wyoming annual report".to_string(),
            fiscal_year: 2025,
            period_index: 0,
            due_date: due,
            cost: Decimal::new(6000, 2),
            penalty: Decimal::new(5000, 2),
            critical: true,
            automatable: true,
            automation_trigger_days: 45,
            revenue_opportunity: Decimal::new(4900, 2),
            status: EventStatus::Scheduled,
            last_error: None,
            preparation: None,
        }
    }

    #[test]
    fn event_ids_depend_on_every_key_part() {
        let base = EventId::derive("ent-1", "wy_annual_report", 2025, 0);

        assert_eq!(base, EventId::derive("ent-1", "wy_annual_report", 2025, 0));
        assert_ne!(base, EventId::derive("ent-2", "wy_annual_report", 2025, 0));
        assert_ne!(base, EventId::derive("ent-1", "wy_annual_report", 2026, 0));
        assert_ne!(base, EventId::derive("ent-1", "wy_annual_report", 2025, 1));
        assert_ne!(base, EventId::derive("ent-1", "wy_registered_agent", 2025, 0));
    }

    #[test]
    fn merge_keeps_existing_events_and_sorts_by_due_date() {
        let now = Utc::now();
        let early = NaiveDate::from_ymd_opt(2025, 3, 1).expect("valid date");
        let late = NaiveDate::from_ymd_opt(2025, 9, 1).expect("valid date");
        let mut calendar = ComplianceCalendar {
            id: CalendarId::for_entity("ent-1"),
            entity_ref: "ent-1".to_string(),
            entity_name: "Acme LLC".to_string(),
            jurisdiction: Jurisdiction::Wyoming,
            formation_date: early,
            covers_through_year: 2025,
            created_at: now,
            updated_at: now,
            events: vec![event("evt_b", late)],
        };
        calendar.events[0].status = EventStatus::Actioned;

        let mut replay = event("evt_b", late);
        replay.status = EventStatus::Scheduled;
        let added = calendar.merge_events(vec![replay, event("evt_a", early)]);

        assert_eq!(added, 1);
        assert_eq!(calendar.events.len(), 2);
        assert_eq!(calendar.events[0].id, EventId("evt_a".to_string()));
        assert_eq!(calendar.events[1].status, EventStatus::Actioned);
    }
}
