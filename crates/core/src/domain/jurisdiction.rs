//! Static per-jurisdiction rule table: formation steps, fees and recurring obligations.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::compliance::ObligationType;
use crate::domain::workflow::{StepId, StepKind, StepSpec, WorkflowDefinition};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jurisdiction {
    Delaware,
    Wyoming,
    California,
}

impl Jurisdiction {
    pub const ALL: [Jurisdiction; 3] = [Self::Delaware, Self::Wyoming, Self::California];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delaware => "delaware",
            Self::Wyoming => "wyoming",
            Self::California => "california",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Delaware => "DE",
            Self::Wyoming => "WY",
            Self::California => "CA",
        }
    }

    /// Accepts either the storage name or the two-letter code, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|jurisdiction| {
            jurisdiction.as_str() == normalized
                || jurisdiction.code().eq_ignore_ascii_case(&normalized)
        })
    }
}

impl fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    Llc,
    Corporation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llc => "llc",
            Self::Corporation => "corporation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "llc" => Some(Self::Llc),
            "corporation" | "corp" | "inc" => Some(Self::Corporation),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Monthly,
    Quarterly,
    Annual,
}

impl Period {
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Annual => 12,
        }
    }

    pub fn per_year(&self) -> u32 {
        12 / self.months()
    }
}

/// When an obligation falls due within a year.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    FixedDate { month: u32, day: u32 },
    /// Due in the formation month on the given day.
    Anniversary { day: u32 },
    /// Due `month_offset` months after each period starts, on `day`.
    Periodic { period: Period, month_offset: u32, day: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationRule {
    pub code: String,
    pub obligation_type: ObligationType,
    pub title: String,
    pub schedule: Schedule,
    pub cost: Decimal,
    pub penalty: Decimal,
    pub critical: bool,
    pub automatable: bool,
    pub automation_trigger_days: u32,
    pub revenue_opportunity: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub llc_filing: Decimal,
    pub corporation_filing: Decimal,
    pub registered_agent: Decimal,
    pub state_tax_registration: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionRules {
    pub jurisdiction: Jurisdiction,
    pub display_name: String,
    pub fees: FeeSchedule,
    pub obligations: Vec<ObligationRule>,
}

impl JurisdictionRules {
    pub fn for_jurisdiction(jurisdiction: Jurisdiction) -> Self {
        match jurisdiction {
            Jurisdiction::Delaware => delaware(),
            Jurisdiction::Wyoming => wyoming(),
            Jurisdiction::California => california(),
        }
    }

    pub fn obligation(&self, code: &str) -> Option<&ObligationRule> {
        self.obligations.iter().find(|rule| rule.code == code)
    }

    /// Formation steps for `entity_kind`, in execution order.
    pub fn workflow_definition(
        &self,
        entity_kind: EntityKind,
    ) -> Result<WorkflowDefinition, DomainError> {
        let filing_fee = match entity_kind {
            EntityKind::Llc => self.fees.llc_filing,
            EntityKind::Corporation => self.fees.corporation_filing,
        };
        let (filing_name, governing_name) = match entity_kind {
            EntityKind::Llc => ("File articles of organization", "Draft operating agreement"),
            EntityKind::Corporation => ("File articles of incorporation", "Adopt corporate bylaws"),
        };

        let mut steps = vec![
            step(
                "name_check",
                StepKind::NameAvailability,
                "Check name availability",
                &[],
                1,
                Decimal::ZERO,
                true,
                true,
            ),
            step(
                "registered_agent",
                StepKind::RegisteredAgent,
                "Appoint registered agent",
                &["name_check"],
                1,
                self.fees.registered_agent,
                true,
                true,
            ),
            step(
                "formation_filing",
                StepKind::FormationFiling,
                filing_name,
                &["name_check", "registered_agent"],
                3,
                filing_fee,
                true,
                true,
            ),
            step(
                "ein_application",
                StepKind::EinApplication,
                "Apply for federal EIN",
                &["formation_filing"],
                1,
                Decimal::ZERO,
                true,
                true,
            ),
            step(
                "governing_document",
                StepKind::GoverningDocument,
                governing_name,
                &["formation_filing"],
                2,
                Decimal::ZERO,
                true,
                false,
            ),
        ];
        if let Some(fee) = self.fees.state_tax_registration {
            steps.push(step(
                "state_tax_registration",
                StepKind::StateTaxRegistration,
                "Register for state taxes",
                &["ein_application"],
                5,
                fee,
                true,
                true,
            ));
        }
        steps.push(step(
            "beneficial_ownership_report",
            StepKind::BeneficialOwnershipReport,
            "File beneficial ownership report",
            &["formation_filing"],
            1,
            Decimal::ZERO,
            true,
            false,
        ));
        steps.push(step(
            "bank_account",
            StepKind::BankAccount,
            "Open business bank account",
            &["ein_application"],
            3,
            Decimal::ZERO,
            false,
            false,
        ));

        WorkflowDefinition::new(self.jurisdiction, entity_kind, steps)
    }
}

#[allow(clippy::too_many_arguments)]
fn step(
    id: &str,
    kind: StepKind,
    name: &str,
    deps: &[&str],
    nominal_duration_days: u32,
    nominal_cost: Decimal,
    automatable: bool,
    critical: bool,
) -> StepSpec {
    StepSpec {
        id: StepId::from(id),
        kind,
        name: name.to_string(),
        dependency_ids: deps.iter().map(|dep| StepId::from(*dep)).collect(),
        nominal_duration_days,
        nominal_cost,
        automatable,
        critical,
    }
}

#[allow(clippy::too_many_arguments)]
fn obligation(
    code: &str,
    obligation_type: ObligationType,
    title: &str,
    schedule: Schedule,
    cost: Decimal,
    penalty: Decimal,
    critical: bool,
    automatable: bool,
    automation_trigger_days: u32,
    revenue_opportunity: Decimal,
) -> ObligationRule {
    ObligationRule {
        code: code.to_string(),
        obligation_type,
        title: title.to_string(),
        schedule,
        cost,
        penalty,
        critical,
        automatable,
        automation_trigger_days,
        revenue_opportunity,
    }
}

fn usd(whole: i64) -> Decimal {
    Decimal::new(whole * 100, 2)
}

fn delaware() -> JurisdictionRules {
    JurisdictionRules {
        jurisdiction: Jurisdiction::Delaware,
        display_name: "Delaware".to_string(),
        fees: FeeSchedule {
            llc_filing: usd(110),
            corporation_filing: usd(109),
            registered_agent: usd(50),
            state_tax_registration: Some(usd(75)),
        },
        obligations: vec![
            obligation(
                "de_franchise_tax",
                ObligationType::TaxFiling,
                "Delaware annual franchise tax",
                Schedule::FixedDate { month: 6, day: 1 },
                usd(300),
                usd(200),
                true,
                true,
                45,
                usd(99),
            ),
            obligation(
                "de_withholding_return",
                ObligationType::TaxFiling,
                "Delaware quarterly withholding return",
                Schedule::Periodic { period: Period::Quarterly, month_offset: 3, day: 30 },
                Decimal::ZERO,
                usd(50),
                true,
                true,
                20,
                usd(25),
            ),
            obligation(
                "de_registered_agent",
                ObligationType::RegisteredAgentRenewal,
                "Registered agent renewal",
                Schedule::Anniversary { day: 1 },
                usd(50),
                Decimal::ZERO,
                true,
                true,
                30,
                usd(39),
            ),
        ],
    }
}

fn wyoming() -> JurisdictionRules {
    JurisdictionRules {
        jurisdiction: Jurisdiction::Wyoming,
        display_name: "Wyoming".to_string(),
        fees: FeeSchedule {
            llc_filing: usd(100),
            corporation_filing: usd(100),
            registered_agent: usd(25),
            state_tax_registration: None,
        },
        obligations: vec![
            obligation(
                "wy_annual_report",
                ObligationType::AnnualReport,
                "Wyoming annual report",
                Schedule::Anniversary { day: 1 },
                usd(60),
                usd(50),
                true,
                true,
                45,
                usd(49),
            ),
            obligation(
                "wy_registered_agent",
                ObligationType::RegisteredAgentRenewal,
                "Registered agent renewal",
                Schedule::Anniversary { day: 1 },
                usd(25),
                Decimal::ZERO,
                true,
                true,
                30,
                usd(39),
            ),
        ],
    }
}

fn california() -> JurisdictionRules {
    JurisdictionRules {
        jurisdiction: Jurisdiction::California,
        display_name: "California".to_string(),
        fees: FeeSchedule {
            llc_filing: usd(70),
            corporation_filing: usd(100),
            registered_agent: usd(50),
            state_tax_registration: Some(usd(0)),
        },
        obligations: vec![
            obligation(
                "ca_statement_of_information",
                ObligationType::AnnualReport,
                "California statement of information",
                Schedule::Anniversary { day: 15 },
                usd(20),
                usd(250),
                true,
                true,
                60,
                usd(49),
            ),
            obligation(
                "ca_franchise_tax",
                ObligationType::TaxFiling,
                "California annual franchise tax",
                Schedule::FixedDate { month: 4, day: 15 },
                usd(800),
                usd(250),
                true,
                true,
                45,
                usd(99),
            ),
            obligation(
                "ca_sales_tax_return",
                ObligationType::TaxFiling,
                "California quarterly sales and use tax return",
                Schedule::Periodic { period: Period::Quarterly, month_offset: 3, day: 31 },
                Decimal::ZERO,
                usd(50),
                true,
                true,
                20,
                usd(25),
            ),
            obligation(
                "ca_payroll_deposit",
                ObligationType::TaxFiling,
                "California payroll tax deposit",
                Schedule::Periodic { period: Period::Monthly, month_offset: 1, day: 15 },
                Decimal::ZERO,
                usd(100),
                true,
                false,
                0,
                Decimal::ZERO,
            ),
            obligation(
                "ca_business_license",
                ObligationType::LicenseRenewal,
                "City business license renewal",
                Schedule::FixedDate { month: 1, day: 31 },
                usd(100),
                usd(75),
                false,
                true,
                30,
                usd(79),
            ),
        ],
    }
}
